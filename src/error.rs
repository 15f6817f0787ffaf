//! Error taxonomy for the recommendation pipeline.
//!
//! Infrastructure failures (stores, catalog) are recovered inside the
//! pipeline and only show up in logs. Content failures (unparseable or
//! invalid generated text) never leave the normalizer. What remains here is
//! what a caller can act on.

use thiserror::Error;

/// Errors surfaced by [`crate::pipeline::Pipeline`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Nothing cached and this caller may not trigger generation.
    #[error("no cached recommendations for this artist yet")]
    NotCached,
    #[error("generation limit reached ({limit} per account)")]
    QuotaExceeded { limit: u32 },
    /// Quota backend unreadable; the gate fails closed.
    #[error("generation is temporarily unavailable (quota could not be verified)")]
    QuotaUnavailable,
    #[error("generation failed for {subject}: {reason}")]
    Generation { subject: String, reason: String },
    /// An earlier attempt failed and no retry was requested.
    #[error("generation previously failed for {subject}: {reason} (force a refresh to retry)")]
    PreviousFailure { subject: String, reason: String },
    /// Another request is generating this subject and did not finish in time.
    #[error("recommendations are still being generated, try again shortly")]
    NotYetAvailable,
    #[error("no artist given")]
    EmptySubject,
    /// Ingested data that decodes to nothing usable.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl PipelineError {
    /// HTTP status an API layer should map this to.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::NotCached => 404,
            PipelineError::QuotaExceeded { .. } => 403,
            PipelineError::QuotaUnavailable => 503,
            PipelineError::Generation { .. } | PipelineError::PreviousFailure { .. } => 502,
            PipelineError::NotYetAvailable => 202,
            PipelineError::EmptySubject | PipelineError::InvalidPayload(_) => 400,
        }
    }
}

/// Persistence backend failure. Never escapes the cache or quota layers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Catalog lookup failure.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog credentials missing")]
    MissingCredentials,
    #[error("catalog http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("catalog response invalid: {0}")]
    InvalidResponse(String),
}

/// Generative-text service failure. Distinct from a valid empty answer.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("no API key configured; set OPENROUTER_API_KEY or run `encore setup`")]
    MissingApiKey,
    #[error("invalid API key")]
    Unauthorized,
    #[error("rate limited by provider after {retries} retries")]
    RateLimited { retries: u32 },
    #[error("provider returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider response invalid: {0}")]
    InvalidResponse(String),
    #[error("generation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_surface_contract() {
        assert_eq!(PipelineError::NotCached.status_code(), 404);
        assert_eq!(PipelineError::QuotaExceeded { limit: 3 }.status_code(), 403);
        assert_eq!(PipelineError::QuotaUnavailable.status_code(), 503);
    }

    #[test]
    fn quota_message_names_limit() {
        let msg = PipelineError::QuotaExceeded { limit: 3 }.to_string();
        assert!(msg.contains('3'));
    }
}
