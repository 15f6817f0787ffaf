//! Generative-text service: the trait the pipeline calls and its OpenRouter
//! implementation.
//!
//! A provider error (auth, rate limit, transport) is a [`GenerationError`];
//! an answer saying nothing was found is a successful, possibly empty, string.

mod client;
pub mod models;
pub mod prompts;

pub use client::{LlmResponse, OpenRouterClient};
pub use models::{Model, Usage};

use crate::error::GenerationError;
use async_trait::async_trait;

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Raw text for a system/user prompt pair. May be prose, fenced JSON or JSON.
    async fn generate(&self, system: &str, user: &str) -> Result<String, GenerationError>;
}
