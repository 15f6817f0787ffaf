use super::models::{Model, Usage};
use super::TextGenerator;
use crate::error::GenerationError;
use crate::util::truncate_str;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// OpenRouter direct API URL (BYOK mode)
const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Rate limit retry configuration
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

/// Response from the provider including content and usage stats
#[derive(Debug)]
pub struct LlmResponse {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: Option<Usage>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Generative-text service backed by OpenRouter chat completions.
#[derive(Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    api_key: String,
    model: Model,
    url: String,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>, model: Model) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model,
            url: OPENROUTER_URL.to_string(),
        }
    }

    /// Client for the configured key; `MissingApiKey` when none is set.
    pub fn from_key(api_key: Option<String>, model: Model) -> Result<Self, GenerationError> {
        let key = api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or(GenerationError::MissingApiKey)?;
        Ok(Self::new(key, model))
    }

    /// Point at another OpenAI-compatible endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// Call the API with automatic retry and exponential backoff on rate limits.
    pub async fn complete(&self, system: &str, user: &str) -> Result<LlmResponse, GenerationError> {
        let request = ChatRequest {
            model: self.model.id(),
            messages: [
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.model.max_tokens(),
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let response = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("HTTP-Referer", "https://encore.fm")
                .header("X-Title", "Encore")
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await?;

            let status = response.status().as_u16();
            let text = response.text().await?;

            if (200..300).contains(&status) {
                return parse_response(&text);
            }

            if status == 429 && retry_count < MAX_RETRIES {
                retry_count += 1;
                let retry_after = parse_retry_after(&text).unwrap_or_else(|| {
                    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry_count - 1)) / 1000
                });
                tracing::warn!(
                    retry_after_secs = retry_after,
                    attempt = retry_count,
                    max = MAX_RETRIES,
                    "OpenRouter rate limited, retrying"
                );
                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                continue;
            }

            return Err(status_error(status, &text, retry_count));
        }
    }
}

#[async_trait]
impl TextGenerator for OpenRouterClient {
    async fn generate(&self, system: &str, user: &str) -> Result<String, GenerationError> {
        let response = self.complete(system, user).await?;
        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %response.model,
                tokens = usage.total_tokens,
                cost = usage.cost(),
                "generation usage"
            );
        }
        Ok(response.content)
    }
}

fn parse_response(text: &str) -> Result<LlmResponse, GenerationError> {
    let parsed: ChatResponse = serde_json::from_str(text).map_err(|e| {
        GenerationError::InvalidResponse(format!("{}: {}", e, truncate_str(text, 200)))
    })?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GenerationError::InvalidResponse("no choices in response".into()))?;
    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        usage: parsed.usage,
        model: parsed.model.unwrap_or_default(),
    })
}

/// Map a non-success status to an error the pipeline can tell apart from
/// a valid empty answer.
fn status_error(status: u16, text: &str, retries: u32) -> GenerationError {
    match status {
        401 | 403 => GenerationError::Unauthorized,
        429 => GenerationError::RateLimited { retries },
        _ => GenerationError::HttpStatus {
            status,
            body: truncate_str(text, 200).to_string(),
        },
    }
}

/// Extract a retry-after hint ("retry after 12 seconds") from a response body.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}
