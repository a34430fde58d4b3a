//! AI provider abstraction.
//!
//! Every component that talks to a model (the extraction adapters, the
//! commit engine's embedding step, the correction path and the answering
//! engine) receives an explicitly constructed `Arc<dyn AiProvider>`. There
//! is no global client; tests substitute their own implementation.
//!
//! # Retry Strategy
//!
//! HTTP calls use exponential backoff, with a [`RetryPolicy`] per call site:
//! - Network errors → retry (both policies)
//! - HTTP 429 (rate limited) and 5xx (server error) → retry for embeddings,
//!   fail immediately for chat so the pipeline can mark the document failed
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Error messages always carry the HTTP status so the pipeline's error
//! classifier can tell rate-limit and auth failures from network blips.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::time::Duration;

use crate::config::{EmbeddingConfig, LlmConfig};
use crate::embedding;
use crate::llm;

/// Stream of incremental text tokens from a chat completion.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// A single chat completion request: one system and one user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    /// Ask the provider for a JSON object response.
    pub json: bool,
}

impl ChatRequest {
    pub fn json(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            json: true,
        }
    }
}

#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Run a completion and return the full response text.
    async fn complete(&self, request: &ChatRequest) -> Result<String>;

    /// Run a completion, yielding text tokens as they arrive.
    async fn complete_streaming(&self, request: &ChatRequest) -> Result<TokenStream>;

    /// Embed a batch of texts; one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Provider backed by the configured HTTP chat and embedding endpoints.
pub struct HttpProvider {
    llm: LlmConfig,
    embedding: EmbeddingConfig,
}

impl HttpProvider {
    pub fn new(llm: &LlmConfig, embedding: &EmbeddingConfig) -> Result<Self> {
        for provider in [llm.provider.as_str(), embedding.provider.as_str()] {
            if provider == "openai" && std::env::var("OPENAI_API_KEY").is_err() {
                bail!("OPENAI_API_KEY environment variable not set");
            }
        }
        Ok(Self {
            llm: llm.clone(),
            embedding: embedding.clone(),
        })
    }
}

#[async_trait]
impl AiProvider for HttpProvider {
    async fn complete(&self, request: &ChatRequest) -> Result<String> {
        llm::complete(&self.llm, request).await
    }

    async fn complete_streaming(&self, request: &ChatRequest) -> Result<TokenStream> {
        llm::complete_streaming(&self.llm, request).await
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.embedding.batch_size.max(1)) {
            let part = embedding::embed_texts(&self.embedding, batch).await?;
            if part.len() != batch.len() {
                bail!(
                    "Embedding provider returned {} vectors for {} texts",
                    part.len(),
                    batch.len()
                );
            }
            if let Some(dims) = self.embedding.dims {
                if let Some(bad) = part.iter().find(|v| v.len() != dims) {
                    bail!(
                        "Embedding provider returned {} dimensions, expected {}",
                        bad.len(),
                        dims
                    );
                }
            }
            vectors.extend(part);
        }
        Ok(vectors)
    }
}

/// A provider that refuses every call.
///
/// Used when neither chat nor embeddings are configured, so commands that
/// never reach the model (listing, verification) still work.
pub struct DisabledProvider;

#[async_trait]
impl AiProvider for DisabledProvider {
    async fn complete(&self, _request: &ChatRequest) -> Result<String> {
        bail!("LLM provider is disabled. Set [llm] provider in config.")
    }

    async fn complete_streaming(&self, _request: &ChatRequest) -> Result<TokenStream> {
        bail!("LLM provider is disabled. Set [llm] provider in config.")
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.")
    }
}

pub fn create_provider(
    llm: &LlmConfig,
    embedding: &EmbeddingConfig,
) -> Result<Box<dyn AiProvider>> {
    if !llm.is_enabled() && !embedding.is_enabled() {
        return Ok(Box::new(DisabledProvider));
    }
    Ok(Box::new(HttpProvider::new(llm, embedding)?))
}

/// Which failures [`post_with_retry`] tries again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RetryPolicy {
    /// Network failures only. Rate limits and server errors are returned
    /// at once.
    NetworkOnly,
    /// Network failures, rate limits and server errors.
    Backoff,
}

impl RetryPolicy {
    fn retries_status(self, status: reqwest::StatusCode) -> bool {
        match self {
            RetryPolicy::NetworkOnly => false,
            RetryPolicy::Backoff => status.as_u16() == 429 || status.is_server_error(),
        }
    }
}

/// POST a JSON body, retrying whatever `policy` allows.
///
/// Returns the successful response so callers can read it as JSON or as a
/// byte stream.
pub(crate) async fn post_with_retry(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    max_retries: u32,
    policy: RetryPolicy,
    label: &str,
) -> Result<reqwest::Response> {
    let mut last_err = None;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tracing::debug!(label, attempt, "retrying after {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        let mut req = client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = bearer {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response);
                }

                let body_text = response.text().await.unwrap_or_default();
                if policy.retries_status(status) {
                    last_err = Some(anyhow::anyhow!(
                        "{} API error {}: {}",
                        label,
                        status,
                        body_text
                    ));
                    continue;
                }

                bail!("{} API error {}: {}", label, status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!("{} connection error: {}", label, e));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{} request failed after retries", label)))
}

pub(crate) fn openai_key() -> Result<String> {
    std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_provider_refuses() {
        let p = DisabledProvider;
        let err = p
            .complete(&ChatRequest::json("sys", "user"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disabled"));
        assert!(p.embed(&["x".to_string()]).await.is_err());
    }

    #[test]
    fn test_chat_policy_never_retries_statuses() {
        use reqwest::StatusCode;
        for status in [StatusCode::TOO_MANY_REQUESTS, StatusCode::SERVICE_UNAVAILABLE] {
            assert!(!RetryPolicy::NetworkOnly.retries_status(status));
            assert!(RetryPolicy::Backoff.retries_status(status));
        }
        assert!(!RetryPolicy::Backoff.retries_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_create_provider_disabled_by_default() {
        let p = create_provider(&LlmConfig::default(), &EmbeddingConfig::default());
        assert!(p.is_ok());
    }
}
