//! Extraction stream adapters.
//!
//! Both adapters ([`DomainClassifier`] and [`KnowledgeExtractor`]) have the
//! same shape: build a JSON-mode chat request, stream the raw tokens to a
//! [`TokenSink`] as they arrive, and parse the accumulated text once the
//! stream ends. Parsing happens exactly once, at the end; a response that
//! is not the expected JSON shape is a [`PipelineError::Parse`] and is not
//! retried here.

mod domains;
mod knowledge;

pub use domains::{DomainClassification, DomainClassifier};
pub use knowledge::{CodeContext, KnowledgeExtraction, KnowledgeExtractor};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;

use crate::errors::PipelineError;
use crate::models::truncate_chars;
use crate::provider::{AiProvider, ChatRequest};

/// Receives raw model output as it streams in.
#[async_trait]
pub trait TokenSink: Send {
    async fn token(&mut self, text: &str);
}

#[async_trait]
impl TokenSink for Vec<String> {
    async fn token(&mut self, text: &str) {
        self.push(text.to_string());
    }
}

/// The literal prompt an adapter is about to send, for display.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptInfo {
    pub description: String,
    pub technical: String,
}

impl PromptInfo {
    pub(crate) fn new(description: impl Into<String>, request: &ChatRequest) -> Self {
        Self {
            description: description.into(),
            technical: format!("[system]\n{}\n\n[user]\n{}", request.system, request.user),
        }
    }
}

/// Stream a completion into `sink` and parse the accumulated text as `T`.
pub async fn stream_json<T: DeserializeOwned>(
    provider: &dyn AiProvider,
    request: &ChatRequest,
    sink: &mut dyn TokenSink,
    raw_prefix_chars: usize,
) -> Result<T, PipelineError> {
    let mut stream = provider
        .complete_streaming(request)
        .await
        .map_err(PipelineError::provider)?;

    let mut raw = String::new();
    while let Some(token) = stream.next().await {
        let token = token.map_err(PipelineError::provider)?;
        sink.token(&token).await;
        raw.push_str(&token);
    }

    parse_json(&raw, raw_prefix_chars)
}

/// Parse a model response as JSON, tolerating a surrounding code fence.
pub fn parse_json<T: DeserializeOwned>(raw: &str, raw_prefix_chars: usize) -> Result<T, PipelineError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|e| PipelineError::Parse {
        message: e.to_string(),
        raw_prefix: truncate_chars(raw, raw_prefix_chars),
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
