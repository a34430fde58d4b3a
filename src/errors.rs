//! Error taxonomy and the fatal/transient classifier.
//!
//! The upstream AI providers do not report errors with a uniform
//! structure, so provider failures are classified by looking for known
//! substrings (status codes, "quota", "unauthorized", ...) in their
//! message. The substring list lives in config (`[errors].fatal_markers`)
//! rather than inline in the pipeline.

use thiserror::Error;

use crate::config::ErrorsConfig;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// AI output was not the JSON shape we asked for.
    #[error("AI response could not be parsed: {message}")]
    Parse { message: String, raw_prefix: String },

    #[error("AI provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn provider(err: impl std::fmt::Display) -> Self {
        PipelineError::Provider(format!("{:#}", err))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Internal(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Must not be retried automatically; the document is marked FAILED.
    Fatal,
    /// Surfaced to the caller; the document stays retryable.
    Transient,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    markers: Vec<String>,
}

impl ErrorClassifier {
    pub fn new(config: &ErrorsConfig) -> Self {
        Self {
            markers: config
                .fatal_markers
                .iter()
                .map(|m| m.to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, err: &PipelineError) -> ErrorClass {
        match err {
            PipelineError::Provider(message) => self.classify_message(message),
            PipelineError::Internal(e) => self.classify_message(&e.to_string()),
            PipelineError::Parse { .. }
            | PipelineError::Persistence(_)
            | PipelineError::Validation(_)
            | PipelineError::NotFound(_) => ErrorClass::Transient,
        }
    }

    pub fn classify_message(&self, message: &str) -> ErrorClass {
        let lower = message.to_lowercase();
        if self.markers.iter().any(|m| lower.contains(m.as_str())) {
            ErrorClass::Fatal
        } else {
            ErrorClass::Transient
        }
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ErrorsConfig::default())
    }
}
