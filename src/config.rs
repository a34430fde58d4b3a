//! TOML configuration.
//!
//! Everything except the database path and the server bind address has a
//! default, so a minimal `kbc.toml` only needs:
//!
//! ```toml
//! [db]
//! path = "./data/kb.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:7340"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub commit: CommitConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub correction: CorrectionConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub errors: ErrorsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a writer waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Nominal window size in characters.
    pub chunk_size: usize,
    pub overlap: usize,
    /// Chunks whose trimmed content is not longer than this are dropped.
    pub min_chunk_chars: usize,
    /// Radius around the nominal window end searched for a boundary.
    pub search_window: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            overlap: 200,
            min_chunk_chars: 50,
            search_window: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Documents longer than this are sent to the knowledge extractor in batches.
    pub batch_threshold: usize,
    pub batch_overlap: usize,
    /// How much of an unparseable AI response is kept for diagnostics.
    pub raw_prefix_chars: usize,
    /// Capacity of the processing event channel.
    pub channel_capacity: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_threshold: 1000,
            batch_overlap: 100,
            raw_prefix_chars: 500,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CommitConfig {
    pub chunk_batch_size: usize,
    pub secondary_domain_factor: f64,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            chunk_batch_size: 5,
            secondary_domain_factor: 0.8,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rule_limit: i64,
    pub qa_limit: i64,
    pub citation_count: usize,
    pub citation_excerpt_chars: usize,
    pub max_query_chars: usize,
    pub max_limit: usize,
    pub default_limit: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            rule_limit: 10,
            qa_limit: 5,
            citation_count: 3,
            citation_excerpt_chars: 200,
            max_query_chars: 2000,
            max_limit: 50,
            default_limit: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Number of most recent active rules offered to the model as match candidates.
    pub candidate_rules: i64,
    /// Share of the old rule's significant words a chunk must contain to be purged.
    pub overlap_threshold: f64,
    /// Minimum length (in characters) of a significant word.
    pub min_word_chars: usize,
    pub add_confidence: f64,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            candidate_rules: 100,
            overlap_threshold: 0.3,
            min_word_chars: 4,
            add_confidence: 0.9,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub model: Option<String>,
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            timeout_secs: 120,
            max_retries: 2,
            temperature: 0.1,
        }
    }
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ErrorsConfig {
    /// Case-insensitive substrings that mark a provider error as fatal.
    #[serde(default = "default_fatal_markers")]
    pub fatal_markers: Vec<String>,
}

impl Default for ErrorsConfig {
    fn default() -> Self {
        Self {
            fatal_markers: default_fatal_markers(),
        }
    }
}

pub fn default_fatal_markers() -> Vec<String> {
    [
        "401",
        "403",
        "429",
        "400",
        "500",
        "502",
        "503",
        "unauthorized",
        "authentication",
        "invalid api key",
        "invalid_api_key",
        "quota",
        "rate limit",
        "rate_limit",
        "too many requests",
        "bad request",
        "invalid_request",
        "internal server error",
        "bad gateway",
        "service unavailable",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_stale_after")]
    pub stale_after_minutes: i64,
}

fn default_rate_limit() -> u32 {
    30
}
fn default_stale_after() -> i64 {
    30
}

impl Config {
    /// A config with every default applied, pointing at the given database.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                max_connections: default_max_connections(),
                busy_timeout_ms: default_busy_timeout_ms(),
            },
            chunking: ChunkingConfig::default(),
            extraction: ExtractionConfig::default(),
            commit: CommitConfig::default(),
            retrieval: RetrievalConfig::default(),
            correction: CorrectionConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            errors: ErrorsConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7340".to_string(),
                rate_limit_per_minute: default_rate_limit(),
                stale_after_minutes: default_stale_after(),
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.db.max_connections == 0 {
            anyhow::bail!("db.max_connections must be >= 1");
        }

        let c = &self.chunking;
        if c.overlap == 0 {
            anyhow::bail!("chunking.overlap must be > 0");
        }
        if c.chunk_size <= c.overlap {
            anyhow::bail!("chunking.chunk_size must be greater than chunking.overlap");
        }

        let e = &self.extraction;
        if e.batch_threshold <= e.batch_overlap {
            anyhow::bail!("extraction.batch_threshold must be greater than extraction.batch_overlap");
        }
        if e.channel_capacity == 0 {
            anyhow::bail!("extraction.channel_capacity must be > 0");
        }

        if self.commit.chunk_batch_size == 0 {
            anyhow::bail!("commit.chunk_batch_size must be > 0");
        }

        let t = self.correction.overlap_threshold;
        if !(t > 0.0 && t <= 1.0) {
            anyhow::bail!("correction.overlap_threshold must be in (0.0, 1.0]");
        }

        if self.retrieval.max_limit == 0 || self.retrieval.top_k == 0 {
            anyhow::bail!("retrieval.max_limit and retrieval.top_k must be >= 1");
        }

        match self.llm.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown llm provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.llm.is_enabled() && self.llm.model.is_none() {
            anyhow::bail!(
                "llm.model must be specified when provider is '{}'",
                self.llm.provider
            );
        }

        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "./data/kb.sqlite"

            [server]
            bind = "127.0.0.1:7340"
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.chunking.chunk_size, 1000);
        assert_eq!(cfg.chunking.overlap, 200);
        assert_eq!(cfg.commit.chunk_batch_size, 5);
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.server.rate_limit_per_minute, 30);
        assert!(cfg.errors.fatal_markers.iter().any(|m| m == "429"));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_window() {
        let mut cfg = Config::with_db_path("kb.sqlite");
        cfg.chunking.chunk_size = 100;
        cfg.chunking.overlap = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_enabled_llm_requires_model() {
        let mut cfg = Config::with_db_path("kb.sqlite");
        cfg.llm.provider = "openai".to_string();
        assert!(cfg.validate().is_err());
        cfg.llm.model = Some("gpt-4o-mini".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_embedding_provider_rejected() {
        let mut cfg = Config::with_db_path("kb.sqlite");
        cfg.embedding.provider = "cohere".to_string();
        assert!(cfg.validate().is_err());
    }
}
