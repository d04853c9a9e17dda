//! Environment-driven configuration for the indexing pipeline.
//!
//! Values are resolved once at startup (`.env` files are honored via
//! [`dotenvy`]) and validated eagerly: a bad configuration fails before any
//! network or disk work begins, never mid-run.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::IndexError;

/// Tunable settings for building and querying the filing index.
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Company name reported in the SEC `User-Agent` header.
    pub company_name: String,
    /// Contact email required by the SEC access policy. A blank value is a
    /// startup configuration error, not a per-entity condition.
    pub contact_email: String,
    /// Path of the sqlite vector store.
    pub db_path: PathBuf,
    /// Directory for cached candidate lists and downloaded filings.
    /// `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Base URL of the embeddings API (OpenAI-compatible).
    pub embed_api_base: String,
    /// API key for the embeddings service.
    pub embed_api_key: String,
    /// Embedding model identifier.
    pub embed_model: String,
    /// Vector dimension produced by the model.
    pub dimensions: usize,
    /// Maximum items per embedding API call.
    pub embed_batch_max: usize,
    /// Maximum characters per embedded item; longer inputs are truncated.
    pub embed_max_chars: usize,
    /// Maximum characters per extracted passage.
    pub max_passage_chars: usize,
    /// Character overlap between consecutive passages.
    pub passage_overlap_chars: usize,
    /// Bounded worker pool size for build-time fetch/extract work.
    pub workers: usize,
    /// Entities accumulated before a batch is flushed through embed + upsert.
    pub batch_size: usize,
    /// Progress event cadence, in processed entities.
    pub progress_interval: usize,
    /// Minimum similarity for a query match to be returned.
    pub min_relevance: f32,
    /// Raw matches fetched per requested result, to survive per-entity dedup.
    pub overfetch_factor: usize,
    /// Additional attempts after the first failure of a network call.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub backoff_base_ms: u64,
    /// Per-request timeout for all outbound HTTP.
    pub request_timeout: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            company_name: "sector-index".to_string(),
            contact_email: String::new(),
            db_path: PathBuf::from("./sector_index.sqlite"),
            cache_dir: Some(PathBuf::from("./sector_index_cache")),
            embed_api_base: "https://api.openai.com/v1".to_string(),
            embed_api_key: String::new(),
            embed_model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            embed_batch_max: 64,
            embed_max_chars: 30_000,
            max_passage_chars: 4_000,
            passage_overlap_chars: 400,
            workers: 4,
            batch_size: 32,
            progress_interval: 10,
            min_relevance: 0.5,
            overfetch_factor: 4,
            max_retries: 3,
            backoff_base_ms: 1_000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl IndexConfig {
    /// Resolves configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            company_name: env_string("SEC_COMPANY_NAME", defaults.company_name),
            contact_email: env_string("SEC_CONTACT_EMAIL", defaults.contact_email),
            db_path: match env_string("SECTOR_INDEX_DB", String::new()).as_str() {
                "" => defaults.db_path,
                path => PathBuf::from(path),
            },
            cache_dir: match env_string("SECTOR_INDEX_CACHE", String::new()).as_str() {
                "" => defaults.cache_dir,
                "off" => None,
                path => Some(PathBuf::from(path)),
            },
            embed_api_base: env_string("EMBED_API_BASE", defaults.embed_api_base),
            embed_api_key: env_string("OPENAI_API_KEY", defaults.embed_api_key),
            embed_model: env_string("EMBED_MODEL", defaults.embed_model),
            dimensions: env_parse("EMBED_DIMENSIONS", defaults.dimensions),
            embed_batch_max: env_parse("EMBED_BATCH_MAX", defaults.embed_batch_max),
            embed_max_chars: env_parse("EMBED_MAX_CHARS", defaults.embed_max_chars),
            max_passage_chars: env_parse("MAX_PASSAGE_CHARS", defaults.max_passage_chars),
            passage_overlap_chars: env_parse("PASSAGE_OVERLAP", defaults.passage_overlap_chars),
            workers: env_parse("BUILD_WORKERS", defaults.workers),
            batch_size: env_parse("BATCH_SIZE", defaults.batch_size),
            progress_interval: env_parse("PROGRESS_INTERVAL", defaults.progress_interval),
            min_relevance: env_parse("MIN_RELEVANCE", defaults.min_relevance),
            overfetch_factor: env_parse("OVERFETCH_FACTOR", defaults.overfetch_factor),
            max_retries: env_parse("MAX_RETRIES", defaults.max_retries),
            backoff_base_ms: env_parse("BACKOFF_BASE_MS", defaults.backoff_base_ms),
            request_timeout: Duration::from_secs(env_parse(
                "REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )),
        }
    }

    /// Checks invariants that would otherwise surface mid-run.
    ///
    /// The contact email is a registry access precondition and is validated
    /// here rather than per entity.
    pub fn validate(&self) -> Result<(), IndexError> {
        if self.contact_email.trim().is_empty() || !self.contact_email.contains('@') {
            return Err(IndexError::Config(
                "SEC_CONTACT_EMAIL must be set to a valid contact address; \
                 the registry rejects unidentified clients"
                    .to_string(),
            ));
        }
        if self.company_name.trim().is_empty() {
            return Err(IndexError::Config(
                "SEC_COMPANY_NAME must not be empty".to_string(),
            ));
        }
        if self.dimensions == 0 {
            return Err(IndexError::Config(
                "embedding dimension must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(IndexError::Config(
                "worker pool size must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 || self.embed_batch_max == 0 {
            return Err(IndexError::Config(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        if self.overfetch_factor == 0 {
            return Err(IndexError::Config(
                "overfetch factor must be at least 1".to_string(),
            ));
        }
        if self.passage_overlap_chars >= self.max_passage_chars {
            return Err(IndexError::Config(
                "passage overlap must be smaller than the passage size".to_string(),
            ));
        }
        Ok(())
    }

    /// `User-Agent` value in the form the SEC access policy expects.
    pub fn user_agent(&self) -> String {
        format!("{} ({})", self.company_name.trim(), self.contact_email.trim())
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> IndexConfig {
        IndexConfig {
            contact_email: "indexer@example.com".to_string(),
            ..IndexConfig::default()
        }
    }

    #[test]
    fn default_config_rejects_missing_contact() {
        let err = IndexConfig::default().validate().unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn zero_workers_rejected() {
        let config = IndexConfig {
            workers: 0,
            ..valid_config()
        };
        assert!(matches!(
            config.validate(),
            Err(IndexError::Config(message)) if message.contains("worker")
        ));
    }

    #[test]
    fn overlap_must_fit_inside_passage() {
        let config = IndexConfig {
            max_passage_chars: 100,
            passage_overlap_chars: 100,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn user_agent_carries_contact() {
        let config = valid_config();
        assert_eq!(config.user_agent(), "sector-index (indexer@example.com)");
    }
}
