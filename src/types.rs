//! Core domain types shared across the indexing pipeline, plus the
//! crate-wide [`IndexError`] type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A company known to the filings registry.
///
/// Entities are produced once by the document source and never mutated
/// afterwards within a build run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Ticker symbol, used as the entity identifier throughout the index.
    pub ticker: String,
    /// SEC Central Index Key.
    pub cik: u64,
    /// Registered company name.
    pub title: String,
    /// Listing exchange, when the registry reports one.
    #[serde(default)]
    pub exchange: Option<String>,
}

impl Entity {
    pub fn new(ticker: impl Into<String>, cik: u64, title: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            cik,
            title: title.into(),
            exchange: None,
        }
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }
}

/// A raw filing document fetched for one entity.
///
/// Lives only for the duration of the extraction step; never persisted.
#[derive(Clone, Debug)]
pub struct RawDocument {
    pub entity_id: String,
    /// Filing form type the document came from (10-K, 20-F, S-1, 10-Q).
    pub form_type: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

/// A bounded slice of business-description text, ordered by document position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextPassage {
    pub entity_id: String,
    /// Zero-based position of this passage within its source document.
    pub ordinal: usize,
    pub text: String,
}

/// The unit persisted into the vector index.
///
/// Keyed by `(entity_id, ordinal)`; upserting the same key again replaces the
/// stored vector and metadata rather than duplicating them.
#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingRecord {
    pub entity_id: String,
    pub ordinal: usize,
    pub vector: Vec<f32>,
    pub entity_name: String,
    pub exchange: Option<String>,
    pub form_type: String,
    pub content: String,
}

impl EmbeddingRecord {
    /// Deterministic store key for this record.
    pub fn key(&self) -> String {
        format!("{}#{}", self.entity_id, self.ordinal)
    }
}

/// Lifecycle of the persistent index, stored in the index meta table so it
/// survives process restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexState {
    /// No build has run against this store yet.
    NotBuilt,
    /// A build is in flight; a second build must not start.
    Building,
    /// The index is complete and queryable.
    Ready,
    /// A build was interrupted; committed batches remain queryable.
    FailedPartial,
}

impl IndexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexState::NotBuilt => "not_built",
            IndexState::Building => "building",
            IndexState::Ready => "ready",
            IndexState::FailedPartial => "failed_partial",
        }
    }

    pub fn parse(value: &str) -> Result<Self, IndexError> {
        match value {
            "not_built" => Ok(IndexState::NotBuilt),
            "building" => Ok(IndexState::Building),
            "ready" => Ok(IndexState::Ready),
            "failed_partial" => Ok(IndexState::FailedPartial),
            other => Err(IndexError::Storage(format!(
                "unrecognized index state '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entity returned by a sector query, best passage score attached.
#[derive(Clone, Debug, Serialize)]
pub struct SectorMatch {
    pub entity_id: String,
    /// Cosine similarity of the best-matching passage, in `[-1, 1]`.
    pub score: f32,
    /// Projected metadata fields from the best-matching passage.
    pub metadata: serde_json::Value,
}

/// Error type used across the sector-index pipeline.
///
/// Entity-level failures (`AccessDenied`, `Fetch`, `Parse`, `Embedding`) are
/// logged and counted by the builder but never abort a run. `Storage` and
/// `Config` escalate to the caller, as does any failure to list candidates.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The registry rejected the request under its access policy.
    #[error("access denied by registry: {0}")]
    AccessDenied(String),

    /// Document or candidate-list fetch failed after bounded retries.
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// The document could not be parsed into usable text.
    #[error("parse failed: {0}")]
    Parse(String),

    /// The embedding service failed persistently.
    #[error("embedding service error: {0}")]
    Embedding(String),

    /// The persistence layer is unavailable or rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration detected at startup, never mid-run.
    #[error("configuration error: {0}")]
    Config(String),

    /// Another build holds the in-progress marker on this store.
    #[error("an index build is already in progress against this store")]
    BuildInProgress,

    #[error("io error: {0}")]
    Io(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<std::io::Error> for IndexError {
    fn from(err: std::io::Error) -> Self {
        IndexError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_key_is_entity_and_ordinal() {
        let record = EmbeddingRecord {
            entity_id: "NVDA".to_string(),
            ordinal: 2,
            vector: vec![0.0; 4],
            entity_name: "NVIDIA CORP".to_string(),
            exchange: None,
            form_type: "10-K".to_string(),
            content: "...".to_string(),
        };
        assert_eq!(record.key(), "NVDA#2");
    }

    #[test]
    fn index_state_round_trips() {
        for state in [
            IndexState::NotBuilt,
            IndexState::Building,
            IndexState::Ready,
            IndexState::FailedPartial,
        ] {
            assert_eq!(IndexState::parse(state.as_str()).unwrap(), state);
        }
        assert!(IndexState::parse("bogus").is_err());
    }
}
