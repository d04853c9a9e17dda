//! Persistent vector storage for embedding records.
//!
//! The [`VectorIndex`] trait abstracts over storage backends so the builder
//! and query service never depend on a specific database. One backend is
//! provided: [`sqlite::SqliteVectorIndex`], sqlite with vector search via
//! `sqlite-vec`.
//!
//! Records are keyed by `(entity_id, ordinal)`; upserts with the same key
//! replace the stored row, which is what makes interrupted builds safe to
//! re-run.

pub mod sqlite;

pub use sqlite::SqliteVectorIndex;

use async_trait::async_trait;

use crate::types::{EmbeddingRecord, IndexError, IndexState};

/// Metadata fields a query may project alongside each match.
const PROJECTABLE_FIELDS: [&str; 4] = ["entity_name", "exchange", "form_type", "content"];

/// Key columns every match carries implicitly. Some backends reject key
/// columns inside the optional projection list, so requesting one here is a
/// configuration error, raised when the projection is constructed rather than at
/// query time in production.
const KEY_FIELDS: [&str; 3] = ["id", "entity_id", "ordinal"];

/// Validated whitelist of metadata fields to return with query matches.
#[derive(Clone, Debug)]
pub struct MetadataProjection {
    fields: Vec<String>,
}

impl MetadataProjection {
    /// Builds a projection from field names, validating eagerly.
    pub fn new<I, S>(fields: I) -> Result<Self, IndexError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        for field in &fields {
            if KEY_FIELDS.contains(&field.as_str()) {
                return Err(IndexError::Config(format!(
                    "projection must not request key column '{field}'; \
                     keys are always returned with every match"
                )));
            }
            if !PROJECTABLE_FIELDS.contains(&field.as_str()) {
                return Err(IndexError::Config(format!(
                    "unknown projection field '{field}'; known fields: {}",
                    PROJECTABLE_FIELDS.join(", ")
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Projection carrying only the entity display name.
    pub fn entity_names() -> Self {
        Self {
            fields: vec!["entity_name".to_string()],
        }
    }

    /// Empty projection: matches carry keys and scores only.
    pub fn none() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// One raw match from a similarity query, before per-entity deduplication.
#[derive(Clone, Debug)]
pub struct PassageMatch {
    pub entity_id: String,
    pub ordinal: usize,
    /// Cosine similarity against the query vector.
    pub score: f32,
    /// Projected metadata fields, keyed by field name.
    pub metadata: serde_json::Value,
}

/// Durable store of embedding records with similarity search.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Current lifecycle state, from the store's meta table. Cheap: never
    /// loads the index itself.
    async fn state(&self) -> Result<IndexState, IndexError>;

    /// Persists a lifecycle transition.
    async fn set_state(&self, state: IndexState) -> Result<(), IndexError>;

    /// `true` once a build has completed against this store.
    async fn exists(&self) -> Result<bool, IndexError> {
        Ok(self.state().await? == IndexState::Ready)
    }

    /// Vector dimension this store was created with.
    async fn dimensions(&self) -> Result<usize, IndexError>;

    /// Inserts or replaces records, keyed by `(entity_id, ordinal)`.
    /// Atomic per call: either every record lands or none do.
    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<(), IndexError>;

    /// Returns up to `top_k` passages ranked by similarity to `vector`.
    /// An empty store yields an empty result, not an error.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        projection: &MetadataProjection,
    ) -> Result<Vec<PassageMatch>, IndexError>;

    /// Total stored records.
    async fn count(&self) -> Result<usize, IndexError>;

    /// Distinct entity identifiers present in the store, sorted.
    async fn entity_ids(&self) -> Result<Vec<String>, IndexError>;
}
