//! Query-time retrieval: free-text sector description in, ranked entity
//! identifiers out.
//!
//! The service embeds the query once, over-fetches passage matches from the
//! store, collapses them to one score per entity (the best passage wins),
//! drops everything under the relevance floor and returns the survivors in
//! descending score order.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::IndexConfig;
use crate::embed::EmbeddingProvider;
use crate::store::{MetadataProjection, VectorIndex};
use crate::types::{IndexError, SectorMatch};

/// Tuning for [`SectorQueryService`].
#[derive(Clone, Debug)]
pub struct QueryOptions {
    /// Matches scoring below this are discarded.
    pub min_relevance: f32,
    /// Passage matches fetched per requested entity, to survive
    /// per-entity deduplication.
    pub overfetch_factor: usize,
    /// Metadata columns carried back on each match.
    pub projection: MetadataProjection,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            min_relevance: 0.5,
            overfetch_factor: 4,
            projection: MetadataProjection::entity_names(),
        }
    }
}

impl QueryOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            min_relevance: config.min_relevance,
            overfetch_factor: config.overfetch_factor,
            ..Self::default()
        }
    }
}

/// Read-side companion to the index builder.
pub struct SectorQueryService {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorIndex>,
    options: QueryOptions,
}

impl std::fmt::Debug for SectorQueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorQueryService")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SectorQueryService {
    /// Binds the service to a store, verifying up front that the embedder
    /// and the store agree on vector dimensions.
    pub async fn connect(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorIndex>,
        options: QueryOptions,
    ) -> Result<Self, IndexError> {
        let store_dims = store.dimensions().await?;
        if store_dims != embedder.dimensions() {
            return Err(IndexError::Config(format!(
                "embedder produces {}-dim vectors, store expects {store_dims}",
                embedder.dimensions()
            )));
        }
        Ok(Self {
            embedder,
            store,
            options,
        })
    }

    /// Returns up to `top_k` entities whose indexed filings best match the
    /// free-text `sector` description.
    pub async fn find_entities(
        &self,
        sector: &str,
        top_k: usize,
    ) -> Result<Vec<SectorMatch>, IndexError> {
        if top_k == 0 || sector.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query = vec![sector.to_string()];
        let mut vectors = self.embedder.embed_batch(&query).await?;
        let vector = vectors.pop().ok_or_else(|| {
            IndexError::Embedding("provider returned no vector for the query".to_string())
        })?;

        let fetch = top_k.saturating_mul(self.options.overfetch_factor.max(1));
        let passages = self
            .store
            .query(&vector, fetch, &self.options.projection)
            .await?;
        debug!(
            sector,
            passages = passages.len(),
            "collapsing passage matches to entities"
        );

        // Best passage per entity wins.
        let mut best: HashMap<String, SectorMatch> = HashMap::new();
        for hit in passages {
            match best.get_mut(&hit.entity_id) {
                Some(existing) if existing.score >= hit.score => {}
                Some(existing) => {
                    existing.score = hit.score;
                    existing.metadata = hit.metadata;
                }
                None => {
                    best.insert(
                        hit.entity_id.clone(),
                        SectorMatch {
                            entity_id: hit.entity_id,
                            score: hit.score,
                            metadata: hit.metadata,
                        },
                    );
                }
            }
        }

        let mut matches: Vec<SectorMatch> = best
            .into_values()
            .filter(|m| m.score >= self.options.min_relevance)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::MockEmbeddingProvider;
    use crate::store::SqliteVectorIndex;
    use crate::types::EmbeddingRecord;
    use tempfile::tempdir;

    fn record(entity: &str, ordinal: usize, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            entity_id: entity.to_string(),
            ordinal,
            vector,
            entity_name: format!("{entity} Inc."),
            exchange: None,
            form_type: "10-K".to_string(),
            content: String::new(),
        }
    }

    /// A unit vector at cosine similarity `c` from the axis query `[1, 0]`.
    fn at_similarity(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt()]
    }

    struct AxisEmbedder;

    #[async_trait::async_trait]
    impl EmbeddingProvider for AxisEmbedder {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    async fn seeded_store(dir: &tempfile::TempDir) -> Arc<dyn VectorIndex> {
        let store = SqliteVectorIndex::open(dir.path().join("idx.sqlite"), 2)
            .await
            .unwrap();
        store
            .upsert(vec![
                record("AAAA", 0, at_similarity(0.91)),
                record("AAAA", 1, at_similarity(0.60)),
                record("BBBB", 0, at_similarity(0.85)),
                record("CCCC", 0, at_similarity(0.40)),
            ])
            .await
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn ranks_deduplicates_and_applies_the_floor() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let service = SectorQueryService::connect(
            Arc::new(AxisEmbedder),
            store,
            QueryOptions::default(),
        )
        .await
        .unwrap();

        let matches = service.find_entities("widget makers", 10).await.unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.entity_id.as_str()).collect();
        // CCCC sits under the 0.5 floor; AAAA appears once with its best score.
        assert_eq!(ids, ["AAAA", "BBBB"]);
        assert!((matches[0].score - 0.91).abs() < 1e-3);
        assert!((matches[1].score - 0.85).abs() < 1e-3);
        assert_eq!(
            matches[0].metadata["entity_name"],
            serde_json::json!("AAAA Inc.")
        );
    }

    #[tokio::test]
    async fn top_k_caps_the_result() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let service = SectorQueryService::connect(
            Arc::new(AxisEmbedder),
            store,
            QueryOptions {
                min_relevance: 0.0,
                ..QueryOptions::default()
            },
        )
        .await
        .unwrap();

        let matches = service.find_entities("widget makers", 1).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity_id, "AAAA");
    }

    #[tokio::test]
    async fn blank_query_and_zero_top_k_are_empty() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let service = SectorQueryService::connect(
            Arc::new(AxisEmbedder),
            store,
            QueryOptions::default(),
        )
        .await
        .unwrap();

        assert!(service.find_entities("  ", 10).await.unwrap().is_empty());
        assert!(service.find_entities("chips", 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_at_connect() {
        let dir = tempdir().unwrap();
        let store = seeded_store(&dir).await;
        let err = SectorQueryService::connect(
            Arc::new(MockEmbeddingProvider::with_dimensions(8)),
            store,
            QueryOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }
}
