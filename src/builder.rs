//! Orchestrates the full indexing pass: candidate listing, filing fetches,
//! section extraction, embedding and batched upserts into the vector store.
//!
//! A build is fault tolerant at the entity level. One company failing to
//! fetch or parse, or having its filing refused outright, is logged and
//! counted, and the pass carries on; only misconfiguration, candidate
//! listing failure and storage errors abort the build. An aborted build
//! leaves the store in the
//! `FailedPartial` state so a later run can resume; upserts are keyed, so
//! re-running never duplicates records.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::embed::{EmbeddingProvider, embed_with_salvage};
use crate::extract::{ExtractOptions, extract};
use crate::source::DocumentSource;
use crate::store::VectorIndex;
use crate::types::{EmbeddingRecord, Entity, IndexError, IndexState, TextPassage};

/// Knobs for a single build pass.
#[derive(Clone, Debug)]
pub struct BuildOptions {
    /// Concurrent fetch/extract workers.
    pub workers: usize,
    /// Entities accumulated before an embed-and-upsert flush.
    pub batch_size: usize,
    /// Emit a progress event every this many processed entities.
    pub progress_interval: usize,
    pub extract: ExtractOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 32,
            progress_interval: 10,
            extract: ExtractOptions::default(),
        }
    }
}

impl BuildOptions {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            workers: config.workers,
            batch_size: config.batch_size,
            progress_interval: config.progress_interval,
            extract: ExtractOptions {
                max_passage_chars: config.max_passage_chars,
                overlap_chars: config.passage_overlap_chars,
            },
        }
    }
}

/// Streamed over the channel returned by [`IndexBuilder::ensure_ready`].
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Started {
        candidates: usize,
    },
    Progress {
        processed: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
    },
    BatchCommitted {
        entities: usize,
        records: usize,
    },
    Completed {
        state: IndexState,
        summary: BuildSummary,
    },
}

/// Tally of a build pass. `skipped` counts entities with no usable filing
/// or a section too short to index; `failed` counts per-entity errors.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub candidates: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub records_upserted: usize,
}

/// Drives the indexing pipeline against a source, embedder and store.
pub struct IndexBuilder {
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorIndex>,
    options: BuildOptions,
}

impl IndexBuilder {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorIndex>,
        options: BuildOptions,
    ) -> Self {
        Self {
            source,
            embedder,
            store,
            options,
        }
    }

    /// Starts a build if one is needed and returns its event stream.
    ///
    /// A store already in the `Ready` state short-circuits: no candidate
    /// listing, no fetches, just an immediate `Completed` event. A store in
    /// the `Building` state means another pass owns it and the call fails
    /// with [`IndexError::BuildInProgress`].
    pub async fn ensure_ready(&self) -> Result<flume::Receiver<ProgressEvent>, IndexError> {
        let store_dims = self.store.dimensions().await?;
        if store_dims != self.embedder.dimensions() {
            return Err(IndexError::Config(format!(
                "embedder produces {}-dim vectors, store expects {store_dims}",
                self.embedder.dimensions()
            )));
        }

        match self.store.state().await? {
            IndexState::Ready => {
                info!("index already built, skipping");
                let (tx, rx) = flume::bounded(1);
                let _ = tx.send(ProgressEvent::Completed {
                    state: IndexState::Ready,
                    summary: BuildSummary::default(),
                });
                Ok(rx)
            }
            IndexState::Building => Err(IndexError::BuildInProgress),
            IndexState::NotBuilt | IndexState::FailedPartial => {
                let (tx, rx) = flume::unbounded();
                let source = Arc::clone(&self.source);
                let embedder = Arc::clone(&self.embedder);
                let store = Arc::clone(&self.store);
                let options = self.options.clone();
                tokio::spawn(run_build(source, embedder, store, options, tx));
                Ok(rx)
            }
        }
    }

    /// Runs a build (or the `Ready` short-circuit) and blocks until it
    /// finishes, returning the final state and tally.
    pub async fn run_to_completion(&self) -> Result<(IndexState, BuildSummary), IndexError> {
        let events = self.ensure_ready().await?;
        while let Ok(event) = events.recv_async().await {
            if let ProgressEvent::Completed { state, summary } = event {
                return Ok((state, summary));
            }
        }
        Err(IndexError::Storage(
            "build task ended without a completion event".to_string(),
        ))
    }
}

struct FetchedEntity {
    entity: Entity,
    form_type: String,
    passages: Vec<TextPassage>,
}

async fn run_build(
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorIndex>,
    options: BuildOptions,
    events: flume::Sender<ProgressEvent>,
) {
    let mut summary = BuildSummary::default();
    let result = build_inner(
        &source,
        &embedder,
        &store,
        &options,
        &events,
        &mut summary,
    )
    .await;

    let state = match result {
        Ok(()) => IndexState::Ready,
        Err(err) => {
            warn!(error = %err, "index build aborted");
            IndexState::FailedPartial
        }
    };
    if let Err(err) = store.set_state(state).await {
        warn!(error = %err, "failed to persist final index state");
    }
    info!(
        state = state.as_str(),
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        records = summary.records_upserted,
        "build finished"
    );
    let _ = events.send(ProgressEvent::Completed { state, summary });
}

async fn build_inner(
    source: &Arc<dyn DocumentSource>,
    embedder: &Arc<dyn EmbeddingProvider>,
    store: &Arc<dyn VectorIndex>,
    options: &BuildOptions,
    events: &flume::Sender<ProgressEvent>,
    summary: &mut BuildSummary,
) -> Result<(), IndexError> {
    store.set_state(IndexState::Building).await?;

    let candidates = source.list_candidates().await?;
    summary.candidates = candidates.len();
    info!(candidates = candidates.len(), "starting index build");
    let _ = events.send(ProgressEvent::Started {
        candidates: candidates.len(),
    });

    let workers = options.workers.max(1);
    let mut tasks: JoinSet<(Entity, Result<Option<FetchedEntity>, IndexError>)> = JoinSet::new();
    let mut queue = candidates.into_iter();
    let mut pending: Vec<FetchedEntity> = Vec::new();

    loop {
        while tasks.len() < workers {
            let Some(entity) = queue.next() else { break };
            let source = Arc::clone(source);
            let extract_options = options.extract.clone();
            tasks.spawn(async move {
                let outcome = fetch_and_extract(&*source, &entity, &extract_options).await;
                (entity, outcome)
            });
        }
        let Some(joined) = tasks.join_next().await else {
            break;
        };

        summary.processed += 1;
        match joined {
            Ok((_, Ok(Some(fetched)))) if !fetched.passages.is_empty() => {
                summary.succeeded += 1;
                pending.push(fetched);
            }
            Ok((entity, Ok(Some(_)))) => {
                summary.skipped += 1;
                warn!(entity = %entity.ticker, "section too short to index, skipping");
            }
            Ok((entity, Ok(None))) => {
                summary.skipped += 1;
                info!(entity = %entity.ticker, "no usable filing, skipping");
            }
            Ok((_, Err(err @ IndexError::Config(_)))) => {
                return Err(err);
            }
            Ok((entity, Err(err))) => {
                summary.failed += 1;
                warn!(entity = %entity.ticker, error = %err, "entity failed, continuing");
            }
            Err(err) => {
                summary.failed += 1;
                warn!(error = %err, "entity worker panicked, continuing");
            }
        }

        if pending.len() >= options.batch_size {
            flush_batch(embedder, store, events, summary, &mut pending).await?;
        }
        if options.progress_interval > 0 && summary.processed % options.progress_interval == 0 {
            let _ = events.send(ProgressEvent::Progress {
                processed: summary.processed,
                succeeded: summary.succeeded,
                failed: summary.failed,
                skipped: summary.skipped,
            });
        }
    }

    flush_batch(embedder, store, events, summary, &mut pending).await?;

    // Confirm the store is still ours and reachable before the pass is
    // declared ready.
    let state = store.state().await?;
    if state != IndexState::Building {
        return Err(IndexError::Storage(format!(
            "index state changed to '{state}' mid-build"
        )));
    }
    let stored = store.count().await?;
    info!(records = stored, "final flush verified");
    Ok(())
}

async fn fetch_and_extract(
    source: &dyn DocumentSource,
    entity: &Entity,
    options: &ExtractOptions,
) -> Result<Option<FetchedEntity>, IndexError> {
    let Some(document) = source.fetch_document(entity).await? else {
        return Ok(None);
    };
    let passages = extract(&document, options)?;
    Ok(Some(FetchedEntity {
        entity: entity.clone(),
        form_type: document.form_type,
        passages,
    }))
}

async fn flush_batch(
    embedder: &Arc<dyn EmbeddingProvider>,
    store: &Arc<dyn VectorIndex>,
    events: &flume::Sender<ProgressEvent>,
    summary: &mut BuildSummary,
    pending: &mut Vec<FetchedEntity>,
) -> Result<(), IndexError> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);

    let mut texts = Vec::new();
    for fetched in &batch {
        for passage in &fetched.passages {
            texts.push(passage.text.clone());
        }
    }
    let vectors = embed_with_salvage(embedder.as_ref(), &texts).await?;

    let mut records = Vec::new();
    let mut slots = vectors.into_iter();
    for fetched in &batch {
        for passage in &fetched.passages {
            match slots.next().flatten() {
                Some(vector) => records.push(EmbeddingRecord {
                    entity_id: fetched.entity.ticker.clone(),
                    ordinal: passage.ordinal,
                    vector,
                    entity_name: fetched.entity.title.clone(),
                    exchange: fetched.entity.exchange.clone(),
                    form_type: fetched.form_type.clone(),
                    content: passage.text.clone(),
                }),
                None => {
                    warn!(
                        entity = %fetched.entity.ticker,
                        ordinal = passage.ordinal,
                        "passage dropped by embedder, indexing the rest"
                    );
                }
            }
        }
    }

    let committed = records.len();
    store.upsert(records).await?;
    summary.records_upserted += committed;
    let _ = events.send(ProgressEvent::BatchCommitted {
        entities: batch.len(),
        records: committed,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::MockEmbeddingProvider;
    use crate::source::FixtureSource;
    use crate::store::SqliteVectorIndex;
    use tempfile::tempdir;

    fn filing_text(name: &str) -> String {
        format!(
            "Item 1. Business. {name} designs, manufactures and sells widgets \
             to industrial customers across several markets. The company \
             operates factories in three countries and sells through a direct \
             sales force as well as distribution partners worldwide. \
             Item 1A. Risk Factors. Everything is risky."
        )
    }

    async fn open_store(dir: &tempfile::TempDir) -> Arc<dyn VectorIndex> {
        Arc::new(
            SqliteVectorIndex::open(dir.path().join("idx.sqlite"), 8)
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn build_then_rerun_short_circuits() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let source = Arc::new(
            FixtureSource::new()
                .with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp"))
                .with_company("BBBB", "Beta Corp", &filing_text("Beta Corp")),
        );
        let builder = IndexBuilder::new(
            source.clone(),
            Arc::new(MockEmbeddingProvider::new()),
            store,
            BuildOptions::default(),
        );

        let (state, summary) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 0);
        assert!(summary.records_upserted >= 2);

        let (state, summary) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary, BuildSummary::default());
        // The second pass never touched the source again.
        assert_eq!(source.list_calls(), 1);
        assert_eq!(source.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn entity_failures_do_not_abort_the_build() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let source = Arc::new(
            FixtureSource::new()
                .with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp"))
                .with_failing_fetch("BADD", "Broken Corp", "socket reset")
                .with_missing_filing("NONE", "Quiet Corp"),
        );
        let builder = IndexBuilder::new(
            source,
            Arc::new(MockEmbeddingProvider::new()),
            store.clone(),
            BuildOptions::default(),
        );

        let (state, summary) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(store.entity_ids().await.unwrap(), ["AAAA"]);
    }

    #[tokio::test]
    async fn denied_document_is_skipped_like_any_entity_failure() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let source = Arc::new(
            FixtureSource::new()
                .with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp"))
                .with_denied_fetch("DENY", "Walled Corp", "403 on filing")
                .with_company("BBBB", "Beta Corp", &filing_text("Beta Corp")),
        );
        let builder = IndexBuilder::new(
            source,
            Arc::new(MockEmbeddingProvider::new()),
            store.clone(),
            BuildOptions::default(),
        );

        let (state, summary) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(store.entity_ids().await.unwrap(), ["AAAA", "BBBB"]);
    }

    #[tokio::test]
    async fn concurrent_build_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        store.set_state(IndexState::Building).await.unwrap();

        let builder = IndexBuilder::new(
            Arc::new(FixtureSource::new()),
            Arc::new(MockEmbeddingProvider::new()),
            store,
            BuildOptions::default(),
        );
        let err = builder.ensure_ready().await.unwrap_err();
        assert!(matches!(err, IndexError::BuildInProgress));
    }

    #[tokio::test]
    async fn restart_after_a_crashed_build_can_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.sqlite");
        {
            let store = SqliteVectorIndex::open(&path, 8).await.unwrap();
            store.set_state(IndexState::Building).await.unwrap();
            // Process dies here; the in-progress marker stays behind.
        }

        let store: Arc<dyn VectorIndex> =
            Arc::new(SqliteVectorIndex::open(&path, 8).await.unwrap());
        let builder = IndexBuilder::new(
            Arc::new(
                FixtureSource::new().with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp")),
            ),
            Arc::new(MockEmbeddingProvider::new()),
            store.clone(),
            BuildOptions::default(),
        );

        let (state, summary) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(store.state().await.unwrap(), IndexState::Ready);
    }

    #[tokio::test]
    async fn small_batches_flush_as_they_fill() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let source = Arc::new(
            FixtureSource::new()
                .with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp"))
                .with_company("BBBB", "Beta Corp", &filing_text("Beta Corp"))
                .with_company("CCCC", "Gamma Corp", &filing_text("Gamma Corp")),
        );
        let builder = IndexBuilder::new(
            source,
            Arc::new(MockEmbeddingProvider::new()),
            store,
            BuildOptions {
                batch_size: 2,
                ..BuildOptions::default()
            },
        );

        let events = builder.ensure_ready().await.unwrap();
        let mut commits = 0;
        let mut completed = None;
        while let Ok(event) = events.recv_async().await {
            match event {
                ProgressEvent::BatchCommitted { .. } => commits += 1,
                ProgressEvent::Completed { state, summary } => {
                    completed = Some((state, summary));
                }
                _ => {}
            }
        }
        assert_eq!(commits, 2);
        let (state, summary) = completed.unwrap();
        assert_eq!(state, IndexState::Ready);
        assert_eq!(summary.succeeded, 3);
    }

    /// Source that clobbers the store's lifecycle state while fetching,
    /// standing in for an outside writer racing the build.
    struct ClobberingSource {
        inner: FixtureSource,
        store: Arc<dyn VectorIndex>,
    }

    #[async_trait::async_trait]
    impl DocumentSource for ClobberingSource {
        async fn list_candidates(&self) -> Result<Vec<Entity>, IndexError> {
            self.inner.list_candidates().await
        }

        async fn fetch_document(
            &self,
            entity: &Entity,
        ) -> Result<Option<crate::types::RawDocument>, IndexError> {
            self.store.set_state(IndexState::NotBuilt).await?;
            self.inner.fetch_document(entity).await
        }
    }

    #[tokio::test]
    async fn external_state_change_blocks_the_ready_transition() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let source = Arc::new(ClobberingSource {
            inner: FixtureSource::new().with_company("AAAA", "Alpha Corp", &filing_text("Alpha Corp")),
            store: store.clone(),
        });
        let builder = IndexBuilder::new(
            source,
            Arc::new(MockEmbeddingProvider::new()),
            store.clone(),
            BuildOptions::default(),
        );

        let (state, _) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::FailedPartial);
        assert_eq!(store.state().await.unwrap(), IndexState::FailedPartial);
    }

    #[tokio::test]
    async fn listing_failure_leaves_a_partial_state() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let builder = IndexBuilder::new(
            Arc::new(FixtureSource::new().with_failing_listing("registry unavailable")),
            Arc::new(MockEmbeddingProvider::new()),
            store.clone(),
            BuildOptions::default(),
        );

        let (state, _) = builder.run_to_completion().await.unwrap();
        assert_eq!(state, IndexState::FailedPartial);
        assert_eq!(store.state().await.unwrap(), IndexState::FailedPartial);
    }
}
