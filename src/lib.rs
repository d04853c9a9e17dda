//! ```text
//! Registry ──► source::EdgarSource ──► RawDocument ──► DocumentCache
//!                                         │
//!                                         ▼
//!                    extract::extract ──► TextPassage batches
//!                                         │
//!                                         ▼
//!        embed::OpenAiEmbedder ──► EmbeddingRecord ──► store::SqliteVectorIndex
//!                                         │
//!                                         ▼
//!              builder::IndexBuilder (resumable, batched, skip-and-continue)
//!
//! Stored vectors ──► query::SectorQueryService ──► ranked entity ids
//! ```
//!
pub mod builder;
pub mod config;
pub mod embed;
pub mod extract;
pub mod query;
pub mod source;
pub mod store;
pub mod types;

mod retry;

pub use builder::{BuildOptions, BuildSummary, IndexBuilder, ProgressEvent};
pub use config::IndexConfig;
pub use embed::{EmbeddingProvider, MockEmbeddingProvider, OpenAiEmbedder};
pub use query::{QueryOptions, SectorQueryService};
pub use source::{DocumentCache, DocumentSource, EdgarSource, FixtureSource};
pub use store::{MetadataProjection, PassageMatch, SqliteVectorIndex, VectorIndex};
pub use types::{
    EmbeddingRecord, Entity, IndexError, IndexState, RawDocument, SectorMatch, TextPassage,
};
