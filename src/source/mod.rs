//! Document sources: where candidate entities and raw filings come from.
//!
//! The [`DocumentSource`] trait is the seam between the build pipeline and
//! the outside world. Two implementations are provided and selected by the
//! caller at construction time, never by catching errors at call time:
//!
//! * [`EdgarSource`]: the live SEC EDGAR registry over HTTPS, with retry,
//!   back-off, and an on-disk [`DocumentCache`].
//! * [`FixtureSource`]: fixed in-memory documents for tests and offline runs.

pub mod cache;
pub mod edgar;
pub mod fixture;

pub use cache::DocumentCache;
pub use edgar::EdgarSource;
pub use fixture::FixtureSource;

use async_trait::async_trait;

use crate::types::{Entity, IndexError, RawDocument};

/// Supplier of candidate entities and their raw filing documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Lists every candidate entity known to the registry.
    ///
    /// May be tens of thousands of entries; called once per build run.
    async fn list_candidates(&self) -> Result<Vec<Entity>, IndexError>;

    /// Fetches the best available filing document for one entity.
    ///
    /// Returns `Ok(None)` when the registry has no suitable filing. Errors
    /// are entity-scoped: the builder logs and skips, the run continues.
    async fn fetch_document(&self, entity: &Entity) -> Result<Option<RawDocument>, IndexError>;
}
