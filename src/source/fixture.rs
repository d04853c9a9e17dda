//! Fixed in-memory document source for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use crate::source::DocumentSource;
use crate::types::{Entity, IndexError, RawDocument};

/// A [`DocumentSource`] backed by fixed fixtures.
///
/// Chosen by configuration at construction time wherever a run should not
/// touch the live registry. Call counters let tests assert that a ready index
/// triggers no re-fetching.
#[derive(Default)]
pub struct FixtureSource {
    entities: Vec<Entity>,
    documents: HashMap<String, String>,
    failures: HashMap<String, String>,
    denials: HashMap<String, String>,
    listing_failure: Option<String>,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entity with a filing document.
    #[must_use]
    pub fn with_company(
        mut self,
        ticker: impl Into<String>,
        title: impl Into<String>,
        document_html: impl Into<String>,
    ) -> Self {
        let ticker = ticker.into();
        let cik = (self.entities.len() + 1) as u64;
        self.documents.insert(ticker.clone(), document_html.into());
        self.entities.push(Entity::new(ticker, cik, title));
        self
    }

    /// Adds an entity the registry has no filing for.
    #[must_use]
    pub fn with_missing_filing(
        mut self,
        ticker: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        let ticker = ticker.into();
        let cik = (self.entities.len() + 1) as u64;
        self.entities.push(Entity::new(ticker, cik, title));
        self
    }

    /// Adds an entity whose fetch always fails with the given message.
    #[must_use]
    pub fn with_failing_fetch(
        mut self,
        ticker: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let ticker = ticker.into();
        let cik = (self.entities.len() + 1) as u64;
        self.failures.insert(ticker.clone(), message.into());
        self.entities.push(Entity::new(ticker, cik, title));
        self
    }

    /// Adds an entity whose filing fetch is refused by the registry.
    #[must_use]
    pub fn with_denied_fetch(
        mut self,
        ticker: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let ticker = ticker.into();
        let cik = (self.entities.len() + 1) as u64;
        self.denials.insert(ticker.clone(), message.into());
        self.entities.push(Entity::new(ticker, cik, title));
        self
    }

    /// Makes `list_candidates` fail with the given message.
    #[must_use]
    pub fn with_failing_listing(mut self, message: impl Into<String>) -> Self {
        self.listing_failure = Some(message.into());
        self
    }

    /// Number of `fetch_document` calls served so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `list_candidates` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for FixtureSource {
    async fn list_candidates(&self) -> Result<Vec<Entity>, IndexError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.listing_failure {
            return Err(IndexError::Fetch(message.clone()));
        }
        Ok(self.entities.clone())
    }

    async fn fetch_document(&self, entity: &Entity) -> Result<Option<RawDocument>, IndexError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.failures.get(&entity.ticker) {
            return Err(IndexError::Fetch(message.clone()));
        }
        if let Some(message) = self.denials.get(&entity.ticker) {
            return Err(IndexError::AccessDenied(message.clone()));
        }
        Ok(self.documents.get(&entity.ticker).map(|content| RawDocument {
            entity_id: entity.ticker.clone(),
            form_type: "10-K".to_string(),
            content: content.clone(),
            fetched_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_fixtures_and_counts_calls() {
        let source = FixtureSource::new()
            .with_company("NVDA", "NVIDIA CORP", "<html>chips</html>")
            .with_missing_filing("GHST", "Ghost Corp")
            .with_failing_fetch("BAD", "Bad Corp", "socket reset");

        let entities = source.list_candidates().await.unwrap();
        assert_eq!(entities.len(), 3);

        let doc = source.fetch_document(&entities[0]).await.unwrap().unwrap();
        assert_eq!(doc.entity_id, "NVDA");

        assert!(source.fetch_document(&entities[1]).await.unwrap().is_none());
        assert!(matches!(
            source.fetch_document(&entities[2]).await,
            Err(IndexError::Fetch(_))
        ));

        assert_eq!(source.list_calls(), 1);
        assert_eq!(source.fetch_calls(), 3);
    }
}
