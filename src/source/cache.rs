//! Disk-backed cache for the candidate list and downloaded filings.
//!
//! Repeated or resumed builds reuse previously downloaded material instead of
//! hitting the registry again; combined with idempotent upserts this makes an
//! interrupted build cheap to restart.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::types::{Entity, IndexError};

/// Filesystem-backed cache rooted at a single directory.
///
/// File names are derived deterministically from entity id and form type so
/// repeated runs resolve to the same entries.
#[derive(Clone, Debug)]
pub struct DocumentCache {
    root: PathBuf,
}

impl DocumentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the cached candidate-entity list.
    pub fn candidates_path(&self) -> PathBuf {
        self.root.join("candidates.json")
    }

    /// Path of a cached filing document for one entity and form type.
    pub fn filing_path(&self, entity_id: &str, form_type: &str) -> PathBuf {
        let name = format!(
            "{}_{}.html",
            sanitize_component(entity_id),
            sanitize_component(form_type)
        );
        self.root.join("filings").join(name)
    }

    /// Loads the cached candidate list, if one exists.
    pub async fn load_candidates(&self) -> Result<Option<Vec<Entity>>, IndexError> {
        let path = self.candidates_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path).await?;
        let entities: Vec<Entity> =
            serde_json::from_str(&data).map_err(|err| IndexError::Io(err.to_string()))?;
        Ok(Some(entities))
    }

    /// Persists the candidate list for later runs.
    pub async fn store_candidates(&self, entities: &[Entity]) -> Result<(), IndexError> {
        fs::create_dir_all(&self.root).await?;
        let serialized =
            serde_json::to_string(entities).map_err(|err| IndexError::Io(err.to_string()))?;
        fs::write(self.candidates_path(), serialized).await?;
        Ok(())
    }

    /// Loads a cached filing, if one exists for this entity and form.
    pub async fn load_filing(
        &self,
        entity_id: &str,
        form_type: &str,
    ) -> Result<Option<String>, IndexError> {
        let path = self.filing_path(entity_id, form_type);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path).await?))
    }

    /// Persists a downloaded filing for later runs.
    pub async fn store_filing(
        &self,
        entity_id: &str,
        form_type: &str,
        content: &str,
    ) -> Result<(), IndexError> {
        let path = self.filing_path(entity_id, form_type);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        Ok(())
    }
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
