//! Sqlite-backed vector index using the `sqlite-vec` extension.
//!
//! Layout: a `passages` table holds record metadata keyed by
//! `entity_id#ordinal`, a `passage_embeddings` table holds the vectors, and
//! an `index_meta` table carries the lifecycle state and the configured
//! embedding dimension. Similarity search runs over
//! `vec_distance_cosine(embedding, vec_f32(?))`, converted to similarity as
//! `1 - distance`.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use tokio_rusqlite::{Connection, OptionalExtension, ffi};

use super::{MetadataProjection, PassageMatch, VectorIndex};
use crate::types::{EmbeddingRecord, IndexError, IndexState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS index_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS passages (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    entity_name TEXT NOT NULL,
    exchange TEXT,
    form_type TEXT NOT NULL,
    content TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_passages_entity ON passages(entity_id);
CREATE TABLE IF NOT EXISTS passage_embeddings (
    id TEXT PRIMARY KEY,
    embedding BLOB NOT NULL
);
";

/// Durable on-disk vector index. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct SqliteVectorIndex {
    conn: Connection,
    dimensions: usize,
}

impl std::fmt::Debug for SqliteVectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteVectorIndex")
            .field("dimensions", &self.dimensions)
            .finish_non_exhaustive()
    }
}

impl SqliteVectorIndex {
    /// Opens (or creates) the index at `path` for vectors of `dimensions`.
    ///
    /// The dimension is recorded in the meta table on first creation;
    /// re-opening an existing store with a different dimension is a
    /// configuration error caught here, before any query can misbehave.
    pub async fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self, IndexError> {
        if dimensions == 0 {
            return Err(IndexError::Config(
                "vector dimension must be positive".to_string(),
            ));
        }
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path).await.map_err(storage)?;

        conn.call(|conn| {
            let result = conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0));
            match result {
                Ok(_) => Ok(()),
                Err(err) => Err(tokio_rusqlite::Error::Rusqlite(err)),
            }
        })
        .await
        .map_err(storage)?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(tokio_rusqlite::Error::Rusqlite)
        })
        .await
        .map_err(storage)?;

        let stored: Option<String> = conn
            .call(|conn| {
                conn.query_row(
                    "SELECT value FROM index_meta WHERE key = 'dimensions'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(storage)?;

        match stored {
            Some(value) => {
                let existing: usize = value
                    .parse()
                    .map_err(|_| storage(format!("corrupt dimensions entry '{value}'")))?;
                if existing != dimensions {
                    return Err(IndexError::Config(format!(
                        "store at rest holds {existing}-dim vectors but {dimensions} were configured; \
                         rebuild the index or fix the embedding configuration"
                    )));
                }
            }
            None => {
                let value = dimensions.to_string();
                conn.call(move |conn| {
                    conn.execute(
                        "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('dimensions', ?1)",
                        [&value],
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    Ok(())
                })
                .await
                .map_err(storage)?;
            }
        }

        // Only a live build holds the connection it wrote the in-progress
        // marker through, so a marker found while opening is a leftover from
        // a process that died mid-build. Flip it so the next build can run;
        // committed batches stay queryable.
        let marker: Option<String> = conn
            .call(|conn| {
                conn.query_row(
                    "SELECT value FROM index_meta WHERE key = 'build_state'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(storage)?;
        if marker.as_deref() == Some(IndexState::Building.as_str()) {
            tracing::warn!(
                "found a stale in-progress marker, marking the index partial"
            );
            conn.call(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('build_state', ?1)",
                    [IndexState::FailedPartial.as_str()],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(storage)?;
        }

        Ok(Self { conn, dimensions })
    }

    fn register_sqlite_vec() -> Result<(), IndexError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *const c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!(
                        "failed to register sqlite-vec extension (code {rc})"
                    ))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(IndexError::Storage)
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn state(&self) -> Result<IndexState, IndexError> {
        let stored: Option<String> = self
            .conn
            .call(|conn| {
                conn.query_row(
                    "SELECT value FROM index_meta WHERE key = 'build_state'",
                    [],
                    |row| row.get(0),
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(storage)?;
        match stored {
            Some(value) => IndexState::parse(&value),
            None => Ok(IndexState::NotBuilt),
        }
    }

    async fn set_state(&self, state: IndexState) -> Result<(), IndexError> {
        let value = state.as_str();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO index_meta (key, value) VALUES ('build_state', ?1)",
                    [value],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(storage)
    }

    async fn dimensions(&self) -> Result<usize, IndexError> {
        Ok(self.dimensions)
    }

    async fn upsert(&self, records: Vec<EmbeddingRecord>) -> Result<(), IndexError> {
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            if record.vector.len() != self.dimensions {
                return Err(IndexError::Config(format!(
                    "record {} carries a {}-dim vector, store expects {}",
                    record.key(),
                    record.vector.len(),
                    self.dimensions
                )));
            }
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let vector_json =
                serde_json::to_string(&record.vector).map_err(|err| storage(err.to_string()))?;
            rows.push((record.key(), record, vector_json));
        }

        self.conn
            .call(move |conn| {
                let tx = conn
                    .transaction()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                {
                    let mut passage_stmt = tx
                        .prepare(
                            "INSERT OR REPLACE INTO passages \
                             (id, entity_id, ordinal, entity_name, exchange, form_type, content) \
                             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    let mut embedding_stmt = tx
                        .prepare(
                            "INSERT OR REPLACE INTO passage_embeddings (id, embedding) \
                             VALUES (?1, vec_f32(?2))",
                        )
                        .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    for (id, record, vector_json) in &rows {
                        passage_stmt
                            .execute((
                                id,
                                &record.entity_id,
                                record.ordinal as i64,
                                &record.entity_name,
                                &record.exchange,
                                &record.form_type,
                                &record.content,
                            ))
                            .map_err(tokio_rusqlite::Error::Rusqlite)?;
                        embedding_stmt
                            .execute((id, vector_json))
                            .map_err(tokio_rusqlite::Error::Rusqlite)?;
                    }
                }
                tx.commit().map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(storage)
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        projection: &MetadataProjection,
    ) -> Result<Vec<PassageMatch>, IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::Config(format!(
                "query vector has {} dims, store expects {}",
                vector.len(),
                self.dimensions
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut columns = String::from("p.entity_id, p.ordinal");
        for field in projection.fields() {
            columns.push_str(", p.");
            columns.push_str(field);
        }
        let sql = format!(
            "SELECT {columns}, vec_distance_cosine(e.embedding, vec_f32(?1)) AS distance \
             FROM passages p \
             JOIN passage_embeddings e ON p.id = e.id \
             ORDER BY distance ASC \
             LIMIT {top_k}"
        );
        let vector_json =
            serde_json::to_string(vector).map_err(|err| storage(err.to_string()))?;
        let fields: Vec<String> = projection.fields().to_vec();

        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(&sql)
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let distance_column = 2 + fields.len();
                let rows = stmt
                    .query_map([&vector_json], |row| {
                        let entity_id: String = row.get(0)?;
                        let ordinal: i64 = row.get(1)?;
                        let mut metadata = serde_json::Map::new();
                        for (offset, field) in fields.iter().enumerate() {
                            let value: Option<String> = row.get(2 + offset)?;
                            metadata.insert(
                                field.clone(),
                                value.map_or(serde_json::Value::Null, serde_json::Value::String),
                            );
                        }
                        let distance: f32 = row.get(distance_column)?;
                        Ok(PassageMatch {
                            entity_id,
                            ordinal: ordinal as usize,
                            score: 1.0 - distance,
                            metadata: serde_json::Value::Object(metadata),
                        })
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut matches = Vec::new();
                for row in rows {
                    matches.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(matches)
            })
            .await
            .map_err(storage)
    }

    async fn count(&self) -> Result<usize, IndexError> {
        self.conn
            .call(|conn| {
                let count: i64 = conn
                    .query_row("SELECT COUNT(*) FROM passages", [], |row| row.get(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(count as usize)
            })
            .await
            .map_err(storage)
    }

    async fn entity_ids(&self) -> Result<Vec<String>, IndexError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn
                    .prepare("SELECT DISTINCT entity_id FROM passages ORDER BY entity_id")
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let mut ids = Vec::new();
                for row in rows {
                    ids.push(row.map_err(tokio_rusqlite::Error::Rusqlite)?);
                }
                Ok(ids)
            })
            .await
            .map_err(storage)
    }
}

fn storage(err: impl ToString) -> IndexError {
    IndexError::Storage(err.to_string())
}
