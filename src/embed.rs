//! Embedding providers: turning text passages into fixed-dimension vectors.
//!
//! [`OpenAiEmbedder`] talks to an OpenAI-compatible embeddings endpoint,
//! batching inputs to the service's items-per-call limit and restoring
//! response order from the per-item index. [`MockEmbeddingProvider`] produces
//! deterministic vectors for tests and offline runs.
//!
//! The batch boundary is not a correctness boundary: [`embed_with_salvage`]
//! recursively splits a persistently failing batch and drops only the items
//! that fail on their own, so partial success never duplicates or loses the
//! surviving passages.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::IndexConfig;
use crate::retry::retry_with_backoff;
use crate::types::IndexError;

/// Converts batches of text into fixed-dimension vectors, order-preserving.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Vector dimension this provider produces.
    fn dimensions(&self) -> usize;

    /// Embeds every input, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError>;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimensions: usize,
    max_items: usize,
    max_chars: usize,
    max_retries: u32,
    backoff_base_ms: u64,
}

impl OpenAiEmbedder {
    /// Builds an embedder from configuration.
    ///
    /// A missing API key fails here, at startup, not on the first batch.
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        if config.embed_api_key.trim().is_empty() {
            return Err(IndexError::Config(
                "OPENAI_API_KEY must be set to use the remote embedding service".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .use_rustls_tls()
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.embed_api_base.trim_end_matches('/')),
            api_key: config.embed_api_key.clone(),
            model: config.embed_model.clone(),
            dimensions: config.dimensions,
            max_items: config.embed_batch_max,
            max_chars: config.embed_max_chars,
            max_retries: config.max_retries,
            backoff_base_ms: config.backoff_base_ms,
        })
    }

    async fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let inputs: Vec<&str> = texts
            .iter()
            .map(|text| {
                if text.len() > self.max_chars {
                    tracing::warn!(
                        chars = text.len(),
                        limit = self.max_chars,
                        "truncating over-long input before embedding"
                    );
                    truncate_on_boundary(text, self.max_chars)
                } else {
                    text.as_str()
                }
            })
            .collect();

        let response: EmbedResponse =
            retry_with_backoff(self.max_retries, self.backoff_base_ms, || {
                let request = EmbedRequest {
                    model: &self.model,
                    input: &inputs,
                };
                async move {
                    let response = self
                        .client
                        .post(&self.endpoint)
                        .bearer_auth(&self.api_key)
                        .json(&request)
                        .send()
                        .await?
                        .error_for_status()?;
                    let parsed: EmbedResponse = response.json().await?;
                    Ok(parsed)
                }
            })
            .await
            .map_err(|err| match err {
                IndexError::Http(inner) => IndexError::Embedding(inner.to_string()),
                other => other,
            })?;

        if response.data.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "service returned {} vectors for {} inputs",
                response.data.len(),
                texts.len()
            )));
        }

        // The service tags each vector with its input index; restore input order.
        let mut data = response.data;
        data.sort_by_key(|item| item.index);

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            if item.embedding.len() != self.dimensions {
                return Err(IndexError::Config(format!(
                    "embedding dimension mismatch: model '{}' returned {} dims, configured {}",
                    self.model,
                    item.embedding.len(),
                    self.dimensions
                )));
            }
            vectors.push(item.embedding);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.max_items.max(1)) {
            vectors.extend(self.embed_chunk(chunk).await?);
        }
        Ok(vectors)
    }
}

/// Deterministic hash-based provider for tests and offline runs.
#[derive(Clone, Debug)]
pub struct MockEmbeddingProvider {
    dimensions: usize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self { dimensions: 8 }
    }
}

impl MockEmbeddingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn hash_to_vec(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();
        (0..self.dimensions)
            .map(|i| {
                let bits = seed.rotate_left((i % 8) as u32 * 8) ^ ((i as u64) << 24);
                (bits as f64 / u64::MAX as f64) as f32
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
        Ok(texts.iter().map(|text| self.hash_to_vec(text)).collect())
    }
}

/// Embeds `texts`, salvaging what it can from persistent batch failures.
///
/// Returns one slot per input: `Some(vector)` on success, `None` for items
/// dropped after failing on their own. Configuration errors are never
/// swallowed; they escalate immediately.
pub async fn embed_with_salvage(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Option<Vec<f32>>>, IndexError> {
    let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
    let mut segments = vec![(0usize, texts.len())];
    while let Some((start, len)) = segments.pop() {
        if len == 0 {
            continue;
        }
        match provider.embed_batch(&texts[start..start + len]).await {
            Ok(vectors) => {
                if vectors.len() != len {
                    return Err(IndexError::Embedding(format!(
                        "provider returned {} vectors for {} inputs",
                        vectors.len(),
                        len
                    )));
                }
                for (offset, vector) in vectors.into_iter().enumerate() {
                    out[start + offset] = Some(vector);
                }
            }
            Err(err @ IndexError::Config(_)) => return Err(err),
            Err(err) if len == 1 => {
                tracing::warn!(
                    index = start,
                    error = %err,
                    "dropping item after persistent embedding failure"
                );
            }
            Err(err) => {
                tracing::warn!(start, len, error = %err, "splitting failed embedding batch");
                let half = len / 2;
                segments.push((start + half, len - half));
                segments.push((start, half));
            }
        }
    }
    Ok(out)
}

fn truncate_on_boundary(text: &str, max: usize) -> &str {
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn embedder_for(server: &MockServer, dimensions: usize, max_items: usize) -> OpenAiEmbedder {
        let config = IndexConfig {
            contact_email: "indexer@example.com".to_string(),
            embed_api_base: server.base_url(),
            embed_api_key: "test-key".to_string(),
            dimensions,
            embed_batch_max: max_items,
            max_retries: 2,
            backoff_base_ms: 0,
            ..IndexConfig::default()
        };
        OpenAiEmbedder::new(&config).unwrap()
    }

    #[test]
    fn missing_api_key_fails_at_construction() {
        let config = IndexConfig {
            contact_email: "indexer@example.com".to_string(),
            ..IndexConfig::default()
        };
        assert!(matches!(
            OpenAiEmbedder::new(&config),
            Err(IndexError::Config(_))
        ));
    }

    #[tokio::test]
    async fn mock_provider_is_deterministic() {
        let provider = MockEmbeddingProvider::new();
        let inputs = vec![
            "Hello world".to_string(),
            "Goodbye world".to_string(),
            "Hello world".to_string(),
        ];

        let first = provider.embed_batch(&inputs).await.unwrap();
        let second = provider.embed_batch(&inputs).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0], first[2]);
        assert_ne!(first[0], first[1]);
        assert_eq!(first[0].len(), provider.dimensions());
    }

    #[tokio::test]
    async fn restores_service_order_from_index_field() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        {"index": 1, "embedding": [1.0, 1.0]},
                        {"index": 0, "embedding": [0.0, 0.0]}
                    ]
                }));
            })
            .await;

        let embedder = embedder_for(&server, 2, 16);
        let vectors = embedder
            .embed_batch(&["first".to_string(), "second".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![0.0, 0.0]);
        assert_eq!(vectors[1], vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn splits_input_to_items_per_call_limit() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(json!({
                    "data": [
                        {"index": 0, "embedding": [0.5, 0.5]},
                        {"index": 1, "embedding": [0.5, 0.5]}
                    ]
                }));
            })
            .await;

        let embedder = embedder_for(&server, 2, 2);
        let texts: Vec<String> = (0..6).map(|i| format!("passage {i}")).collect();
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 6);
        mock.assert_hits_async(3).await;
    }

    #[tokio::test]
    async fn dimension_mismatch_is_a_config_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(200).json_body(json!({
                    "data": [{"index": 0, "embedding": [0.1, 0.2, 0.3]}]
                }));
            })
            .await;

        let embedder = embedder_for(&server, 2, 16);
        let err = embedder
            .embed_batch(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }

    #[tokio::test]
    async fn persistent_service_failure_is_an_embedding_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/embeddings");
                then.status(503);
            })
            .await;

        let embedder = embedder_for(&server, 2, 16);
        let err = embedder
            .embed_batch(&["text".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
        mock.assert_hits_async(3).await;
    }

    /// Provider that refuses any batch containing a poisoned text.
    struct PoisonProvider {
        inner: MockEmbeddingProvider,
    }

    #[async_trait]
    impl EmbeddingProvider for PoisonProvider {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            if texts.iter().any(|t| t.contains("POISON")) {
                return Err(IndexError::Embedding("poisoned batch".to_string()));
            }
            self.inner.embed_batch(texts).await
        }
    }

    #[tokio::test]
    async fn salvage_drops_only_the_poison_item() {
        let provider = PoisonProvider {
            inner: MockEmbeddingProvider::new(),
        };
        let texts: Vec<String> = vec![
            "alpha".to_string(),
            "beta".to_string(),
            "POISON".to_string(),
            "gamma".to_string(),
            "delta".to_string(),
        ];

        let out = embed_with_salvage(&provider, &texts).await.unwrap();
        assert_eq!(out.len(), 5);
        assert!(out[2].is_none());
        for (i, slot) in out.iter().enumerate() {
            if i == 2 {
                continue;
            }
            let expected = provider.inner.embed_batch(&texts[i..i + 1]).await.unwrap();
            assert_eq!(slot.as_ref().unwrap(), &expected[0]);
        }
    }

    struct AlwaysConfigError;

    #[async_trait]
    impl EmbeddingProvider for AlwaysConfigError {
        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            Err(IndexError::Config("wrong model".to_string()))
        }
    }

    #[tokio::test]
    async fn salvage_never_swallows_config_errors() {
        let texts = vec!["a".to_string(), "b".to_string()];
        let err = embed_with_salvage(&AlwaysConfigError, &texts)
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Config(_)));
    }
}
