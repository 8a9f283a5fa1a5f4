//! Embedding collaborator seam.
//!
//! `EmbeddingGateway` is the raw, fallible text-to-vector call. `Embedder`
//! wraps it with a timeout and a query cache and never fails: empty input,
//! errors and timeouts all come back as `None`.

use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::metrics;
use crate::utils::TextUtils;

#[async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Recorded next to every stored vector.
    fn model_name(&self) -> &str;
}

pub struct Embedder {
    gateway: Arc<dyn EmbeddingGateway>,
    timeout: Duration,
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl Embedder {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, timeout: Duration, cache_capacity: u64, cache_ttl: Duration) -> Self {
        Self {
            gateway,
            timeout,
            query_cache: Cache::builder()
                .max_capacity(cache_capacity)
                .time_to_live(cache_ttl)
                .build(),
        }
    }

    pub fn model_name(&self) -> &str {
        self.gateway.model_name()
    }

    /// Embed document text. Not cached.
    pub async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let text = TextUtils::normalize_whitespace(text);
        if text.is_empty() {
            return None;
        }

        match tokio::time::timeout(self.timeout, self.gateway.embed(&text)).await {
            Ok(Ok(vector)) if !vector.is_empty() => Some(vector),
            Ok(Ok(_)) => {
                warn!("Embedding gateway returned an empty vector");
                metrics::inc_embedding_failure();
                None
            }
            Ok(Err(e)) => {
                warn!("Embedding failed: {}", e);
                metrics::inc_embedding_failure();
                None
            }
            Err(_) => {
                warn!("Embedding timed out after {:?}", self.timeout);
                metrics::inc_embedding_failure();
                None
            }
        }
    }

    /// Embed a search query, reusing recent results for the same text.
    pub async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        let key = TextUtils::normalize_whitespace(query).into_owned();
        if key.is_empty() {
            return None;
        }
        if let Some(hit) = self.query_cache.get(&key).await {
            debug!("Query embedding cache hit");
            return Some(hit.as_ref().clone());
        }

        let vector = self.embed(&key).await?;
        self.query_cache.insert(key, Arc::new(vector.clone())).await;
        Some(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeEmbeddingGateway;

    fn embedder(gateway: Arc<FakeEmbeddingGateway>, timeout: Duration) -> Embedder {
        Embedder::new(gateway, timeout, 16, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_blank_text_is_none_without_calling_gateway() {
        let gateway = Arc::new(FakeEmbeddingGateway::new());
        let embedder = embedder(gateway.clone(), Duration::from_secs(1));
        assert!(embedder.embed("   \n").await.is_none());
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_failure_and_timeout_degrade_to_none() {
        let failing = Arc::new(FakeEmbeddingGateway::failing());
        assert!(embedder(failing, Duration::from_secs(1)).embed("hello").await.is_none());

        let slow = Arc::new(FakeEmbeddingGateway::new().with_delay(Duration::from_millis(200)));
        assert!(embedder(slow, Duration::from_millis(10)).embed("hello").await.is_none());
    }

    #[tokio::test]
    async fn test_query_embeddings_are_cached() {
        let gateway = Arc::new(FakeEmbeddingGateway::new());
        let embedder = embedder(gateway.clone(), Duration::from_secs(1));
        let first = embedder.embed_query("fix the   bug").await.unwrap();
        let second = embedder.embed_query("fix the bug").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gateway.calls(), 1);
    }
}
