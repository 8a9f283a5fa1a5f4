//! Deterministic collaborators for unit tests.
use async_trait::async_trait;
use serde_json::Map;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::memory_db::{AiSummary, CandidatePattern, MemoryDatabase, PatternType, SessionEvent};
use crate::memory_engine::{
    EmbeddingGateway, EntityIndexer, HandoffCoordinator, PatternStore, SessionManager, Summarizer, SummaryOutcome,
    UnifiedSearchEngine,
};
use crate::shared_state::SharedState;

const FAKE_DIMENSIONS: usize = 256;

/// Bag-of-words hashed into a fixed number of buckets. Texts sharing words
/// get a positive cosine similarity, identical texts score 1.
pub struct FakeEmbeddingGateway {
    fail: bool,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl FakeEmbeddingGateway {
    pub fn new() -> Self {
        Self { fail: false, delay: None, calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn bag_of_words(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; FAKE_DIMENSIONS];
    for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.to_lowercase().bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        vector[(hash % FAKE_DIMENSIONS as u64) as usize] += 1.0;
    }
    vector
}

#[async_trait]
impl EmbeddingGateway for FakeEmbeddingGateway {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            anyhow::bail!("embedding backend offline");
        }
        Ok(bag_of_words(text))
    }

    fn model_name(&self) -> &str {
        "fake-bow"
    }
}

/// Returns the same summary for every session.
pub struct StaticSummarizer {
    outcome: Option<SummaryOutcome>,
    delay: Option<Duration>,
}

impl StaticSummarizer {
    /// Summary text plus one candidate pattern derived from it.
    pub fn with_candidate(summary: &str) -> Self {
        let outcome = SummaryOutcome {
            summary: summary.to_string(),
            ai_summary: Some(AiSummary {
                key_events: vec![summary.to_string()],
                ..Default::default()
            }),
            candidate_patterns: vec![CandidatePattern {
                pattern_type: PatternType::Process,
                domain: "testing".to_string(),
                description: summary.to_string(),
                action: "repeat what worked".to_string(),
                outcome: None,
                context: Map::new(),
            }],
        };
        Self { outcome: Some(outcome), delay: None }
    }

    pub fn failing() -> Self {
        Self { outcome: None, delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Summarizer for StaticSummarizer {
    async fn summarize(&self, _events: &[SessionEvent]) -> anyhow::Result<Option<SummaryOutcome>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.outcome {
            Some(outcome) => Ok(Some(outcome.clone())),
            None => anyhow::bail!("summarizer unavailable"),
        }
    }
}

/// Every service over one in-memory database.
pub struct TestHarness {
    pub db: Arc<MemoryDatabase>,
    pub sessions: Arc<SessionManager>,
    pub handoffs: Arc<HandoffCoordinator>,
    pub patterns: Arc<PatternStore>,
    pub search: Arc<UnifiedSearchEngine>,
    pub indexer: Arc<EntityIndexer>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_gateway(FakeEmbeddingGateway::new())
    }

    pub fn with_failing_embeddings() -> Self {
        Self::with_gateway(FakeEmbeddingGateway::failing())
    }

    fn with_gateway(gateway: FakeEmbeddingGateway) -> Self {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let state = SharedState::from_parts(
            Config::default(),
            Arc::clone(&db),
            Arc::new(gateway),
            Arc::new(StaticSummarizer::with_candidate("Static summary")),
        )
        .unwrap();
        Self {
            db,
            sessions: state.sessions,
            handoffs: state.handoffs,
            patterns: state.patterns,
            search: state.search,
            indexer: state.indexer,
        }
    }
}
