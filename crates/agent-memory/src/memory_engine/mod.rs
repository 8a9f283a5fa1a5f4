//! Memory engine - the services agents call: sessions, handoffs, patterns and search

pub mod confidence;
pub mod embedder;
pub mod summarization;
pub mod session_manager;
pub mod handoff_coordinator;
pub mod pattern_store;
pub mod unified_search;
pub mod indexer;
pub mod pruner;

pub use confidence::{compute_confidence, ConfidenceParams};
pub use embedder::{Embedder, EmbeddingGateway};
pub use summarization::{Summarizer, SummaryOutcome};
pub use session_manager::{SessionManager, SessionUpdate};
pub use handoff_coordinator::HandoffCoordinator;
pub use pattern_store::{HarvestRequest, PatternMatch, PatternQuery, PatternStore};
pub use unified_search::{
    EntityKind, SearchHit, SearchMetadata, SearchResponse, SearchSource, StoreSearchSource, UnifiedSearchEngine,
};
pub use indexer::{BackfillReport, EntityIndexer};
pub use pruner::PatternPruner;

use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;
use crate::memory_db::MemoryDatabase;

/// An entity with its similarity to a query.
#[derive(Debug, Clone, Serialize)]
pub struct Scored<T> {
    #[serde(flatten)]
    pub item: T,
    pub similarity: f32,
}

/// Run a synchronous store call on the blocking pool.
pub(crate) async fn run_blocking<T, F>(database: &Arc<MemoryDatabase>, f: F) -> Result<T>
where
    F: FnOnce(&MemoryDatabase) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let database = Arc::clone(database);
    tokio::task::spawn_blocking(move || f(&database)).await?
}
