//! Shared state wiring
//!
//! Builds the database, the collaborator clients and every memory service
//! once, and hands them out behind `Arc`s.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    memory_db::MemoryDatabase,
    memory_engine::{
        Embedder, EmbeddingGateway, EntityIndexer, HandoffCoordinator, PatternPruner, PatternStore,
        SessionManager, Summarizer, UnifiedSearchEngine,
    },
    metrics,
    worker_threads::{LLMWorker, SummaryWorker},
};

pub struct SharedState {
    pub config: Arc<Config>,
    pub database: Arc<MemoryDatabase>,
    pub embedder: Arc<Embedder>,
    pub summaries: Arc<SummaryWorker>,
    pub sessions: Arc<SessionManager>,
    pub handoffs: Arc<HandoffCoordinator>,
    pub patterns: Arc<PatternStore>,
    pub search: Arc<UnifiedSearchEngine>,
    pub indexer: Arc<EntityIndexer>,
}

impl SharedState {
    /// Open the configured database and talk to the configured LLM backend.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        info!("Initializing shared state");
        let database = Arc::new(MemoryDatabase::new(&config.db_path)?);
        let llm_worker = Arc::new(LLMWorker::from_config(&config));
        Self::from_parts(config, database, llm_worker.clone(), llm_worker)
    }

    /// Wire the services over an existing database and collaborators.
    pub fn from_parts(
        config: Config,
        database: Arc<MemoryDatabase>,
        gateway: Arc<dyn EmbeddingGateway>,
        summarizer: Arc<dyn Summarizer>,
    ) -> anyhow::Result<Self> {
        metrics::init_metrics();

        match database.embeddings.initialize_index() {
            Ok(count) => info!("Vector index warmed with {} embeddings", count),
            Err(e) => warn!("Vector index not warmed, falling back to linear scans: {}", e),
        }

        let config = Arc::new(config);
        let embedder = Arc::new(Embedder::new(
            gateway,
            config.embedding_timeout(),
            config.embedding_cache_capacity,
            config.embedding_cache_ttl(),
        ));
        let summaries = Arc::new(SummaryWorker::new(
            Arc::clone(&database),
            Arc::clone(&embedder),
            summarizer,
            config.summarize_timeout(),
            config.summarize_max_events,
        ));

        Ok(Self {
            sessions: Arc::new(SessionManager::new(Arc::clone(&database), Arc::clone(&embedder), Arc::clone(&summaries))),
            handoffs: Arc::new(HandoffCoordinator::new(Arc::clone(&database))),
            patterns: Arc::new(PatternStore::new(Arc::clone(&database), Arc::clone(&embedder), config.confidence_params())),
            search: Arc::new(UnifiedSearchEngine::with_store_sources(
                Arc::clone(&embedder),
                Arc::clone(&database),
                config.search_source_timeout(),
            )),
            indexer: Arc::new(EntityIndexer::new(Arc::clone(&database), Arc::clone(&embedder))),
            config,
            database,
            embedder,
            summaries,
        })
    }

    /// Start the background pattern pruner; it stops when `shutdown` is cancelled.
    pub fn spawn_pruner(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pruner = Arc::new(PatternPruner::new(
            Arc::clone(&self.patterns),
            self.config.prune_interval(),
            self.config.prune_min_observations,
            self.config.prune_confidence_threshold,
        ));
        pruner.spawn(shutdown)
    }

    /// Let detached summarization jobs finish.
    pub async fn shutdown(&self) {
        self.summaries.wait_idle().await;
        info!("Shared state shut down");
    }
}
