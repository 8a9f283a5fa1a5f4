//! One query across sessions, tasks, projects and patterns.
//!
//! The query is embedded once and every source is asked in parallel under
//! its own timeout. A source that fails or times out is reported in the
//! response metadata instead of failing the call; only when every source
//! fails does the search itself fail.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::{EmbeddingSpace, MemoryDatabase, Neighbor};
use crate::memory_engine::embedder::Embedder;
use crate::memory_engine::run_blocking;
use crate::metrics;
use crate::utils::TextUtils;

const TITLE_MAX_CHARS: usize = 80;
/// Neighbors are hydrated this many at a time, well under SQLite's
/// bind-variable limit.
const HYDRATE_BATCH: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Session,
    Task,
    Project,
    Pattern,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [EntityKind::Session, EntityKind::Task, EntityKind::Project, EntityKind::Pattern];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Session => "session",
            EntityKind::Task => "task",
            EntityKind::Project => "project",
            EntityKind::Pattern => "pattern",
        }
    }

    fn space(&self) -> EmbeddingSpace {
        match self {
            EntityKind::Session => EmbeddingSpace::Session,
            EntityKind::Task => EmbeddingSpace::Task,
            EntityKind::Project => EmbeddingSpace::Project,
            EntityKind::Pattern => EmbeddingSpace::Pattern,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub kind: EntityKind,
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub similarity: f32,
    pub created_at: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchMetadata {
    pub sources_queried: Vec<EntityKind>,
    pub failed_sources: Vec<EntityKind>,
    pub embedding_available: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub metadata: SearchMetadata,
}

/// One searchable entity kind.
#[async_trait]
pub trait SearchSource: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Up to `k` hits with similarity at least `min_similarity`, best first.
    async fn lookup(&self, vector: &[f32], k: usize, min_similarity: f32) -> Result<Vec<SearchHit>>;
}

/// Source backed by the vector index and the matching table.
pub struct StoreSearchSource {
    kind: EntityKind,
    database: Arc<MemoryDatabase>,
}

impl StoreSearchSource {
    pub fn new(kind: EntityKind, database: Arc<MemoryDatabase>) -> Self {
        Self { kind, database }
    }
}

#[async_trait]
impl SearchSource for StoreSearchSource {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn lookup(&self, vector: &[f32], k: usize, min_similarity: f32) -> Result<Vec<SearchHit>> {
        let kind = self.kind;
        let vector = vector.to_vec();
        run_blocking(&self.database, move |db| {
            // Retired patterns keep their vectors, so rank every pattern and
            // skip retired rows while hydrating.
            let fetch = if kind == EntityKind::Pattern { usize::MAX } else { k };
            let neighbors = db.embeddings.nearest_neighbors(kind.space(), &vector, fetch, min_similarity)?;
            collect_hits(db, kind, &neighbors, k, HYDRATE_BATCH)
        })
        .await
    }
}

/// Hydrate ranked neighbors `batch` at a time until `k` hits are found.
fn collect_hits(
    db: &MemoryDatabase,
    kind: EntityKind,
    neighbors: &[Neighbor],
    k: usize,
    batch: usize,
) -> Result<Vec<SearchHit>> {
    let mut hits = Vec::new();
    for chunk in neighbors.chunks(batch.max(1)) {
        if hits.len() >= k {
            break;
        }
        hits.extend(load_hits(db, kind, chunk)?);
    }
    sort_hits(&mut hits);
    hits.truncate(k);
    Ok(hits)
}

/// Materialize neighbors into hits, keeping neighbor order. Ids whose row is
/// gone are skipped.
fn load_hits(db: &MemoryDatabase, kind: EntityKind, neighbors: &[Neighbor]) -> Result<Vec<SearchHit>> {
    let ids: Vec<String> = neighbors.iter().map(|n| n.id.clone()).collect();
    let mut hits: Vec<SearchHit> = match kind {
        EntityKind::Session => db
            .sessions
            .get_sessions(&ids)?
            .into_iter()
            .map(|s| {
                let title = match s.summary.as_deref() {
                    Some(summary) => TextUtils::headline(summary, TITLE_MAX_CHARS),
                    None => format!("{} session", s.agent),
                };
                let mut metadata = s.metadata;
                metadata.insert("agent".into(), json!(s.agent));
                metadata.insert("project_id".into(), json!(s.project_id));
                metadata.insert("ended".into(), json!(s.ended_at.is_some()));
                hit(kind, s.id, title, s.summary, s.started_at, metadata)
            })
            .collect(),
        EntityKind::Task => db
            .workspace
            .get_tasks(&ids)?
            .into_iter()
            .map(|t| {
                let mut metadata = t.metadata;
                metadata.insert("status".into(), json!(t.status));
                metadata.insert("project_id".into(), json!(t.project_id));
                metadata.insert("assigned_agent".into(), json!(t.assigned_agent));
                hit(kind, t.id, t.title, t.description, t.created_at, metadata)
            })
            .collect(),
        EntityKind::Project => db
            .workspace
            .get_projects(&ids)?
            .into_iter()
            .map(|p| {
                let mut metadata = p.metadata;
                metadata.insert("status".into(), json!(p.status));
                hit(kind, p.id, p.name, p.description, p.created_at, metadata)
            })
            .collect(),
        EntityKind::Pattern => db
            .patterns
            .get_patterns(&ids)?
            .into_iter()
            .filter(|p| !p.is_retired())
            .map(|p| {
                let mut metadata = Map::new();
                metadata.insert("pattern_type".into(), json!(p.pattern_type));
                metadata.insert("domain".into(), json!(p.domain));
                metadata.insert("confidence".into(), json!(p.metadata.confidence));
                metadata.insert("observation_count".into(), json!(p.metadata.observation_count));
                let title = TextUtils::headline(&p.description, TITLE_MAX_CHARS);
                hit(kind, p.id, title, Some(p.action), p.created_at, metadata)
            })
            .collect(),
    };

    for h in hits.iter_mut() {
        if let Some(n) = neighbors.iter().find(|n| n.id == h.id) {
            h.similarity = n.similarity;
        }
    }
    sort_hits(&mut hits);
    Ok(hits)
}

fn hit(
    kind: EntityKind,
    id: String,
    title: String,
    description: Option<String>,
    created_at: DateTime<Utc>,
    metadata: Map<String, Value>,
) -> SearchHit {
    SearchHit { kind, id, title, description, similarity: 0.0, created_at, metadata }
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.kind.as_str().cmp(b.kind.as_str()))
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub struct UnifiedSearchEngine {
    embedder: Arc<Embedder>,
    sources: Vec<Arc<dyn SearchSource>>,
    source_timeout: Duration,
}

impl UnifiedSearchEngine {
    pub fn new(embedder: Arc<Embedder>, sources: Vec<Arc<dyn SearchSource>>, source_timeout: Duration) -> Self {
        Self { embedder, sources, source_timeout }
    }

    /// Engine over the four store-backed sources.
    pub fn with_store_sources(embedder: Arc<Embedder>, database: Arc<MemoryDatabase>, source_timeout: Duration) -> Self {
        let sources = EntityKind::ALL
            .into_iter()
            .map(|kind| Arc::new(StoreSearchSource::new(kind, Arc::clone(&database))) as Arc<dyn SearchSource>)
            .collect();
        Self::new(embedder, sources, source_timeout)
    }

    pub async fn search(&self, query: &str, limit: usize, min_similarity: f32) -> Result<SearchResponse> {
        if !(-1.0..=1.0).contains(&min_similarity) {
            return Err(MemoryError::invalid_argument(format!(
                "min_similarity must be within [-1, 1], got {}",
                min_similarity
            )));
        }
        metrics::inc_search("unified");

        let Some(vector) = self.embedder.embed_query(query).await else {
            debug!("Query embedding unavailable; unified search returns nothing");
            return Ok(SearchResponse::default());
        };
        let mut metadata = SearchMetadata {
            sources_queried: self.sources.iter().map(|s| s.kind()).collect(),
            failed_sources: Vec::new(),
            embedding_available: true,
        };
        if limit == 0 || self.sources.is_empty() {
            return Ok(SearchResponse { results: Vec::new(), metadata });
        }

        let lookups = self.sources.iter().map(|source| {
            let vector = &vector;
            async move {
                let outcome = tokio::time::timeout(self.source_timeout, source.lookup(vector, limit, min_similarity)).await;
                (source.kind(), outcome)
            }
        });

        let mut results = Vec::new();
        for (kind, outcome) in join_all(lookups).await {
            match outcome {
                Ok(Ok(hits)) => results.extend(hits),
                Ok(Err(e)) => {
                    warn!("Search source {} failed: {}", kind.as_str(), e);
                    metrics::inc_source_failure(kind.as_str());
                    metadata.failed_sources.push(kind);
                }
                Err(_) => {
                    warn!("Search source {} timed out after {:?}", kind.as_str(), self.source_timeout);
                    metrics::inc_source_failure(kind.as_str());
                    metadata.failed_sources.push(kind);
                }
            }
        }

        if metadata.failed_sources.len() == self.sources.len() {
            return Err(MemoryError::Unavailable("every search source failed".to_string()));
        }

        results.retain(|h| h.similarity >= min_similarity);
        sort_hits(&mut results);
        results.truncate(limit);
        debug!("Unified search returned {} hits", results.len());
        Ok(SearchResponse { results, metadata })
    }
}
