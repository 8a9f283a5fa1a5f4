//! Pattern harvesting, observation and retrieval.
use serde::Serialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::embedding_store::cosine_similarity;
use crate::memory_db::{
    Agent, CandidatePattern, EmbeddingSpace, MemoryDatabase, NewObservation, NewPattern, Pattern,
    PatternFilter, PatternMetadata, PatternObservation, PatternType,
};
use crate::memory_engine::confidence::ConfidenceParams;
use crate::memory_engine::embedder::Embedder;
use crate::memory_engine::run_blocking;
use crate::metrics;

#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub pattern_type: PatternType,
    pub domain: String,
    pub description: String,
    pub action: String,
    pub outcome: Option<String>,
    pub context: Map<String, Value>,
    pub created_by: Option<Agent>,
    pub harvested_from_session: Option<String>,
}

impl HarvestRequest {
    pub fn new(
        pattern_type: PatternType,
        domain: impl Into<String>,
        description: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            pattern_type,
            domain: domain.into(),
            description: description.into(),
            action: action.into(),
            outcome: None,
            context: Map::new(),
            created_by: None,
            harvested_from_session: None,
        }
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }

    pub fn created_by(mut self, agent: Agent) -> Self {
        self.created_by = Some(agent);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PatternQuery {
    pub query: Option<String>,
    pub domain: Option<String>,
    pub pattern_type: Option<PatternType>,
    pub limit: usize,
    pub include_retired: bool,
}

impl Default for PatternQuery {
    fn default() -> Self {
        Self { query: None, domain: None, pattern_type: None, limit: 10, include_retired: false }
    }
}

/// A `find` result. `similarity` is set only when ranked against a query.
#[derive(Debug, Clone, Serialize)]
pub struct PatternMatch {
    #[serde(flatten)]
    pub pattern: Pattern,
    pub similarity: Option<f32>,
}

pub struct PatternStore {
    database: Arc<MemoryDatabase>,
    embedder: Arc<Embedder>,
    confidence: ConfidenceParams,
}

impl PatternStore {
    pub fn new(database: Arc<MemoryDatabase>, embedder: Arc<Embedder>, confidence: ConfidenceParams) -> Self {
        Self { database, embedder, confidence }
    }

    /// Store a new pattern with no confidence yet and embed it.
    pub async fn harvest(&self, request: HarvestRequest) -> Result<Pattern> {
        if request.description.trim().is_empty() {
            return Err(MemoryError::invalid_argument("description must not be empty"));
        }
        if request.action.trim().is_empty() {
            return Err(MemoryError::invalid_argument("action must not be empty"));
        }

        let new = NewPattern {
            pattern_type: request.pattern_type,
            domain: request.domain.trim().to_string(),
            description: request.description,
            action: request.action,
            outcome: request.outcome.filter(|o| !o.trim().is_empty()),
            context: request.context,
            metadata: PatternMetadata {
                harvested_from_session: request.harvested_from_session,
                ..Default::default()
            },
            created_by: request.created_by,
        };
        let mut pattern = run_blocking(&self.database, move |db| db.patterns.insert_pattern(new)).await?;

        if let Some(vector) = self.embedder.embed(&pattern.embedding_text()).await {
            let id = pattern.id.clone();
            let model = self.embedder.model_name().to_string();
            let stored = vector.clone();
            run_blocking(&self.database, move |db| {
                db.embeddings.upsert(EmbeddingSpace::Pattern, &id, &stored, &model)
            })
            .await?;
            pattern.embedding = Some(vector);
        } else {
            warn!("Pattern {} stored without an embedding", pattern.id);
        }
        Ok(pattern)
    }

    /// Promote the `index`-th candidate the summarizer proposed for a session.
    pub async fn harvest_candidate(
        &self,
        session_id: &str,
        index: usize,
        created_by: Option<&str>,
    ) -> Result<Pattern> {
        let created_by = created_by.map(str::parse::<Agent>).transpose()?;
        let id = session_id.to_string();
        let session = run_blocking(&self.database, move |db| db.sessions.get_session(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("Session", session_id))?;

        let candidates: Vec<CandidatePattern> = match session.metadata.get("candidate_patterns") {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => Vec::new(),
        };
        let candidate = candidates.into_iter().nth(index).ok_or_else(|| {
            MemoryError::invalid_argument(format!("session {} has no candidate pattern #{}", session_id, index))
        })?;

        self.harvest(HarvestRequest {
            pattern_type: candidate.pattern_type,
            domain: candidate.domain,
            description: candidate.description,
            action: candidate.action,
            outcome: candidate.outcome,
            context: candidate.context,
            created_by: created_by.or(Some(session.agent)),
            harvested_from_session: Some(session.id),
        })
        .await
    }

    /// Record how well a pattern worked and recompute its confidence.
    pub async fn observe(
        &self,
        pattern_id: &str,
        rating: i32,
        feedback: Option<String>,
        session_id: Option<String>,
    ) -> Result<PatternObservation> {
        let success_rating = u8::try_from(rating)
            .ok()
            .filter(|r| (1..=5).contains(r))
            .ok_or_else(|| MemoryError::invalid_argument(format!("rating must be between 1 and 5, got {}", rating)))?;

        let id = pattern_id.to_string();
        let params = self.confidence;
        let (observation, pattern) = run_blocking(&self.database, move |db| {
            db.patterns.record_observation(
                &id,
                NewObservation { session_id, success_rating, feedback, metadata: Map::new() },
                &params,
            )
        })
        .await?;

        metrics::inc_observation();
        debug!(
            "Pattern {} has {} observations, confidence {:?}",
            pattern.id, pattern.metadata.observation_count, pattern.metadata.confidence
        );
        Ok(observation)
    }

    pub async fn find(&self, query: PatternQuery) -> Result<Vec<PatternMatch>> {
        metrics::inc_search("pattern");
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let text = query.query.as_deref().map(str::trim).filter(|q| !q.is_empty());
        let vector = match text {
            Some(text) => {
                let vector = self.embedder.embed_query(text).await;
                if vector.is_none() {
                    debug!("Query embedding unavailable; ranking patterns by confidence");
                }
                vector
            }
            None => None,
        };

        let limit = query.limit;
        let filter = PatternFilter {
            domain: query.domain.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
            pattern_type: query.pattern_type,
            include_retired: query.include_retired,
            limit: if vector.is_some() { None } else { Some(limit) },
        };

        run_blocking(&self.database, move |db| {
            let patterns = db.patterns.query_patterns(&filter)?;
            let Some(vector) = vector else {
                return Ok(patterns.into_iter().map(|pattern| PatternMatch { pattern, similarity: None }).collect());
            };

            let ids: Vec<String> = patterns.iter().map(|p| p.id.clone()).collect();
            let mut embeddings = db.embeddings.get_many(EmbeddingSpace::Pattern, &ids)?;
            let mut matches: Vec<PatternMatch> = patterns
                .into_iter()
                .filter_map(|mut pattern| {
                    let embedding = embeddings.remove(&pattern.id)?;
                    let similarity = cosine_similarity(&vector, &embedding);
                    pattern.embedding = Some(embedding);
                    Some(PatternMatch { pattern, similarity: Some(similarity) })
                })
                .collect();
            matches.sort_by(|a, b| {
                b.similarity
                    .partial_cmp(&a.similarity)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.pattern.id.cmp(&b.pattern.id))
            });
            matches.truncate(limit);
            Ok(matches)
        })
        .await
    }

    pub async fn get(&self, pattern_id: &str) -> Result<Pattern> {
        let id = pattern_id.to_string();
        run_blocking(&self.database, move |db| {
            let Some(mut pattern) = db.patterns.get_pattern(&id)? else {
                return Err(MemoryError::not_found("Pattern", id.as_str()));
            };
            pattern.embedding = db.embeddings.get(EmbeddingSpace::Pattern, &pattern.id)?;
            Ok(pattern)
        })
        .await
    }

    /// Observations oldest first.
    pub async fn observations(&self, pattern_id: &str) -> Result<Vec<PatternObservation>> {
        let id = pattern_id.to_string();
        run_blocking(&self.database, move |db| {
            if db.patterns.get_pattern(&id)?.is_none() {
                return Err(MemoryError::not_found("Pattern", id.as_str()));
            }
            db.patterns.get_observations(&id)
        })
        .await
    }

    /// Soft retirement: the pattern stays readable but leaves `find` and search.
    pub async fn retire(&self, pattern_id: &str, reason: &str) -> Result<Pattern> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MemoryError::invalid_argument("a retirement reason is required"));
        }
        let id = pattern_id.to_string();
        let reason = reason.to_string();
        run_blocking(&self.database, move |db| db.patterns.retire_pattern(&id, &reason)).await
    }

    /// Retire every active pattern with at least `min_observations`
    /// observations and confidence under `threshold`. Returns retired ids.
    pub async fn retire_low_confidence(&self, min_observations: u32, threshold: f64) -> Result<Vec<String>> {
        run_blocking(&self.database, move |db| {
            let candidates = db.patterns.low_confidence_ids(min_observations, threshold)?;
            let mut retired = Vec::with_capacity(candidates.len());
            for id in candidates {
                let reason = format!("confidence below {:.2}", threshold);
                match db.patterns.retire_pattern(&id, &reason) {
                    Ok(_) => retired.push(id),
                    // Retired concurrently by someone else.
                    Err(MemoryError::InvalidState(_)) | Err(MemoryError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(retired)
        })
        .await
    }

    /// Hard delete of the pattern, its observations and its vector.
    pub async fn delete(&self, pattern_id: &str) -> Result<()> {
        let id = pattern_id.to_string();
        run_blocking(&self.database, move |db| db.patterns.delete_pattern(&id, &db.embeddings)).await?;
        info!("Pattern {} removed", pattern_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    fn request(description: &str, action: &str) -> HarvestRequest {
        HarvestRequest::new(PatternType::Technical, "rust", description, action)
    }

    #[tokio::test]
    async fn test_harvest_validates_and_embeds() {
        let h = TestHarness::new();
        let err = h.patterns.harvest(request("", "do it")).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
        let err = h.patterns.harvest(request("something", "  ")).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));

        let pattern = h.patterns.harvest(request("borrow checker fights", "clone the arc")).await.unwrap();
        assert!(pattern.confidence().is_none());
        assert!(pattern.embedding.is_some());
        assert_eq!(h.patterns.get(&pattern.id).await.unwrap().embedding, pattern.embedding);
    }

    #[tokio::test]
    async fn test_observe_rating_bounds() {
        let h = TestHarness::new();
        let pattern = h.patterns.harvest(request("retry flaky io", "exponential backoff")).await.unwrap();
        for bad in [0, 6, -1] {
            let err = h.patterns.observe(&pattern.id, bad, None, None).await.unwrap_err();
            assert!(matches!(err, MemoryError::InvalidArgument(_)));
        }
        let err = h.patterns.observe("missing", 3, None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
        assert!(h.patterns.get(&pattern.id).await.unwrap().confidence().is_none());
    }

    #[tokio::test]
    async fn test_single_five_is_dampened() {
        let h = TestHarness::new();
        let pattern = h.patterns.harvest(request("cache warm", "preload")).await.unwrap();
        h.patterns.observe(&pattern.id, 5, Some("worked".into()), None).await.unwrap();
        let confidence = h.patterns.get(&pattern.id).await.unwrap().confidence().unwrap();
        assert!(confidence > 0.5 && confidence < 1.0);
    }

    #[tokio::test]
    async fn test_find_without_query_orders_by_confidence() {
        let h = TestHarness::new();
        let low = h.patterns.harvest(request("low", "a")).await.unwrap();
        let high = h.patterns.harvest(request("high", "b")).await.unwrap();
        let unrated = h.patterns.harvest(request("unrated", "c")).await.unwrap();
        h.patterns.observe(&low.id, 1, None, None).await.unwrap();
        h.patterns.observe(&high.id, 5, None, None).await.unwrap();

        let found = h.patterns.find(PatternQuery::default()).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|m| m.pattern.id.as_str()).collect();
        assert_eq!(ids, vec![high.id.as_str(), low.id.as_str(), unrated.id.as_str()]);
        assert!(found.iter().all(|m| m.similarity.is_none()));
    }

    #[tokio::test]
    async fn test_find_with_query_filters_then_ranks() {
        let h = TestHarness::new();
        h.patterns.harvest(request("sqlite busy timeout", "set busy_timeout pragma")).await.unwrap();
        h.patterns.harvest(request("css flexbox centering", "use align items")).await.unwrap();
        let mut other = request("sqlite busy timeout", "set busy_timeout pragma");
        other.domain = "python".into();
        h.patterns.harvest(other).await.unwrap();

        let found = h
            .patterns
            .find(PatternQuery {
                query: Some("sqlite busy timeout".into()),
                domain: Some("rust".into()),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].pattern.domain, "rust");
        assert_eq!(found[0].pattern.description, "sqlite busy timeout");
        assert!(found[0].similarity.is_some());
    }

    #[tokio::test]
    async fn test_find_falls_back_when_query_embedding_fails() {
        let h = TestHarness::with_failing_embeddings();
        h.patterns.harvest(request("anything", "at all")).await.unwrap();
        let found = h
            .patterns
            .find(PatternQuery { query: Some("anything".into()), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].similarity.is_none());
    }

    #[tokio::test]
    async fn test_retired_patterns_hidden_from_find() {
        let h = TestHarness::new();
        let pattern = h.patterns.harvest(request("old approach", "do x")).await.unwrap();
        h.patterns.retire(&pattern.id, "superseded").await.unwrap();
        assert!(h.patterns.find(PatternQuery::default()).await.unwrap().is_empty());

        let all = h
            .patterns
            .find(PatternQuery { include_retired: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert!(matches!(
            h.patterns.retire(&pattern.id, "again").await,
            Err(MemoryError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_retire_low_confidence() {
        let h = TestHarness::new();
        let bad = h.patterns.harvest(request("bad idea", "rm -rf")).await.unwrap();
        let good = h.patterns.harvest(request("good idea", "write tests")).await.unwrap();
        for _ in 0..4 {
            h.patterns.observe(&bad.id, 1, None, None).await.unwrap();
            h.patterns.observe(&good.id, 5, None, None).await.unwrap();
        }
        let retired = h.patterns.retire_low_confidence(3, 0.3).await.unwrap();
        assert_eq!(retired, vec![bad.id.clone()]);
        assert!(h.patterns.get(&bad.id).await.unwrap().is_retired());
        assert!(!h.patterns.get(&good.id).await.unwrap().is_retired());
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let h = TestHarness::new();
        let pattern = h.patterns.harvest(request("temp", "tmp")).await.unwrap();
        h.patterns.observe(&pattern.id, 4, None, None).await.unwrap();
        h.patterns.delete(&pattern.id).await.unwrap();

        assert!(matches!(h.patterns.get(&pattern.id).await, Err(MemoryError::NotFound { .. })));
        assert!(matches!(h.patterns.observations(&pattern.id).await, Err(MemoryError::NotFound { .. })));
        assert!(h.db.embeddings.get(EmbeddingSpace::Pattern, &pattern.id).unwrap().is_none());
        assert!(matches!(h.patterns.delete(&pattern.id).await, Err(MemoryError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_harvest_candidate_from_summary() {
        let h = TestHarness::new();
        let s = h.sessions.start("claude", None, None, None).await.unwrap();
        h.sessions.append_event(&s.id, "note", serde_json::json!({"text": "hi"}), None).await.unwrap();
        h.sessions.end(&s.id, None, None).await.unwrap();
        h.sessions.wait_for_background_jobs().await;

        let pattern = h.patterns.harvest_candidate(&s.id, 0, None).await.unwrap();
        assert_eq!(pattern.metadata.harvested_from_session.as_deref(), Some(s.id.as_str()));
        assert_eq!(pattern.created_by, Some(Agent::Claude));
        assert!(matches!(
            h.patterns.harvest_candidate(&s.id, 5, None).await,
            Err(MemoryError::InvalidArgument(_))
        ));
    }
}
