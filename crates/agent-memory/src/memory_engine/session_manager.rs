//! Session lifecycle: start, append, update, end, and semantic lookup.
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{MemoryError, Result};
use crate::memory_db::{
    Agent, EmbeddingSpace, MemoryDatabase, NewSession, Session, SessionEvent, SessionPatch,
};
use crate::memory_engine::embedder::Embedder;
use crate::memory_engine::{run_blocking, Scored};
use crate::metrics;
use crate::worker_threads::SummaryWorker;

/// Partial update for `SessionManager::update`.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub summary: Option<String>,
    pub context: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
}

pub struct SessionManager {
    database: Arc<MemoryDatabase>,
    embedder: Arc<Embedder>,
    summaries: Arc<SummaryWorker>,
}

impl SessionManager {
    pub fn new(database: Arc<MemoryDatabase>, embedder: Arc<Embedder>, summaries: Arc<SummaryWorker>) -> Self {
        Self { database, embedder, summaries }
    }

    pub async fn start(
        &self,
        agent: &str,
        project_id: Option<&str>,
        context: Option<Map<String, Value>>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Session> {
        let agent: Agent = agent.parse()?;
        let project_id = project_id.map(str::to_string);

        let session = run_blocking(&self.database, move |db| {
            db.sessions.create_session(NewSession {
                agent,
                project_id: project_id.as_deref(),
                context: context.unwrap_or_default(),
                metadata: metadata.unwrap_or_default(),
            })
        })
        .await?;

        metrics::inc_session("started");
        Ok(session)
    }

    pub async fn append_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: Value,
        metadata: Option<Map<String, Value>>,
    ) -> Result<SessionEvent> {
        let event_type = event_type.trim();
        if event_type.is_empty() {
            return Err(MemoryError::invalid_argument("event_type must not be blank"));
        }

        let id = session_id.to_string();
        let event_type = event_type.to_string();
        let event = run_blocking(&self.database, move |db| {
            db.sessions.append_event(&id, &event_type, data, metadata.unwrap_or_default())
        })
        .await?;

        metrics::inc_event();
        Ok(event)
    }

    /// Partial update. A new summary replaces the session's embedding.
    pub async fn update(&self, session_id: &str, update: SessionUpdate) -> Result<Session> {
        if let Some(summary) = &update.summary {
            if summary.trim().is_empty() {
                return Err(MemoryError::invalid_argument("summary must not be blank"));
            }
        }

        let id = session_id.to_string();
        let patch = SessionPatch {
            summary: update.summary,
            context: update.context,
            metadata: update.metadata,
        };
        let summary_changed = patch.summary.is_some();
        let mut session = run_blocking(&self.database, move |db| db.sessions.update_session(&id, patch)).await?;

        if summary_changed {
            session.embedding = self.refresh_embedding(&session).await?;
        } else {
            session.embedding = self.load_embedding(&session.id).await?;
        }
        Ok(session)
    }

    /// Close a session exactly once.
    ///
    /// With a summary the embedding is computed before returning. Without
    /// one, summarization is handed to the background worker and its outcome
    /// never affects this call.
    pub async fn end(
        &self,
        session_id: &str,
        summary: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Session> {
        let summary = summary.filter(|s| !s.trim().is_empty());
        let has_summary = summary.is_some();

        let id = session_id.to_string();
        let mut session = run_blocking(&self.database, move |db| db.sessions.end_session(&id, summary, metadata)).await?;
        metrics::inc_session("ended");

        // The session is closed from here on; index trouble only costs the vector.
        let embedding = if has_summary {
            self.refresh_embedding(&session).await
        } else if session.summary.is_none() {
            self.summaries.dispatch(session.id.clone());
            Ok(None)
        } else {
            self.load_embedding(&session.id).await
        };
        session.embedding = embedding.unwrap_or_else(|e| {
            warn!("Session {} ended but its embedding could not be stored: {}", session.id, e);
            None
        });

        info!("Session {} closed (summary {})", session.id, if has_summary { "supplied" } else { "pending" });
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let id = session_id.to_string();
        let mut session = run_blocking(&self.database, move |db| db.sessions.get_session(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("Session", session_id))?;
        session.embedding = self.load_embedding(&session.id).await?;
        Ok(session)
    }

    /// Events in append order.
    pub async fn events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let id = session_id.to_string();
        run_blocking(&self.database, move |db| {
            if db.sessions.get_session(&id)?.is_none() {
                return Err(MemoryError::not_found("Session", id.as_str()));
            }
            db.sessions.get_events(&id)
        })
        .await
    }

    /// Most recently active sessions, optionally for one agent.
    pub async fn recent_activity(&self, limit: usize, agent: Option<&str>) -> Result<Vec<Session>> {
        let agent = agent.map(str::parse::<Agent>).transpose()?;
        run_blocking(&self.database, move |db| db.sessions.recent_activity(limit, agent)).await
    }

    /// Sessions ranked by similarity of their summary embedding to `query`.
    pub async fn search(&self, query: &str, limit: usize, min_similarity: f32) -> Result<Vec<Scored<Session>>> {
        metrics::inc_search("session");
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(vector) = self.embedder.embed_query(query).await else {
            debug!("No query embedding; session search returns nothing");
            return Ok(Vec::new());
        };

        run_blocking(&self.database, move |db| {
            let neighbors = db.embeddings.nearest_neighbors(EmbeddingSpace::Session, &vector, limit, min_similarity)?;
            let ids: Vec<String> = neighbors.iter().map(|n| n.id.clone()).collect();
            let mut sessions = db.sessions.get_sessions(&ids)?;

            let mut results = Vec::with_capacity(neighbors.len());
            for neighbor in neighbors {
                if let Some(pos) = sessions.iter().position(|s| s.id == neighbor.id) {
                    let mut session = sessions.swap_remove(pos);
                    session.embedding = db.embeddings.get(EmbeddingSpace::Session, &session.id)?;
                    results.push(Scored { item: session, similarity: neighbor.similarity });
                }
            }
            Ok(results)
        })
        .await
    }

    /// Wait for in-flight summarization jobs.
    pub async fn wait_for_background_jobs(&self) {
        self.summaries.wait_idle().await;
    }

    async fn load_embedding(&self, session_id: &str) -> Result<Option<Vec<f32>>> {
        let id = session_id.to_string();
        run_blocking(&self.database, move |db| db.embeddings.get(EmbeddingSpace::Session, &id)).await
    }

    /// Recompute the embedding from the current summary. A failed embedding
    /// drops the stale vector instead of keeping one for the old text.
    async fn refresh_embedding(&self, session: &Session) -> Result<Option<Vec<f32>>> {
        let Some(summary) = session.summary.as_deref() else {
            return Ok(None);
        };
        let vector = self.embedder.embed(summary).await;
        let id = session.id.clone();
        let model = self.embedder.model_name().to_string();
        let stored = vector.clone();
        run_blocking(&self.database, move |db| match stored {
            Some(v) => db.embeddings.upsert(EmbeddingSpace::Session, &id, &v, &model),
            None => db.embeddings.delete(EmbeddingSpace::Session, &id).map(|_| ()),
        })
        .await?;

        if vector.is_none() {
            warn!("Session {} has a summary but no embedding", session.id);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;
    use serde_json::json;

    #[tokio::test]
    async fn test_start_rejects_unknown_agent() {
        let h = TestHarness::new();
        let err = h.sessions.start("copilot", None, None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
        let err = h.sessions.start("", None, None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_blank_event_type_rejected() {
        let h = TestHarness::new();
        let s = h.sessions.start("claude", None, None, None).await.unwrap();
        let err = h.sessions.append_event(&s.id, "  ", json!({}), None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_end_with_summary_embeds_inline() {
        let h = TestHarness::new();
        let s = h.sessions.start("claude", Some("proj-1"), None, None).await.unwrap();
        let ended = h.sessions.end(&s.id, Some("Fixed the flaky test".into()), None).await.unwrap();
        assert!(ended.ended_at.is_some());
        assert!(ended.embedding.is_some());
        assert_eq!(h.sessions.get(&s.id).await.unwrap().embedding, ended.embedding);
    }

    #[tokio::test]
    async fn test_end_without_summary_runs_background_summary() {
        let h = TestHarness::new();
        let s = h.sessions.start("gemini", None, None, None).await.unwrap();
        h.sessions.append_event(&s.id, "tool_use", json!({"cmd": "ls"}), None).await.unwrap();

        let ended = h.sessions.end(&s.id, None, None).await.unwrap();
        assert!(ended.summary.is_none());

        h.sessions.wait_for_background_jobs().await;
        let stored = h.sessions.get(&s.id).await.unwrap();
        assert_eq!(stored.summary.as_deref(), Some("Static summary"));
        assert!(stored.embedding.is_some());
    }

    #[tokio::test]
    async fn test_end_survives_embedding_outage() {
        let h = TestHarness::with_failing_embeddings();
        let s = h.sessions.start("gpt", None, None, None).await.unwrap();
        let ended = h.sessions.end(&s.id, Some("done".into()), None).await.unwrap();
        assert!(ended.ended_at.is_some());
        assert!(ended.embedding.is_none());
    }

    #[tokio::test]
    async fn test_end_survives_vector_store_failure() {
        let h = TestHarness::new();
        let s = h.sessions.start("claude", None, None, None).await.unwrap();
        h.db.execute_batch("DROP TABLE embeddings").unwrap();

        let ended = h.sessions.end(&s.id, Some("shipped the release".into()), None).await.unwrap();
        assert!(ended.ended_at.is_some());
        assert!(ended.embedding.is_none());

        let err = h.sessions.end(&s.id, None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_summary_update_replaces_embedding() {
        let h = TestHarness::new();
        let s = h.sessions.start("claude", None, None, None).await.unwrap();
        let first = h
            .sessions
            .update(&s.id, SessionUpdate { summary: Some("database migration".into()), ..Default::default() })
            .await
            .unwrap();
        let second = h
            .sessions
            .update(&s.id, SessionUpdate { summary: Some("frontend styling".into()), ..Default::default() })
            .await
            .unwrap();
        assert!(first.embedding.is_some() && second.embedding.is_some());
        assert_ne!(first.embedding, second.embedding);
    }

    #[tokio::test]
    async fn test_search_ranks_and_limits() {
        let h = TestHarness::new();
        for summary in ["database index tuning", "database migration rollback", "css grid layout"] {
            let s = h.sessions.start("claude", None, None, None).await.unwrap();
            h.sessions.end(&s.id, Some(summary.into()), None).await.unwrap();
        }

        let hits = h.sessions.search("database migration", 2, 0.0).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].item.summary.as_deref(), Some("database migration rollback"));
        assert!(hits[0].similarity >= hits[1].similarity);

        let strict = h.sessions.search("database migration", 10, 0.99).await.unwrap();
        assert!(strict.iter().all(|hit| hit.similarity >= 0.99));
    }

    #[tokio::test]
    async fn test_events_for_unknown_session() {
        let h = TestHarness::new();
        let err = h.sessions.events("missing").await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }
}
