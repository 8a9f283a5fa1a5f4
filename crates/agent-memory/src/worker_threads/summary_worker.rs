//! Detached summarization of closed sessions.
//!
//! Jobs run on a `TaskTracker` owned by the worker rather than by the caller
//! of `end`, so dropping the caller's future never cancels a job.
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::memory_db::{EmbeddingSpace, MemoryDatabase};
use crate::memory_engine::embedder::Embedder;
use crate::memory_engine::run_blocking;
use crate::memory_engine::summarization::{Summarizer, SummaryOutcome};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryJobOutcome {
    Stored,
    Skipped,
    Failed,
    TimedOut,
}

impl SummaryJobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryJobOutcome::Stored => "stored",
            SummaryJobOutcome::Skipped => "skipped",
            SummaryJobOutcome::Failed => "failed",
            SummaryJobOutcome::TimedOut => "timed_out",
        }
    }
}

pub struct SummaryWorker {
    database: Arc<MemoryDatabase>,
    embedder: Arc<Embedder>,
    summarizer: Arc<dyn Summarizer>,
    tracker: TaskTracker,
    /// Serializes `wait_idle` so one caller's `reopen` can't land between
    /// another caller's `close` and `wait`.
    drain: Mutex<()>,
    timeout: Duration,
    max_events: usize,
}

impl SummaryWorker {
    pub fn new(
        database: Arc<MemoryDatabase>,
        embedder: Arc<Embedder>,
        summarizer: Arc<dyn Summarizer>,
        timeout: Duration,
        max_events: usize,
    ) -> Self {
        Self {
            database,
            embedder,
            summarizer,
            tracker: TaskTracker::new(),
            drain: Mutex::new(()),
            timeout,
            max_events: max_events.max(1),
        }
    }

    /// Queue a job and return immediately.
    pub fn dispatch(self: &Arc<Self>, session_id: String) {
        let worker = Arc::clone(self);
        self.tracker.spawn(async move {
            let outcome = worker.run(&session_id).await;
            metrics::inc_summary_job(outcome.as_str());
        });
        debug!("Dispatched summarization job ({} in flight)", self.tracker.len());
    }

    /// Wait until every job dispatched so far has finished.
    pub async fn wait_idle(&self) {
        let _drain = self.drain.lock().await;
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    pub async fn run(&self, session_id: &str) -> SummaryJobOutcome {
        match self.try_run(session_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Summarization of session {} failed: {}", session_id, e);
                SummaryJobOutcome::Failed
            }
        }
    }

    async fn try_run(&self, session_id: &str) -> Result<SummaryJobOutcome> {
        let id = session_id.to_string();
        let max_events = self.max_events;
        let events = run_blocking(&self.database, move |db| db.sessions.get_recent_events(&id, max_events)).await?;
        if events.is_empty() {
            debug!("Session {} has no events to summarize", session_id);
            return Ok(SummaryJobOutcome::Skipped);
        }

        let outcome = match tokio::time::timeout(self.timeout, self.summarizer.summarize(&events)).await {
            Ok(Ok(Some(outcome))) => outcome,
            Ok(Ok(None)) => return Ok(SummaryJobOutcome::Skipped),
            Ok(Err(e)) => {
                warn!("Summarizer failed for session {}: {}", session_id, e);
                return Ok(SummaryJobOutcome::Failed);
            }
            Err(_) => {
                warn!("Summarizer timed out after {:?} for session {}", self.timeout, session_id);
                return Ok(SummaryJobOutcome::TimedOut);
            }
        };

        let id = session_id.to_string();
        let summary = outcome.summary_text().map(str::to_string);
        let patch = summary_metadata(&outcome)?;
        let (session, wrote_summary) = run_blocking(&self.database, move |db| {
            db.sessions.apply_generated_summary(&id, summary.as_deref(), patch)
        })
        .await?;

        if wrote_summary {
            if let Some(summary) = session.summary.as_deref() {
                if let Some(vector) = self.embedder.embed(summary).await {
                    let id = session_id.to_string();
                    let model = self.embedder.model_name().to_string();
                    run_blocking(&self.database, move |db| {
                        db.embeddings.upsert(EmbeddingSpace::Session, &id, &vector, &model)
                    })
                    .await?;
                }
            }
        }

        info!(
            "Summarized session {} ({} candidate patterns)",
            session_id,
            outcome.candidate_patterns.len()
        );
        Ok(SummaryJobOutcome::Stored)
    }
}

fn summary_metadata(outcome: &SummaryOutcome) -> Result<Map<String, Value>> {
    let mut patch = Map::new();
    if let Some(ai_summary) = &outcome.ai_summary {
        patch.insert("ai_summary".to_string(), serde_json::to_value(ai_summary)?);
    }
    patch.insert(
        "candidate_patterns".to_string(),
        serde_json::to_value(&outcome.candidate_patterns)?,
    );
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::{Agent, NewSession};
    use crate::test_support::{FakeEmbeddingGateway, StaticSummarizer};
    use serde_json::json;

    fn setup(summarizer: StaticSummarizer, timeout: Duration) -> (Arc<MemoryDatabase>, Arc<SummaryWorker>, String) {
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let embedder = Arc::new(Embedder::new(
            Arc::new(FakeEmbeddingGateway::new()),
            Duration::from_secs(1),
            16,
            Duration::from_secs(60),
        ));
        let session = db
            .sessions
            .create_session(NewSession { agent: Agent::Claude, project_id: None, context: Map::new(), metadata: Map::new() })
            .unwrap();
        db.sessions.append_event(&session.id, "tool_use", json!({"cmd": "cargo test"}), Map::new()).unwrap();
        let worker = Arc::new(SummaryWorker::new(Arc::clone(&db), embedder, Arc::new(summarizer), timeout, 50));
        (db, worker, session.id)
    }

    #[tokio::test]
    async fn test_job_stores_summary_candidates_and_embedding() {
        let (db, worker, id) = setup(StaticSummarizer::with_candidate("Ran the tests"), Duration::from_secs(1));
        assert_eq!(worker.run(&id).await, SummaryJobOutcome::Stored);

        let session = db.sessions.get_session(&id).unwrap().unwrap();
        assert_eq!(session.summary.as_deref(), Some("Ran the tests"));
        assert_eq!(session.metadata["candidate_patterns"].as_array().unwrap().len(), 1);
        assert!(session.metadata.contains_key("ai_summary"));
        assert!(db.embeddings.get(EmbeddingSpace::Session, &id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_slow_summarizer_times_out_without_writes() {
        let slow = StaticSummarizer::with_candidate("late").with_delay(Duration::from_millis(300));
        let (db, worker, id) = setup(slow, Duration::from_millis(20));
        assert_eq!(worker.run(&id).await, SummaryJobOutcome::TimedOut);
        assert!(db.sessions.get_session(&id).unwrap().unwrap().summary.is_none());
    }

    #[tokio::test]
    async fn test_failing_summarizer_is_contained() {
        let (db, worker, id) = setup(StaticSummarizer::failing(), Duration::from_secs(1));
        worker.dispatch(id.clone());
        worker.wait_idle().await;
        assert!(db.sessions.get_session(&id).unwrap().unwrap().summary.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_waiters_both_see_jobs_finish() {
        let slow = StaticSummarizer::with_candidate("Ran the tests").with_delay(Duration::from_millis(50));
        let (db, worker, id) = setup(slow, Duration::from_secs(1));
        worker.dispatch(id.clone());

        let drained = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(worker.wait_idle(), worker.wait_idle());
        })
        .await;
        assert!(drained.is_ok());
        assert_eq!(db.sessions.get_session(&id).unwrap().unwrap().summary.as_deref(), Some("Ran the tests"));
        assert!(!worker.tracker.is_closed());
    }
}
