//! Agent-to-agent handoffs.
//!
//! `pending -> accepted -> completed` and `pending -> rejected`; the legal
//! pairs live in `HandoffStatus::TRANSITIONS` and every move is a
//! compare-and-swap in the store.
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::error::{MemoryError, Result};
use crate::memory_db::{Agent, Handoff, HandoffStatus, MemoryDatabase, NewHandoff};
use crate::memory_engine::run_blocking;
use crate::metrics;

pub struct HandoffCoordinator {
    database: Arc<MemoryDatabase>,
}

impl HandoffCoordinator {
    pub fn new(database: Arc<MemoryDatabase>) -> Self {
        Self { database }
    }

    pub async fn create(
        &self,
        session_id: &str,
        from_agent: &str,
        to_agent: &str,
        context: Option<Value>,
        notes: Option<String>,
    ) -> Result<Handoff> {
        if session_id.trim().is_empty() {
            return Err(MemoryError::invalid_argument("session_id is required"));
        }
        let from_agent: Agent = from_agent.parse()?;
        let to_agent: Agent = to_agent.parse()?;
        if from_agent == to_agent {
            return Err(MemoryError::invalid_argument(format!(
                "cannot hand off from {} to itself",
                from_agent
            )));
        }

        let session_id = session_id.to_string();
        let handoff = run_blocking(&self.database, move |db| {
            db.handoffs.create_handoff(NewHandoff {
                session_id: &session_id,
                from_agent,
                to_agent,
                context: context.unwrap_or_else(|| Value::Object(Map::new())),
                notes,
                metadata: Map::new(),
            })
        })
        .await?;

        metrics::inc_handoff(HandoffStatus::Pending.as_str());
        Ok(handoff)
    }

    pub async fn accept(&self, handoff_id: &str) -> Result<Handoff> {
        self.transition(handoff_id, HandoffStatus::Accepted, None).await
    }

    pub async fn complete(&self, handoff_id: &str) -> Result<Handoff> {
        self.transition(handoff_id, HandoffStatus::Completed, None).await
    }

    /// Reject a pending handoff; the reason is kept in its metadata.
    pub async fn reject(&self, handoff_id: &str, reason: Option<String>) -> Result<Handoff> {
        let metadata = reason
            .filter(|r| !r.trim().is_empty())
            .and_then(|r| json!({ "rejection_reason": r }).as_object().cloned());
        self.transition(handoff_id, HandoffStatus::Rejected, metadata).await
    }

    /// Pending handoffs addressed to `agent`, oldest first.
    pub async fn list_pending(&self, agent: &str) -> Result<Vec<Handoff>> {
        let agent: Agent = agent.parse()?;
        run_blocking(&self.database, move |db| db.handoffs.get_pending(agent)).await
    }

    pub async fn get(&self, handoff_id: &str) -> Result<Handoff> {
        let id = handoff_id.to_string();
        run_blocking(&self.database, move |db| db.handoffs.get_handoff(&id))
            .await?
            .ok_or_else(|| MemoryError::not_found("Handoff", handoff_id))
    }

    pub async fn list_for_session(&self, session_id: &str) -> Result<Vec<Handoff>> {
        let id = session_id.to_string();
        run_blocking(&self.database, move |db| db.handoffs.list_for_session(&id)).await
    }

    async fn transition(
        &self,
        handoff_id: &str,
        next: HandoffStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Handoff> {
        let id = handoff_id.to_string();
        let result = run_blocking(&self.database, move |db| db.handoffs.transition(&id, next, metadata)).await;
        match &result {
            Ok(_) => metrics::inc_handoff(next.as_str()),
            Err(MemoryError::InvalidState(_)) => metrics::inc_handoff_conflict(),
            Err(_) => {}
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestHarness;

    #[tokio::test]
    async fn test_self_handoff_rejected() {
        let h = TestHarness::new();
        let err = h.handoffs.create("s-1", "claude", "claude", None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
        let err = h.handoffs.create("s-1", "claude", "robot", None, None).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_double_accept_fails() {
        let h = TestHarness::new();
        let handoff = h.handoffs.create("s-1", "claude", "gemini", None, None).await.unwrap();
        h.handoffs.accept(&handoff.id).await.unwrap();
        let err = h.handoffs.accept(&handoff.id).await.unwrap_err();
        assert!(matches!(err, MemoryError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_reject_records_reason() {
        let h = TestHarness::new();
        let handoff = h.handoffs.create("s-1", "gpt", "user", None, Some("needs review".into())).await.unwrap();
        let rejected = h.handoffs.reject(&handoff.id, Some("out of scope".into())).await.unwrap();
        assert_eq!(rejected.status, HandoffStatus::Rejected);
        assert_eq!(rejected.metadata["rejection_reason"], "out of scope");
        assert!(h.handoffs.list_pending("user").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_for_session() {
        let h = TestHarness::new();
        h.handoffs.create("s-1", "claude", "gemini", None, None).await.unwrap();
        h.handoffs.create("s-1", "gemini", "gpt", None, None).await.unwrap();
        h.handoffs.create("s-2", "gpt", "claude", None, None).await.unwrap();
        assert_eq!(h.handoffs.list_for_session("s-1").await.unwrap().len(), 2);
        assert!(matches!(h.handoffs.get("nope").await, Err(MemoryError::NotFound { .. })));
    }
}
