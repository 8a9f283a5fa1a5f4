//! Session and session-event storage
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};
use uuid::Uuid;
use tracing::{debug, info};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const SESSION_COLUMNS: &str =
    "id, agent, project_id, started_at, ended_at, last_activity_at, summary, context, metadata";

const EVENT_COLUMNS: &str = "id, session_id, seq, event_type, timestamp, data, metadata";

/// Parameters for a new session row.
pub struct NewSession<'a> {
    pub agent: Agent,
    pub project_id: Option<&'a str>,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

/// Partial update of a session. Maps are shallow-merged.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub summary: Option<String>,
    pub context: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
}

impl SessionPatch {
    fn touches_closed_fields(&self) -> bool {
        self.summary.is_some() || self.context.is_some()
    }
}

pub struct SessionStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SessionStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn create_session(&self, new: NewSession<'_>) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            agent: new.agent,
            project_id: new.project_id.map(str::to_string),
            started_at: now_micros(),
            ended_at: None,
            last_activity_at: now_micros(),
            summary: None,
            embedding: None,
            context: new.context,
            metadata: new.metadata,
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO sessions (id, agent, project_id, started_at, ended_at, last_activity_at, summary, context, metadata)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5, NULL, ?6, ?7)",
            params![
                &session.id,
                session.agent.as_str(),
                &session.project_id,
                format_timestamp(&session.started_at),
                format_timestamp(&session.last_activity_at),
                serde_json::to_string(&session.context)?,
                serde_json::to_string(&session.metadata)?,
            ],
        )?;

        info!("Created session {} for agent {}", session.id, session.agent);
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.get_conn()?;
        load_session(&conn, session_id)
    }

    /// Fetch several sessions; missing ids are skipped.
    pub fn get_sessions(&self, ids: &[String]) -> Result<Vec<Session>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let query = format!("SELECT {} FROM sessions WHERE id IN ({})", SESSION_COLUMNS, placeholders);
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    /// Append an event. The open-check and the insert share one IMMEDIATE
    /// transaction, so an append racing `end_session` either lands first or
    /// fails with `InvalidState`.
    pub fn append_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: Value,
        metadata: Map<String, Value>,
    ) -> Result<SessionEvent> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ended_at: Option<Option<String>> = tx
            .query_row(
                "SELECT ended_at FROM sessions WHERE id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        match ended_at {
            None => return Err(MemoryError::not_found("Session", session_id)),
            Some(Some(_)) => {
                return Err(MemoryError::invalid_state(format!(
                    "session {} has ended; events are no longer accepted",
                    session_id
                )))
            }
            Some(None) => {}
        }

        let (last_seq, last_ts): (i64, Option<String>) = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0), MAX(timestamp) FROM session_events WHERE session_id = ?1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        // Clock skew must never reorder a session's timeline.
        let mut timestamp = now_micros();
        if let Some(last) = last_ts.as_deref() {
            let last = parse_timestamp(last)?;
            if last > timestamp {
                timestamp = last;
            }
        }

        let event = SessionEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            seq: last_seq + 1,
            event_type: event_type.to_string(),
            timestamp,
            data,
            metadata,
        };
        let ts = format_timestamp(&event.timestamp);

        tx.execute(
            "INSERT INTO session_events (id, session_id, seq, event_type, timestamp, data, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &event.id,
                &event.session_id,
                event.seq,
                &event.event_type,
                &ts,
                serde_json::to_string(&event.data)?,
                serde_json::to_string(&event.metadata)?,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![&ts, session_id],
        )?;
        tx.commit()?;

        debug!("Appended event #{} ({}) to session {}", event.seq, event.event_type, session_id);
        Ok(event)
    }

    /// All events of a session in append order.
    pub fn get_events(&self, session_id: &str) -> Result<Vec<SessionEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM session_events WHERE session_id = ?1 ORDER BY seq",
            EVENT_COLUMNS
        ))?;
        let mut rows = stmt.query([session_id])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    /// The most recent `limit` events, still in append order.
    pub fn get_recent_events(&self, session_id: &str, limit: usize) -> Result<Vec<SessionEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM (
                 SELECT {} FROM session_events WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq",
            EVENT_COLUMNS, EVENT_COLUMNS
        ))?;
        let mut rows = stmt.query(params![session_id, limit as i64])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            events.push(row_to_event(row)?);
        }
        Ok(events)
    }

    pub fn get_event_count(&self, session_id: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM session_events WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Partial update. On an ended session only metadata may change.
    pub fn update_session(&self, session_id: &str, patch: SessionPatch) -> Result<Session> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut session = load_session(&tx, session_id)?
            .ok_or_else(|| MemoryError::not_found("Session", session_id))?;

        if session.is_ended() && patch.touches_closed_fields() {
            return Err(MemoryError::invalid_state(format!(
                "session {} has ended; only metadata can be updated",
                session_id
            )));
        }

        if let Some(summary) = patch.summary {
            session.summary = Some(summary);
        }
        if let Some(context) = patch.context {
            merge_object(&mut session.context, context);
        }
        if let Some(metadata) = patch.metadata {
            merge_object(&mut session.metadata, metadata);
        }
        session.last_activity_at = now_micros().max(session.last_activity_at);

        tx.execute(
            "UPDATE sessions SET summary = ?1, context = ?2, metadata = ?3, last_activity_at = ?4 WHERE id = ?5",
            params![
                &session.summary,
                serde_json::to_string(&session.context)?,
                serde_json::to_string(&session.metadata)?,
                format_timestamp(&session.last_activity_at),
                session_id,
            ],
        )?;
        tx.commit()?;

        debug!("Updated session {}", session_id);
        Ok(session)
    }

    /// Close a session exactly once.
    pub fn end_session(
        &self,
        session_id: &str,
        summary: Option<String>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Session> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut session = load_session(&tx, session_id)?
            .ok_or_else(|| MemoryError::not_found("Session", session_id))?;
        if let Some(ended_at) = session.ended_at {
            return Err(MemoryError::invalid_state(format!(
                "session {} already ended at {}",
                session_id,
                format_timestamp(&ended_at)
            )));
        }

        let ended_at = now_micros().max(session.started_at).max(session.last_activity_at);
        if summary.is_some() {
            session.summary = summary;
        }
        if let Some(metadata) = metadata {
            merge_object(&mut session.metadata, metadata);
        }
        session.ended_at = Some(ended_at);
        session.last_activity_at = ended_at;

        let updated = tx.execute(
            "UPDATE sessions SET ended_at = ?1, summary = ?2, metadata = ?3, last_activity_at = ?4
             WHERE id = ?5 AND ended_at IS NULL",
            params![
                format_timestamp(&ended_at),
                &session.summary,
                serde_json::to_string(&session.metadata)?,
                format_timestamp(&session.last_activity_at),
                session_id,
            ],
        )?;
        if updated != 1 {
            return Err(MemoryError::invalid_state(format!("session {} already ended", session_id)));
        }
        tx.commit()?;

        info!("Ended session {}", session_id);
        Ok(session)
    }

    /// Store generated summary output. The summary text is only written when
    /// none exists yet; metadata is always merged. Returns the stored row and
    /// whether the summary was written.
    pub fn apply_generated_summary(
        &self,
        session_id: &str,
        summary: Option<&str>,
        metadata: Map<String, Value>,
    ) -> Result<(Session, bool)> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut session = load_session(&tx, session_id)?
            .ok_or_else(|| MemoryError::not_found("Session", session_id))?;

        let wrote_summary = match summary {
            Some(text) if session.summary.is_none() => {
                session.summary = Some(text.to_string());
                true
            }
            _ => false,
        };
        merge_object(&mut session.metadata, metadata);

        tx.execute(
            "UPDATE sessions SET summary = ?1, metadata = ?2 WHERE id = ?3",
            params![
                &session.summary,
                serde_json::to_string(&session.metadata)?,
                session_id,
            ],
        )?;
        tx.commit()?;
        Ok((session, wrote_summary))
    }

    /// Activity view: most recently active sessions first.
    pub fn recent_activity(&self, limit: usize, agent: Option<Agent>) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut sessions = Vec::new();
        match agent {
            Some(agent) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions WHERE agent = ?1 ORDER BY last_activity_at DESC LIMIT ?2",
                    SESSION_COLUMNS
                ))?;
                let mut rows = stmt.query(params![agent.as_str(), limit as i64])?;
                while let Some(row) = rows.next()? {
                    sessions.push(row_to_session(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sessions ORDER BY last_activity_at DESC LIMIT ?1",
                    SESSION_COLUMNS
                ))?;
                let mut rows = stmt.query([limit as i64])?;
                while let Some(row) = rows.next()? {
                    sessions.push(row_to_session(row)?);
                }
            }
        }
        Ok(sessions)
    }

    /// Summarized sessions that have no vector-index entry.
    pub fn sessions_missing_embedding(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions s
             WHERE s.summary IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.space = 'session' AND e.entity_id = s.id)
             ORDER BY s.started_at LIMIT ?1",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut sessions = Vec::new();
        while let Some(row) = rows.next()? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }
}

fn load_session(conn: &Connection, session_id: &str) -> Result<Option<Session>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS))?;
    let mut rows = stmt.query([session_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn parse_agent_column(raw: &str) -> Result<Agent> {
    raw.parse::<Agent>()
        .map_err(|e| MemoryError::Internal(anyhow::anyhow!("Corrupt agent column: {}", e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    Ok(match raw {
        Some(raw) => Some(parse_timestamp(&raw)?),
        None => None,
    })
}

fn row_to_session(row: &Row) -> Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        agent: parse_agent_column(&row.get::<_, String>(1)?)?,
        project_id: row.get(2)?,
        started_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        ended_at: parse_optional_timestamp(row.get(4)?)?,
        last_activity_at: parse_timestamp(&row.get::<_, String>(5)?)?,
        summary: row.get(6)?,
        embedding: None,
        context: parse_object(&row.get::<_, String>(7)?)?,
        metadata: parse_object(&row.get::<_, String>(8)?)?,
    })
}

fn row_to_event(row: &Row) -> Result<SessionEvent> {
    Ok(SessionEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        seq: row.get(2)?,
        event_type: row.get(3)?,
        timestamp: parse_timestamp(&row.get::<_, String>(4)?)?,
        data: serde_json::from_str(&row.get::<_, String>(5)?)?,
        metadata: parse_object(&row.get::<_, String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_db::MemoryDatabase;
    use serde_json::json;

    fn open(db: &MemoryDatabase, agent: Agent) -> Session {
        db.sessions
            .create_session(NewSession {
                agent,
                project_id: None,
                context: Map::new(),
                metadata: Map::new(),
            })
            .unwrap()
    }

    #[test]
    fn test_events_keep_append_order() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::Claude);
        for i in 0..5 {
            db.sessions
                .append_event(&session.id, "tool_use", json!({"step": i}), Map::new())
                .unwrap();
        }
        let events = db.sessions.get_events(&session.id).unwrap();
        let steps: Vec<i64> = events.iter().map(|e| e.data["step"].as_i64().unwrap()).collect();
        assert_eq!(steps, vec![0, 1, 2, 3, 4]);
        assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(events.last().unwrap().seq, 5);
    }

    #[test]
    fn test_append_after_end_is_rejected() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::Gpt);
        db.sessions.end_session(&session.id, None, None).unwrap();
        let err = db
            .sessions
            .append_event(&session.id, "late", json!({}), Map::new())
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidState(_)));
        assert_eq!(db.sessions.get_event_count(&session.id).unwrap(), 0);
    }

    #[test]
    fn test_append_to_unknown_session() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let err = db
            .sessions
            .append_event("missing", "x", json!({}), Map::new())
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));
    }

    #[test]
    fn test_end_twice_keeps_first_timestamp() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::User);
        let first = db.sessions.end_session(&session.id, Some("done".into()), None).unwrap();
        let err = db.sessions.end_session(&session.id, Some("again".into()), None).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidState(_)));

        let stored = db.sessions.get_session(&session.id).unwrap().unwrap();
        assert_eq!(stored.ended_at, first.ended_at);
        assert_eq!(stored.summary.as_deref(), Some("done"));
    }

    #[test]
    fn test_update_on_ended_session_allows_metadata_only() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::Claude);
        db.sessions.end_session(&session.id, None, None).unwrap();

        let meta = json!({"reviewed": true}).as_object().cloned().unwrap();
        let updated = db
            .sessions
            .update_session(&session.id, SessionPatch { metadata: Some(meta), ..Default::default() })
            .unwrap();
        assert_eq!(updated.metadata["reviewed"], json!(true));

        let err = db
            .sessions
            .update_session(&session.id, SessionPatch { summary: Some("x".into()), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidState(_)));
    }

    #[test]
    fn test_generated_summary_does_not_overwrite_existing() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::Claude);
        db.sessions.end_session(&session.id, Some("mine".into()), None).unwrap();
        let (stored, wrote) = db
            .sessions
            .apply_generated_summary(&session.id, Some("generated"), Map::new())
            .unwrap();
        assert!(!wrote);
        assert_eq!(stored.summary.as_deref(), Some("mine"));
    }

    #[test]
    fn test_recent_activity_filters_by_agent() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let a = open(&db, Agent::Claude);
        let _b = open(&db, Agent::Gemini);
        db.sessions.append_event(&a.id, "ping", json!({}), Map::new()).unwrap();

        let claude_only = db.sessions.recent_activity(10, Some(Agent::Claude)).unwrap();
        assert_eq!(claude_only.len(), 1);
        assert_eq!(claude_only[0].id, a.id);
        assert_eq!(db.sessions.recent_activity(10, None).unwrap().len(), 2);
    }

    #[test]
    fn test_recent_events_window() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = open(&db, Agent::Claude);
        for i in 0..6 {
            db.sessions.append_event(&session.id, "e", json!(i), Map::new()).unwrap();
        }
        let recent = db.sessions.get_recent_events(&session.id, 3).unwrap();
        let seqs: Vec<i64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }
}
