//! Handoff storage with compare-and-swap status transitions
use crate::error::{MemoryError, Result};
use crate::memory_db::schema::*;
use crate::memory_db::session_store::parse_agent_column;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use serde_json::{Map, Value};
use uuid::Uuid;
use tracing::{debug, info};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const HANDOFF_COLUMNS: &str = "id, session_id, from_agent, to_agent, context, notes, status, metadata, \
                               created_at, accepted_at, completed_at";

pub struct NewHandoff<'a> {
    pub session_id: &'a str,
    pub from_agent: Agent,
    pub to_agent: Agent,
    pub context: Value,
    pub notes: Option<String>,
    pub metadata: Map<String, Value>,
}

pub struct HandoffStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl HandoffStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn create_handoff(&self, new: NewHandoff<'_>) -> Result<Handoff> {
        let handoff = Handoff {
            id: Uuid::new_v4().to_string(),
            session_id: new.session_id.to_string(),
            from_agent: new.from_agent,
            to_agent: new.to_agent,
            context: new.context,
            notes: new.notes,
            status: HandoffStatus::Pending,
            metadata: new.metadata,
            created_at: now_micros(),
            accepted_at: None,
            completed_at: None,
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO handoffs (id, session_id, from_agent, to_agent, context, notes, status, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                &handoff.id,
                &handoff.session_id,
                handoff.from_agent.as_str(),
                handoff.to_agent.as_str(),
                serde_json::to_string(&handoff.context)?,
                &handoff.notes,
                handoff.status.as_str(),
                serde_json::to_string(&handoff.metadata)?,
                format_timestamp(&handoff.created_at),
            ],
        )?;

        info!(
            "Created handoff {} from {} to {} (session {})",
            handoff.id, handoff.from_agent, handoff.to_agent, handoff.session_id
        );
        Ok(handoff)
    }

    pub fn get_handoff(&self, handoff_id: &str) -> Result<Option<Handoff>> {
        let conn = self.get_conn()?;
        load_handoff(&conn, handoff_id)
    }

    /// Pending handoffs addressed to `agent`, oldest first.
    pub fn get_pending(&self, agent: Agent) -> Result<Vec<Handoff>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM handoffs WHERE to_agent = ?1 AND status = 'pending' ORDER BY created_at, rowid",
            HANDOFF_COLUMNS
        ))?;
        let mut rows = stmt.query([agent.as_str()])?;
        let mut handoffs = Vec::new();
        while let Some(row) = rows.next()? {
            handoffs.push(row_to_handoff(row)?);
        }
        Ok(handoffs)
    }

    pub fn list_for_session(&self, session_id: &str) -> Result<Vec<Handoff>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM handoffs WHERE session_id = ?1 ORDER BY created_at, rowid",
            HANDOFF_COLUMNS
        ))?;
        let mut rows = stmt.query([session_id])?;
        let mut handoffs = Vec::new();
        while let Some(row) = rows.next()? {
            handoffs.push(row_to_handoff(row)?);
        }
        Ok(handoffs)
    }

    /// Move a handoff from its current status to `next`.
    ///
    /// The read, the transition check and the conditional write share an
    /// IMMEDIATE transaction, and the UPDATE is guarded on the status that
    /// was read. Of two racing callers exactly one succeeds; the other sees
    /// the new status and gets `InvalidState`.
    pub fn transition(
        &self,
        handoff_id: &str,
        next: HandoffStatus,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Handoff> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut handoff = load_handoff(&tx, handoff_id)?
            .ok_or_else(|| MemoryError::not_found("Handoff", handoff_id))?;
        let current = handoff.status;
        if !current.can_transition_to(next) {
            return Err(MemoryError::invalid_state(format!(
                "handoff {} cannot move from {} to {}",
                handoff_id, current, next
            )));
        }

        let now = now_micros();
        match next {
            HandoffStatus::Accepted => {
                handoff.accepted_at = Some(now.max(handoff.created_at));
            }
            HandoffStatus::Completed => {
                let floor = handoff.accepted_at.unwrap_or(handoff.created_at);
                handoff.completed_at = Some(strictly_after(now, floor));
            }
            HandoffStatus::Rejected | HandoffStatus::Pending => {}
        }
        handoff.status = next;
        if let Some(metadata) = metadata {
            merge_object(&mut handoff.metadata, metadata);
        }

        let updated = tx.execute(
            "UPDATE handoffs SET status = ?1, accepted_at = ?2, completed_at = ?3, metadata = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                next.as_str(),
                handoff.accepted_at.as_ref().map(format_timestamp),
                handoff.completed_at.as_ref().map(format_timestamp),
                serde_json::to_string(&handoff.metadata)?,
                handoff_id,
                current.as_str(),
            ],
        )?;
        if updated != 1 {
            return Err(MemoryError::invalid_state(format!(
                "handoff {} changed status concurrently",
                handoff_id
            )));
        }
        tx.commit()?;

        debug!("Handoff {} moved {} -> {}", handoff_id, current, next);
        Ok(handoff)
    }
}

fn strictly_after(now: DateTime<Utc>, floor: DateTime<Utc>) -> DateTime<Utc> {
    if now > floor {
        now
    } else {
        floor + Duration::microseconds(1)
    }
}

fn load_handoff(conn: &Connection, handoff_id: &str) -> Result<Option<Handoff>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM handoffs WHERE id = ?1", HANDOFF_COLUMNS))?;
    let mut rows = stmt.query([handoff_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_handoff(row)?)),
        None => Ok(None),
    }
}

fn row_to_handoff(row: &Row) -> Result<Handoff> {
    let accepted_at: Option<String> = row.get(9)?;
    let completed_at: Option<String> = row.get(10)?;
    Ok(Handoff {
        id: row.get(0)?,
        session_id: row.get(1)?,
        from_agent: parse_agent_column(&row.get::<_, String>(2)?)?,
        to_agent: parse_agent_column(&row.get::<_, String>(3)?)?,
        context: serde_json::from_str(&row.get::<_, String>(4)?)?,
        notes: row.get(5)?,
        status: row.get::<_, String>(6)?.parse()?,
        metadata: parse_object(&row.get::<_, String>(7)?)?,
        created_at: parse_timestamp(&row.get::<_, String>(8)?)?,
        accepted_at: accepted_at.as_deref().map(parse_timestamp).transpose()?,
        completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
    })
}
