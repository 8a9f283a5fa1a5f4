//! Pattern and observation storage
use crate::error::{MemoryError, Result};
use crate::memory_db::embedding_store::EmbeddingStore;
use crate::memory_db::schema::*;
use crate::memory_db::session_store::parse_agent_column;
use crate::memory_engine::confidence::{compute_confidence, ConfidenceParams};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use rusqlite::types::Value as SqlValue;
use serde_json::{Map, Value};
use uuid::Uuid;
use tracing::{debug, info};
use std::sync::Arc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

const PATTERN_COLUMNS: &str = "id, pattern_type, domain, description, action, outcome, context, metadata, \
                               created_by, created_at, updated_at, retired_at, retired_reason";

const OBSERVATION_COLUMNS: &str = "id, pattern_id, session_id, observed_at, success_rating, feedback, metadata";

pub struct NewPattern {
    pub pattern_type: PatternType,
    pub domain: String,
    pub description: String,
    pub action: String,
    pub outcome: Option<String>,
    pub context: Map<String, Value>,
    pub metadata: PatternMetadata,
    pub created_by: Option<Agent>,
}

pub struct NewObservation {
    pub session_id: Option<String>,
    pub success_rating: u8,
    pub feedback: Option<String>,
    pub metadata: Map<String, Value>,
}

/// Exact-match filters applied in SQL before any ranking.
#[derive(Debug, Clone, Default)]
pub struct PatternFilter {
    pub domain: Option<String>,
    pub pattern_type: Option<PatternType>,
    pub include_retired: bool,
    pub limit: Option<usize>,
}

pub struct PatternRecordStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl PatternRecordStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    pub fn insert_pattern(&self, new: NewPattern) -> Result<Pattern> {
        let now = now_micros();
        let mut metadata = new.metadata;
        metadata.confidence = None;
        metadata.observation_count = 0;

        let pattern = Pattern {
            id: Uuid::new_v4().to_string(),
            pattern_type: new.pattern_type,
            domain: new.domain,
            description: new.description,
            action: new.action,
            outcome: new.outcome,
            context: new.context,
            embedding: None,
            metadata,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
            retired_at: None,
            retired_reason: None,
        };

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO patterns (id, pattern_type, domain, description, action, outcome, context, metadata,
                                   created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &pattern.id,
                pattern.pattern_type.as_str(),
                &pattern.domain,
                &pattern.description,
                &pattern.action,
                &pattern.outcome,
                serde_json::to_string(&pattern.context)?,
                serde_json::to_string(&pattern.metadata)?,
                pattern.created_by.map(|a| a.as_str()),
                format_timestamp(&pattern.created_at),
                format_timestamp(&pattern.updated_at),
            ],
        )?;

        info!("Harvested {} pattern {} in domain '{}'", pattern.pattern_type, pattern.id, pattern.domain);
        Ok(pattern)
    }

    pub fn get_pattern(&self, pattern_id: &str) -> Result<Option<Pattern>> {
        let conn = self.get_conn()?;
        load_pattern(&conn, pattern_id)
    }

    pub fn get_patterns(&self, ids: &[String]) -> Result<Vec<Pattern>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patterns WHERE id IN ({})",
            PATTERN_COLUMNS, placeholders
        ))?;
        let mut rows = stmt.query(rusqlite::params_from_iter(ids))?;
        let mut patterns = Vec::new();
        while let Some(row) = rows.next()? {
            patterns.push(row_to_pattern(row)?);
        }
        Ok(patterns)
    }

    /// Filtered patterns ordered by confidence (nulls last), then newest first.
    pub fn query_patterns(&self, filter: &PatternFilter) -> Result<Vec<Pattern>> {
        let mut sql = format!("SELECT {} FROM patterns WHERE 1 = 1", PATTERN_COLUMNS);
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(domain) = &filter.domain {
            sql.push_str(" AND domain = ?");
            args.push(SqlValue::Text(domain.clone()));
        }
        if let Some(pattern_type) = filter.pattern_type {
            sql.push_str(" AND pattern_type = ?");
            args.push(SqlValue::Text(pattern_type.as_str().to_string()));
        }
        if !filter.include_retired {
            sql.push_str(" AND retired_at IS NULL");
        }
        sql.push_str(
            " ORDER BY json_extract(metadata, '$.confidence') IS NULL,
                       json_extract(metadata, '$.confidence') DESC,
                       created_at DESC, id",
        );
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(args))?;
        let mut patterns = Vec::new();
        while let Some(row) = rows.next()? {
            patterns.push(row_to_pattern(row)?);
        }
        Ok(patterns)
    }

    /// Insert an observation and recompute the pattern's confidence from the
    /// full observation set, all inside one IMMEDIATE transaction.
    pub fn record_observation(
        &self,
        pattern_id: &str,
        new: NewObservation,
        confidence: &ConfidenceParams,
    ) -> Result<(PatternObservation, Pattern)> {
        if !(1..=5).contains(&new.success_rating) {
            return Err(MemoryError::invalid_argument(format!(
                "success_rating must be between 1 and 5, got {}",
                new.success_rating
            )));
        }

        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut pattern = load_pattern(&tx, pattern_id)?
            .ok_or_else(|| MemoryError::not_found("Pattern", pattern_id))?;

        let last_observed: Option<String> = tx.query_row(
            "SELECT MAX(observed_at) FROM pattern_observations WHERE pattern_id = ?1",
            [pattern_id],
            |row| row.get(0),
        )?;
        let mut observed_at = now_micros();
        if let Some(last) = last_observed.as_deref() {
            observed_at = observed_at.max(parse_timestamp(last)?);
        }

        let observation = PatternObservation {
            id: Uuid::new_v4().to_string(),
            pattern_id: pattern_id.to_string(),
            session_id: new.session_id,
            observed_at,
            success_rating: new.success_rating,
            feedback: new.feedback,
            metadata: new.metadata,
        };
        tx.execute(
            "INSERT INTO pattern_observations (id, pattern_id, session_id, observed_at, success_rating, feedback, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &observation.id,
                &observation.pattern_id,
                &observation.session_id,
                format_timestamp(&observation.observed_at),
                observation.success_rating,
                &observation.feedback,
                serde_json::to_string(&observation.metadata)?,
            ],
        )?;

        let ratings = load_ratings(&tx, pattern_id)?;
        pattern.metadata.confidence = compute_confidence(&ratings, confidence);
        pattern.metadata.observation_count = ratings.len() as u32;
        pattern.updated_at = observed_at.max(pattern.updated_at);

        tx.execute(
            "UPDATE patterns SET metadata = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&pattern.metadata)?,
                format_timestamp(&pattern.updated_at),
                pattern_id,
            ],
        )?;
        tx.commit()?;

        debug!(
            "Observation {} on pattern {} (rating {}), confidence now {:?}",
            observation.id, pattern_id, observation.success_rating, pattern.metadata.confidence
        );
        Ok((observation, pattern))
    }

    /// Observations oldest first.
    pub fn get_observations(&self, pattern_id: &str) -> Result<Vec<PatternObservation>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM pattern_observations WHERE pattern_id = ?1 ORDER BY observed_at, rowid",
            OBSERVATION_COLUMNS
        ))?;
        let mut rows = stmt.query([pattern_id])?;
        let mut observations = Vec::new();
        while let Some(row) = rows.next()? {
            observations.push(row_to_observation(row)?);
        }
        Ok(observations)
    }

    pub fn retire_pattern(&self, pattern_id: &str, reason: &str) -> Result<Pattern> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut pattern = load_pattern(&tx, pattern_id)?
            .ok_or_else(|| MemoryError::not_found("Pattern", pattern_id))?;
        if pattern.is_retired() {
            return Err(MemoryError::invalid_state(format!("pattern {} is already retired", pattern_id)));
        }

        let now = now_micros().max(pattern.updated_at);
        pattern.retired_at = Some(now);
        pattern.retired_reason = Some(reason.to_string());
        pattern.updated_at = now;

        tx.execute(
            "UPDATE patterns SET retired_at = ?1, retired_reason = ?2, updated_at = ?1
             WHERE id = ?3 AND retired_at IS NULL",
            params![format_timestamp(&now), reason, pattern_id],
        )?;
        tx.commit()?;

        info!("Retired pattern {}: {}", pattern_id, reason);
        Ok(pattern)
    }

    /// Hard delete. Observations go through the foreign-key cascade and the
    /// vector-index row is removed in the same transaction; the cached copy in
    /// `index` is dropped once that commits.
    pub fn delete_pattern(&self, pattern_id: &str, index: &EmbeddingStore) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM embeddings WHERE space = ?1 AND entity_id = ?2",
            params![EmbeddingSpace::Pattern.as_str(), pattern_id],
        )?;
        let deleted = tx.execute("DELETE FROM patterns WHERE id = ?1", [pattern_id])?;
        if deleted == 0 {
            return Err(MemoryError::not_found("Pattern", pattern_id));
        }
        tx.commit()?;
        index.evict(EmbeddingSpace::Pattern, pattern_id);

        info!("Deleted pattern {}", pattern_id);
        Ok(())
    }

    /// Active patterns with enough observations whose confidence is below
    /// `threshold`.
    pub fn low_confidence_ids(&self, min_observations: u32, threshold: f64) -> Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM patterns
             WHERE retired_at IS NULL
               AND COALESCE(json_extract(metadata, '$.observation_count'), 0) >= ?1
               AND json_extract(metadata, '$.confidence') IS NOT NULL
               AND json_extract(metadata, '$.confidence') < ?2
             ORDER BY created_at",
        )?;
        let mut rows = stmt.query(params![min_observations, threshold])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        Ok(ids)
    }

    pub fn patterns_missing_embedding(&self, limit: usize) -> Result<Vec<Pattern>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM patterns p
             WHERE NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.space = 'pattern' AND e.entity_id = p.id)
             ORDER BY p.created_at LIMIT ?1",
            PATTERN_COLUMNS
        ))?;
        let mut rows = stmt.query([limit as i64])?;
        let mut patterns = Vec::new();
        while let Some(row) = rows.next()? {
            patterns.push(row_to_pattern(row)?);
        }
        Ok(patterns)
    }
}

fn load_pattern(conn: &Connection, pattern_id: &str) -> Result<Option<Pattern>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM patterns WHERE id = ?1", PATTERN_COLUMNS))?;
    let mut rows = stmt.query([pattern_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_pattern(row)?)),
        None => Ok(None),
    }
}

fn load_ratings(conn: &Connection, pattern_id: &str) -> Result<Vec<u8>> {
    let mut stmt = conn.prepare(
        "SELECT success_rating FROM pattern_observations WHERE pattern_id = ?1 ORDER BY observed_at, rowid",
    )?;
    let mut rows = stmt.query([pattern_id])?;
    let mut ratings = Vec::new();
    while let Some(row) = rows.next()? {
        ratings.push(row.get(0)?);
    }
    Ok(ratings)
}

fn row_to_pattern(row: &Row) -> Result<Pattern> {
    let created_by: Option<String> = row.get(8)?;
    let retired_at: Option<String> = row.get(11)?;
    Ok(Pattern {
        id: row.get(0)?,
        pattern_type: row.get::<_, String>(1)?.parse()?,
        domain: row.get(2)?,
        description: row.get(3)?,
        action: row.get(4)?,
        outcome: row.get(5)?,
        context: parse_object(&row.get::<_, String>(6)?)?,
        embedding: None,
        metadata: serde_json::from_str(&row.get::<_, String>(7)?)?,
        created_by: created_by.as_deref().map(parse_agent_column).transpose()?,
        created_at: parse_timestamp(&row.get::<_, String>(9)?)?,
        updated_at: parse_timestamp(&row.get::<_, String>(10)?)?,
        retired_at: retired_at.as_deref().map(parse_timestamp).transpose()?,
        retired_reason: row.get(12)?,
    })
}

fn row_to_observation(row: &Row) -> Result<PatternObservation> {
    Ok(PatternObservation {
        id: row.get(0)?,
        pattern_id: row.get(1)?,
        session_id: row.get(2)?,
        observed_at: parse_timestamp(&row.get::<_, String>(3)?)?,
        success_rating: row.get(4)?,
        feedback: row.get(5)?,
        metadata: parse_object(&row.get::<_, String>(6)?)?,
    })
}
