//! Record types for the memory system
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use std::fmt;
use std::str::FromStr;
use crate::error::MemoryError;

/// Agents that share this memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Gemini,
    Gpt,
    User,
}

impl Agent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Agent::Claude => "claude",
            Agent::Gemini => "gemini",
            Agent::Gpt => "gpt",
            Agent::User => "user",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Agent {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" => Ok(Agent::Claude),
            "gemini" => Ok(Agent::Gemini),
            "gpt" => Ok(Agent::Gpt),
            "user" => Ok(Agent::User),
            "" => Err(MemoryError::invalid_argument("agent is required")),
            other => Err(MemoryError::invalid_argument(format!("unknown agent '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent: Agent,
    pub project_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub summary: Option<String>,
    /// Populated from the vector index on reads that need it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub context: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub metadata: Map<String, Value>,
}

/// Structured summary block kept under `metadata.ai_summary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiSummary {
    #[serde(default)]
    pub key_events: Vec<String>,
    #[serde(default)]
    pub decisions: Vec<String>,
    #[serde(default)]
    pub outcomes: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffStatus {
    Pending,
    Accepted,
    Completed,
    Rejected,
}

impl HandoffStatus {
    /// Every legal (current, next) pair. Anything absent here is rejected.
    pub const TRANSITIONS: [(HandoffStatus, HandoffStatus); 3] = [
        (HandoffStatus::Pending, HandoffStatus::Accepted),
        (HandoffStatus::Accepted, HandoffStatus::Completed),
        (HandoffStatus::Pending, HandoffStatus::Rejected),
    ];

    pub fn can_transition_to(self, next: HandoffStatus) -> bool {
        Self::TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandoffStatus::Completed | HandoffStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandoffStatus::Pending => "pending",
            HandoffStatus::Accepted => "accepted",
            HandoffStatus::Completed => "completed",
            HandoffStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for HandoffStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandoffStatus {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(HandoffStatus::Pending),
            "accepted" => Ok(HandoffStatus::Accepted),
            "completed" => Ok(HandoffStatus::Completed),
            "rejected" => Ok(HandoffStatus::Rejected),
            other => Err(MemoryError::Internal(anyhow::anyhow!("unknown handoff status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub session_id: String,
    pub from_agent: Agent,
    pub to_agent: Agent,
    pub context: Value,
    pub notes: Option<String>,
    pub status: HandoffStatus,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Success,
    Failure,
    Technical,
    Process,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Success => "success",
            PatternType::Failure => "failure",
            PatternType::Technical => "technical",
            PatternType::Process => "process",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "success" => Ok(PatternType::Success),
            "failure" => Ok(PatternType::Failure),
            "technical" => Ok(PatternType::Technical),
            "process" => Ok(PatternType::Process),
            other => Err(MemoryError::invalid_argument(format!("unknown pattern type '{}'", other))),
        }
    }
}

/// Pattern metadata. `confidence` is derived and only ever written by the
/// recomputation path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMetadata {
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub observation_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvested_from_session: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: String,
    pub pattern_type: PatternType,
    pub domain: String,
    pub description: String,
    pub action: String,
    pub outcome: Option<String>,
    pub context: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub metadata: PatternMetadata,
    pub created_by: Option<Agent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
    pub retired_reason: Option<String>,
}

impl Pattern {
    pub fn confidence(&self) -> Option<f64> {
        self.metadata.confidence
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }

    /// Text the pattern embedding is derived from.
    pub fn embedding_text(&self) -> String {
        format!(
            "{} {} {}",
            self.description,
            self.action,
            self.outcome.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternObservation {
    pub id: String,
    pub pattern_id: String,
    pub session_id: Option<String>,
    pub observed_at: DateTime<Utc>,
    pub success_rating: u8,
    pub feedback: Option<String>,
    pub metadata: Map<String, Value>,
}

/// A pattern proposed by the summarizer, waiting for an agent to confirm it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePattern {
    pub pattern_type: PatternType,
    pub domain: String,
    pub description: String,
    pub action: String,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub assigned_agent: Option<Agent>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

/// The four embedding spaces kept in the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingSpace {
    Session,
    Task,
    Project,
    Pattern,
}

impl EmbeddingSpace {
    pub const ALL: [EmbeddingSpace; 4] = [
        EmbeddingSpace::Session,
        EmbeddingSpace::Task,
        EmbeddingSpace::Project,
        EmbeddingSpace::Pattern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingSpace::Session => "session",
            EmbeddingSpace::Task => "task",
            EmbeddingSpace::Project => "project",
            EmbeddingSpace::Pattern => "pattern",
        }
    }
}

impl fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A nearest-neighbor hit from the vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub open_sessions: i64,
    pub total_events: i64,
    pub total_handoffs: i64,
    pub pending_handoffs: i64,
    pub total_patterns: i64,
    pub total_observations: i64,
    pub total_projects: i64,
    pub total_tasks: i64,
    pub total_embeddings: i64,
    pub database_size_bytes: i64,
}

/// Timestamps are stored as fixed-width RFC 3339 text so that lexical
/// order in SQL matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp '{}': {}", raw, e))
}

/// Current time truncated to the stored precision.
pub fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond((now.nanosecond() / 1_000) * 1_000).unwrap_or(now)
}

/// Parses a JSON object column; anything other than an object becomes empty.
pub fn parse_object(raw: &str) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Map::new()),
    }
}

/// Shallow merge: keys in `patch` overwrite, JSON `null` removes the key.
pub fn merge_object(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_agent_parsing() {
        assert_eq!("claude".parse::<Agent>().unwrap(), Agent::Claude);
        assert_eq!(" Gemini ".parse::<Agent>().unwrap(), Agent::Gemini);
        assert!(matches!("".parse::<Agent>(), Err(MemoryError::InvalidArgument(_))));
        assert!(matches!("copilot".parse::<Agent>(), Err(MemoryError::InvalidArgument(_))));
    }

    #[test]
    fn test_handoff_transition_table() {
        use HandoffStatus::*;
        assert!(Pending.can_transition_to(Accepted));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Accepted.can_transition_to(Completed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Accepted.can_transition_to(Rejected));
        assert!(!Accepted.can_transition_to(Accepted));
        for next in [Pending, Accepted, Completed, Rejected] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Rejected.can_transition_to(next));
        }
    }

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let a = parse_timestamp("2026-01-01T09:00:00.000001Z").unwrap();
        let b = parse_timestamp("2026-01-01T10:00:00Z").unwrap();
        assert!(format_timestamp(&a) < format_timestamp(&b));
        assert_eq!(parse_timestamp(&format_timestamp(&a)).unwrap(), a);
    }

    #[test]
    fn test_merge_object_removes_nulls() {
        let mut target = parse_object(r#"{"a": 1, "b": 2}"#).unwrap();
        let patch = json!({"b": null, "c": 3}).as_object().cloned().unwrap();
        merge_object(&mut target, patch);
        assert_eq!(Value::Object(target), json!({"a": 1, "c": 3}));
    }

    #[test]
    fn test_pattern_metadata_keeps_extra_keys() {
        let raw = json!({"confidence": 0.7, "observation_count": 3, "source": "review"});
        let meta: PatternMetadata = serde_json::from_value(raw).unwrap();
        assert_eq!(meta.confidence, Some(0.7));
        assert_eq!(meta.extra.get("source"), Some(&json!("review")));

        let empty: PatternMetadata = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.confidence, None);
    }
}
