//! Summarizer seam used when a session closes without a summary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory_db::{AiSummary, CandidatePattern, SessionEvent};

/// What a summarizer extracted from a session's event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutcome {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub ai_summary: Option<AiSummary>,
    #[serde(default)]
    pub candidate_patterns: Vec<CandidatePattern>,
}

impl SummaryOutcome {
    /// The summary text, if there is any.
    pub fn summary_text(&self) -> Option<&str> {
        let trimmed = self.summary.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Best effort. `Ok(None)` means there was nothing worth summarizing.
    async fn summarize(&self, events: &[SessionEvent]) -> anyhow::Result<Option<SummaryOutcome>>;
}
