//! Shared memory for cooperating agents: session logs, agent-to-agent
//! handoffs, harvested patterns with a confidence score, and one semantic
//! search across all of it.

pub mod config;
pub mod error;
pub mod memory_db;
pub mod memory_engine;
pub mod metrics;
pub mod shared_state;
pub mod telemetry;
pub mod utils;
pub mod worker_threads;

#[cfg(test)]
pub(crate) mod test_support;

// Public API exports
pub use config::Config;
pub use error::{ErrorKind, MemoryError, Result};
pub use memory_db::{
    Agent, Handoff, HandoffStatus, MemoryDatabase, Pattern, PatternObservation, PatternType, Session,
    SessionEvent,
};
pub use memory_engine::{
    EntityKind, HandoffCoordinator, HarvestRequest, PatternQuery, PatternStore, SearchResponse, SessionManager,
    SessionUpdate, UnifiedSearchEngine,
};
pub use shared_state::SharedState;
