//! Error taxonomy shared by every memory operation.
//!
//! Caller mistakes and business rejections (`InvalidArgument`, `NotFound`,
//! `InvalidState`) are surfaced verbatim. Collaborator failures (embedding,
//! summarization) never reach this type; they degrade the result instead.

use thiserror::Error;

/// Stable, wire-friendly error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidState,
    Unavailable,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            MemoryError::NotFound { .. } => ErrorKind::NotFound,
            MemoryError::InvalidState(_) => ErrorKind::InvalidState,
            MemoryError::Unavailable(_) => ErrorKind::Unavailable,
            MemoryError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        MemoryError::InvalidArgument(reason.into())
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        MemoryError::InvalidState(reason.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        MemoryError::NotFound { entity, id: id.into() }
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(e: rusqlite::Error) -> Self {
        MemoryError::Internal(anyhow::Error::new(e).context("SQLite error"))
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(e: r2d2::Error) -> Self {
        MemoryError::Internal(anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(e: serde_json::Error) -> Self {
        MemoryError::Internal(anyhow::Error::new(e).context("JSON error"))
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(e: bincode::Error) -> Self {
        MemoryError::Internal(anyhow::anyhow!("Bincode error: {}", e))
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(e: tokio::task::JoinError) -> Self {
        MemoryError::Internal(anyhow::anyhow!("Blocking task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_codes_are_stable() {
        assert_eq!(MemoryError::invalid_argument("x").kind().as_str(), "invalid_argument");
        assert_eq!(MemoryError::not_found("Session", "abc").kind().as_str(), "not_found");
        assert_eq!(MemoryError::invalid_state("x").kind().as_str(), "invalid_state");
        assert_eq!(MemoryError::Unavailable("x".into()).kind().as_str(), "unavailable");
        assert_eq!(MemoryError::from(anyhow::anyhow!("boom")).kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_not_found_message_names_entity() {
        let err = MemoryError::not_found("Handoff", "h-1");
        assert_eq!(err.to_string(), "Handoff h-1 not found");
    }

    #[test]
    fn test_sqlite_error_maps_to_internal() {
        let err: MemoryError = rusqlite::Error::QueryReturnedNoRows.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
