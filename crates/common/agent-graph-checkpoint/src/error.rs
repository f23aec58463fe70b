//! Error types for the checkpoint store.

use std::time::Duration;

use thiserror::Error;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    Unavailable,
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("{entity} not found{}", .id.as_ref().map(|id| format!(": {}", id)).unwrap_or_default())]
    NotFound {
        entity: &'static str,
        id: Option<String>,
    },

    #[error("Conflict during {operation} on thread {thread_id}: {reason}")]
    Conflict {
        operation: &'static str,
        thread_id: String,
        reason: String,
    },

    #[error("Thread {thread_id} was deleted while a write was in flight")]
    ThreadDeleted { thread_id: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Data encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Store unavailable during {operation} on thread {thread_id}: {reason}")]
    Unavailable {
        operation: &'static str,
        thread_id: String,
        reason: String,
    },

    #[error("{operation} on thread {thread_id} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        thread_id: String,
        after: Duration,
    },
}

impl CheckpointError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity, id: None }
    }

    pub fn not_found_with_id(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: Some(id.into()),
        }
    }

    pub fn conflict(
        operation: &'static str,
        thread_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            operation,
            thread_id: thread_id.into(),
            reason: reason.into(),
        }
    }

    pub fn thread_deleted(thread_id: impl Into<String>) -> Self {
        Self::ThreadDeleted {
            thread_id: thread_id.into(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn unavailable(
        operation: &'static str,
        thread_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unavailable {
            operation,
            thread_id: thread_id.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: &'static str, thread_id: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation,
            thread_id: thread_id.into(),
            after,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } | Self::ThreadDeleted { .. } => ErrorKind::Conflict,
            Self::InvalidState(_) | Self::Encoding(_) => ErrorKind::InvalidState,
            Self::Unavailable { .. } | Self::Timeout { .. } => ErrorKind::Unavailable,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_invalid_state(&self) -> bool {
        self.kind() == ErrorKind::InvalidState
    }

    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Unavailable
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Only head races are worth replaying; a deleted thread stays deleted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
