use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used by every caller-facing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    LockContention,
    Upstream,
}

/// Classified failure of a coordinator operation.
///
/// Leaf operations report raw `anyhow` errors; each coordinator step turns
/// them into one of these before deciding whether to abort or continue.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum OpError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("an operation is already in progress for project {0}")]
    LockContention(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl OpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpError::Validation(_) => ErrorKind::Validation,
            OpError::NotFound(_) => ErrorKind::NotFound,
            OpError::LockContention(_) => ErrorKind::LockContention,
            OpError::Upstream(_) => ErrorKind::Upstream,
        }
    }

    /// Wraps a leaf failure, keeping the whole `anyhow` context chain.
    pub fn upstream(step: &str, err: &anyhow::Error) -> Self {
        OpError::Upstream(format!("{step}: {err:#}"))
    }

    pub fn message(&self) -> String {
        match self {
            OpError::Validation(m)
            | OpError::NotFound(m)
            | OpError::LockContention(m)
            | OpError::Upstream(m) => m.clone(),
        }
    }
}
