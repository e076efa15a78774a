use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every corral component.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CorralError {
    /// Connectivity or auth failure; retried with backoff where it occurs.
    #[error("transport: {0}")]
    Transport(String),
    /// Watch cursor is older than what the remote side retains; relist.
    #[error("resource expired: {0}")]
    ResourceExpired(String),
    /// Optimistic-concurrency failure on write.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Write carried a fencing token older than one already issued.
    #[error("fenced: token {presented} superseded by {current}")]
    Fenced { presented: u64, current: u64 },
    #[error("not leader")]
    NotLeader,
    /// Bad credentials or flags; fatal at startup.
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("invalid object: {0}")]
    InvalidObject(String),
}

impl CorralError {
    /// Only transport failures are worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, CorralError::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CorralError::NotFound(_))
    }
}

pub type CorralResult<T> = Result<T, CorralError>;
