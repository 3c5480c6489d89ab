//! Error types for tally-raft.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the Raft subsystem.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Error during Raft initialization.
    #[error("Raft initialization failed: {0}")]
    Initialization(String),

    /// Error during storage operations.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error during network operations.
    #[error("Network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during write operations.
    #[error("Write error: {0}")]
    Write(String),

    /// Error during membership changes.
    #[error("Membership change error: {0}")]
    MembershipChange(String),

    /// No leader available for write operations.
    #[error("No leader available")]
    NoLeader,

    /// This node is not the leader.
    #[error("not leader (current leader: {leader_name:?} at {leader_http_addr:?})")]
    NotLeader {
        /// Name of the current leader, if known.
        leader_name: Option<String>,
        /// Admin address of the current leader, if known.
        leader_http_addr: Option<String>,
    },

    /// Error during snapshot operations.
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// No manual backup exists at the configured path.
    #[error("no backup found at {}", .0.display())]
    BackupNotFound(PathBuf),

    /// Manual backup could not be read or written.
    #[error("Backup error: {0}")]
    Backup(String),

    /// Timeout waiting for operation.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RaftError {
    /// Whether the error means this node cannot serve the write as leader.
    pub fn is_not_leader(&self) -> bool {
        matches!(self, RaftError::NotLeader { .. } | RaftError::NoLeader)
    }
}

impl From<sled::Error> for RaftError {
    fn from(err: sled::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}
