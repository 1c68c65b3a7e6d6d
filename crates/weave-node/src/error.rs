//! Node-specific error types

use thiserror::Error;

/// Errors specific to running a mesh
#[derive(Error, Debug)]
pub enum NodeError {
    /// Bad command-line arguments
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// Core sync error (config loading, invalid operations)
    #[error("Sync error: {0}")]
    Sync(#[from] libweave_core::SyncError),

    /// Peer protocol error
    #[error("Peer error: {0}")]
    Peer(#[from] libweave_peer::PeerError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A spawned task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for NodeError {
    fn from(e: tokio::task::JoinError) -> Self {
        NodeError::Task(e.to_string())
    }
}
