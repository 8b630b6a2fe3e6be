//! Sync error types.

use thiserror::Error;

/// Sync errors.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] corvus_p2p::P2pError),

    /// Chain error.
    #[error("Chain error: {0}")]
    Chain(#[from] corvus_chain::ChainError),

    /// Startup failed; the synchronizer cannot run.
    #[error("Startup failed: {0}")]
    Startup(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
