//! P2P error types.

use thiserror::Error;

/// P2P errors.
#[derive(Error, Debug)]
pub enum P2pError {
    /// Malformed wire message.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Subscription could not be established.
    #[error("Registration failed: {0}")]
    Registration(String),

    /// Unknown peer.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The transport side of a channel is gone.
    #[error("Transport channel closed")]
    ChannelClosed,
}

/// Result type for p2p operations.
pub type P2pResult<T> = Result<T, P2pError>;
