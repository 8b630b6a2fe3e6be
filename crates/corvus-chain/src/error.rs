//! Chain error types.

use thiserror::Error;

/// Chain errors.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Malformed block bytes.
    #[error("Malformed block: {0}")]
    Malformed(String),

    /// Block or hash not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
