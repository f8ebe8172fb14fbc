//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid commit graph: {0}")]
    InvalidCommitGraph(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
