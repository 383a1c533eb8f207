//! Error types for treecast

use thiserror::Error;

/// Core treecast errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreecastError {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Config(String),

    // Node errors
    #[error("Child index {index} out of range [0, {arity})")]
    IndexOutOfRange { index: usize, arity: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Already started")]
    AlreadyStarted,

    #[error("Queue already taken: {0}")]
    QueueTaken(&'static str),

    // Transport errors
    #[error("Failed to listen on {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("Transport already listening or connected")]
    AlreadyActive,

    #[error("Transport closed")]
    TransportClosed,

    #[error("No active connection")]
    NotConnected,
}

impl TreecastError {
    /// True for the cooperative-shutdown signal, which callers treat as a
    /// normal exit rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TreecastError::Cancelled)
    }
}

/// Result type for treecast operations
pub type TreecastResult<T> = Result<T, TreecastError>;
