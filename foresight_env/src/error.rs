//! Error types for the Foresight environment boundary.

use thiserror::Error;

/// Errors produced by a [`FetchExecutor`](crate::FetchExecutor).
///
/// `Cancelled` is the expected outcome of preemption and is never reported
/// as a failure by the scheduler. Every other variant is a real failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The cancellation token fired before the fetch finished
    #[error("Fetch cancelled")]
    Cancelled,

    /// The remote answered with a non-success status
    #[error("HTTP status {status} for {key}")]
    Status { key: String, status: u16 },

    /// Connection, TLS or body read failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The executor gave up waiting
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    /// A custom executor refused the key
    #[error("Fetch rejected: {0}")]
    Rejected(String),
}

impl FetchError {
    /// Creates a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Creates a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// True when the error only reflects preemption.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
