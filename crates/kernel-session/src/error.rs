//! Error types for kernel session operations.

/// Errors surfaced by spec discovery, launch, execution and teardown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Kernel specs unavailable: {0}")]
    SpecUnavailable(String),

    #[error("Failed to launch kernel: {0}")]
    LaunchFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session {id} already has an execution in flight")]
    SessionBusy { id: String },

    #[error("Session {id} is closed")]
    SessionClosed { id: String },

    #[error("Kernel shutdown failed: {0}")]
    TeardownFailure(String),

    #[error("Transport error: {0}")]
    TransportError(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
