//! Error types for the worker runtime.

use std::time::Duration;

/// Errors that can occur while driving a worker or touching shared state.
#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
    /// The shared store (or a reference table) could not be locked in time.
    /// The caller may retry; the guarded data is not corrupt.
    #[error("Lock not acquired within {0:?}")]
    LockTimeout(Duration),

    /// The target worker has been cancelled or has terminated.
    #[error("Worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The interpreter context failed to start or restart.
    #[error("Initialization failed: {0}")]
    InitializationFailure(String),

    #[error("Reference not found: {label} in module {module}")]
    ReferenceNotFound { label: String, module: String },

    #[error("Message port closed")]
    PortClosed,

    #[error("Worker thread panicked")]
    ThreadPanic,

    #[error("Failed to spawn thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl ThreadError {
    pub(crate) fn reference_not_found(label: &str, module: &str) -> Self {
        Self::ReferenceNotFound {
            label: label.to_string(),
            module: module.to_string(),
        }
    }

    /// Whether the caller can reasonably retry or treat the failure as an
    /// absent value.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ThreadError::LockTimeout(_) | ThreadError::ReferenceNotFound { .. }
        )
    }
}

impl From<mlua::Error> for ThreadError {
    fn from(err: mlua::Error) -> Self {
        ThreadError::Script(err.to_string())
    }
}

pub type ThreadResult<T> = Result<T, ThreadError>;
