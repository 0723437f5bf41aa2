//! Error types for the tracking engine.

use thiserror::Error;

/// Errors that can occur in the tracking engine.
#[derive(Debug, Error)]
pub enum LogError {
    /// The access policy rejected a log path.
    #[error("{0}")]
    AccessDenied(String),

    /// A glob in the access policy cannot be compiled.
    #[error("invalid glob '{glob}': {reason}")]
    InvalidGlob {
        /// The glob as configured.
        glob: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A timestamp format cannot be used for parsing.
    #[error("invalid timestamp format: {0}")]
    InvalidTimestampFormat(String),

    /// Tracking settings are out of range.
    #[error("invalid tracking settings: {0}")]
    InvalidSettings(String),

    /// The follow process is already running.
    #[error("origin adapter for '{0}' is already running")]
    AlreadyRunning(String),

    /// A layer was started twice.
    #[error("layer '{0}' was already started")]
    AlreadyStarted(String),

    /// The distribution channel of a layer was closed.
    #[error("log stream closed")]
    StreamClosed,

    /// A background task panicked or was cancelled unexpectedly.
    #[error("task failed: {0}")]
    Task(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, LogError>;
