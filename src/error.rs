//! Error types for the attend core.

/// Top-level error type for arbitration, pending and queue services.
///
/// Expected conditions (a task already active, an unknown switch request,
/// a task that is not pending) are reported through `bool`/`Option` return
/// values instead; this type only carries lower-layer failures.
#[derive(Debug, thiserror::Error)]
pub enum AttendError {
    /// Durable key-value storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Task or geofence store rejected or failed an operation.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Encoding or decoding of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Switch arbitration error (prompt presentation, malformed decision payload).
    #[error("arbitration error: {0}")]
    Arbitration(String),

    /// Invalid task data (priority out of range, missing id).
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Host protocol error (malformed command payload, broken pipe).
    #[error("host protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AttendError>;
