//! Error types for session management.

use llama_engine::EngineState;
use uuid::Uuid;

/// Result type for session manager operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors returned synchronously by [`crate::SessionManager`] operations.
///
/// Faults during streaming are not errors of this type: they reach the sink through
/// `on_error`, and cancellation reaches it through `on_cancelled`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to load model: {0}")]
    Load(String),

    #[error("model is not ready (state: {0})")]
    NotReady(EngineState),

    #[error("session {0} is still active")]
    Busy(Uuid),

    #[error("model load already in progress")]
    LoadInProgress,

    #[error("model is already loaded")]
    AlreadyLoaded,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session manager has shut down")]
    ShutDown,

    #[error("inference worker is unavailable")]
    WorkerUnavailable,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
