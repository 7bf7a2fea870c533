use thiserror::Error;

/// Convenience type alias for Results with LegatusError
pub type Result<T> = std::result::Result<T, LegatusError>;

/// Main error type for the Legatus orchestrator
///
/// Covers every failure the orchestration core can surface. Transient
/// store/container/memory failures are wrapped here and swallowed at the
/// reactor edge; invalid state transitions are programmer errors and
/// propagate.
#[derive(Error, Debug)]
pub enum LegatusError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid transition: {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Checkpoint {0} not found")]
    CheckpointNotFound(String),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Spawn failed: {message}")]
    Spawn { message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("Merge conflict in {} file(s)", .files.len())]
    MergeConflict { files: Vec<String> },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Memory service error: {0}")]
    Memory(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl LegatusError {
    pub fn git(message: impl Into<String>) -> Self {
        LegatusError::Git {
            message: message.into(),
        }
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        LegatusError::Spawn {
            message: message.into(),
        }
    }
}
