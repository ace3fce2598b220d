use thiserror::Error;

#[derive(Debug, Error)]
pub enum HiveError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC protocol error: {0}")]
    Ipc(String),

    #[error("Worker {index} unavailable: {reason}")]
    WorkerUnavailable { index: usize, reason: String },

    #[error("No available workers")]
    NoAvailableWorkers,

    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HiveError>;
