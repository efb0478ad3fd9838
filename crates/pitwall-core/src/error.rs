use thiserror::Error;

#[derive(Debug, Error)]
pub enum PitwallError {
    #[error("not initialized: no .taskgraph/graph.jsonl found (run 'pitwall init')")]
    NotInitialized,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("baseline lane '{0}' is not installed")]
    BaselineMissing(String),

    #[error("invalid lane strategy: {0}")]
    InvalidStrategy(String),

    #[error("invalid watch spec '{spec}': {reason}")]
    InvalidWatchSpec { spec: String, reason: String },

    #[error("could not lock state file {path}: {source}")]
    LockFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, PitwallError>;
