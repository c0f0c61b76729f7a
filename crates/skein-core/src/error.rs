//! Error types shared across the skein crates.

use thiserror::Error;

/// Unified error type for skein operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("file watcher error: {0}")]
    Watcher(String),

    #[error("op-log error: {0}")]
    OpLog(String),

    #[error("already running")]
    AlreadyRunning,
}

/// Result type alias using the skein Error type.
pub type Result<T> = std::result::Result<T, Error>;
