// Error types for each failure family. Everything below the process edge
// returns one of these; `server::run()` folds them into `anyhow`.
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("no connection acknowledgement within {0:?}")]
    ConnectTimeout(Duration),

    #[error("subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },

    #[error("disconnect failed: {0}")]
    Disconnect(String),

    #[error("not connected")]
    NotConnected,

    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] duckdb::Error),

    #[error("arrow error: {0}")]
    Arrow(#[from] duckdb::arrow::error::ArrowError),

    #[error("storage worker unavailable: {0}")]
    WorkerUnavailable(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("connection manager already started")]
    AlreadyStarted,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
