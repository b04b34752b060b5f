use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed condition or request, rejected before normalization.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Storage, bus or market data unreachable. Callers retry on the next cycle.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// A single condition could not be computed (e.g. insufficient lookback).
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for transient failures where the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ServiceUnavailable(_) | Error::Http(_) => true,
            Error::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
                sqlx::Error::Database(db) => {
                    let msg = db.message();
                    msg.contains("locked") || msg.contains("busy")
                }
                _ => false,
            },
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
