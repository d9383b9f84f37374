//! Infrastructure-level error type.
//!
//! Flat, terse-message enum. This is the error surfaced by store/lock
//! adapters; engine entry points catch it at the boundary and convert it
//! into a [`crate::events::CommandOutcome`], never letting it propagate
//! past an entry point.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("keyed store error: {0}")]
    Keyed(String),

    #[error("durable store error: {0}")]
    Durable(String),

    #[error("lock not acquired")]
    LockBusy,

    #[error("snapshot verification failed after write")]
    VerificationFailed,

    #[error("snapshot missing or corrupt")]
    SnapshotMissing,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for EngineError {
    fn from(e: redis::RedisError) -> Self {
        EngineError::Keyed(e.to_string())
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        EngineError::Durable(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
