//! Error types for workq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is empty")]
    EmptyQueue,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("corrupt key {key:?} in partition {partition:?}")]
    CorruptKey { partition: String, key: String },

    #[error("deque index exhausted at {0} boundary")]
    IndexExhausted(&'static str),

    #[error("partition {0:?} kept moving under concurrent writers")]
    WriteConflict(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid work queue settings: {0}")]
    InvalidSettings(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure reported by an [`ItemProcessor`](crate::engine::ItemProcessor)
/// that did not classify its own outcome. Treated as a failed attempt.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{0}")]
    Downstream(String),

    #[error("item processor panicked: {0}")]
    Panicked(String),
}

impl ProcessingError {
    pub fn downstream(message: impl Into<String>) -> Self {
        Self::Downstream(message.into())
    }
}
