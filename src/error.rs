//! Error types for rmq.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue {queue} is not consuming, call start_consuming first")]
    NotConsuming { queue: String },

    #[error("queue {queue} has stopped consuming")]
    ConsumingStopped { queue: String },

    #[error("invalid batch size {size} for queue {queue}")]
    InvalidBatchSize { queue: String, size: usize },

    #[error("payload is not valid UTF-8: {0}")]
    InvalidPayload(#[from] std::string::FromUtf8Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Contract violations by the caller. Retrying will not help.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::NotConsuming { .. }
                | Error::ConsumingStopped { .. }
                | Error::InvalidBatchSize { .. }
                | Error::InvalidPayload(_)
        )
    }

    /// Store-level failures the caller may retry with its own backoff policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Redis(_) | Error::Store(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
