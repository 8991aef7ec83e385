use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronError {
    #[error("job name can not be empty")]
    JobNameEmpty,

    #[error("unsupported job")]
    JobNotSupported,

    #[error("invalid cron spec: {0}")]
    InvalidSpec(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gossip error: {0}")]
    Gossip(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;
