use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TreeError>;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("node not found at \"{0}\"")]
    NodeNotFound(String),
    #[error("truncated data: {0}")]
    Truncated(String),
    #[error("corruption detected: {0}")]
    Corrupt(String),
    #[error("lock expired: {0}")]
    LockExpired(String),
    #[error("lock conflict: {0}")]
    LockConflict(String),
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
