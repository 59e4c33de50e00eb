use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("timer is already active: {0}")]
    TraceAlreadyActive(String),

    #[error("corrupted timer stack: {0}")]
    CorruptedStack(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
