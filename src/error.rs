use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("key not found")]
    NotFound,

    #[error("entry already exists")]
    Exists,

    #[error("lock would block")]
    WouldBlock,

    #[error("out of space: {0}")]
    NoMemory(String),

    #[error("database corrupt: {0}")]
    Corrupt(String),

    #[error("previous lock owner died; integrity check recommended")]
    LockDeadOwner,

    #[error("database file was replaced")]
    Replaced,
}

impl DbError {
    /// True for the conditions a cache-mode caller treats as
    /// eviction-exhausted rather than a hard failure.
    pub fn is_no_memory(&self) -> bool {
        matches!(self, DbError::NoMemory(_))
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
