use std::io;
use std::sync::PoisonError;

use thiserror::Error;

use crate::tagfile::TagReadResult;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode {0}")]
    Decode(String),

    #[error("Failed to encode {0}")]
    Encode(String),

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(&'static str),

    #[error("Corrupted store log: {0}")]
    CorruptedLog(String),

    /// A precondition was violated: bad tree level, overlapping segment,
    /// duplicate registration. Indicates a programming or configuration
    /// fault rather than a data condition.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("TAG file could not be read: {0:?}")]
    TagFile(TagReadResult),

    #[error("Mutex was poisoned")]
    MutexPoisoned,
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(format!("bincode stream: {}", err))
    }
}
