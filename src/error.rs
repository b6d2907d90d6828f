use std::path::PathBuf;
use thiserror::Error;

/// All the ways reading a BCF/SFS container can fail.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("'{}' is not an SFS container (bad signature)", .0.display())]
    NotSfsContainer(PathBuf),

    #[error("unsupported SFS container: {0}")]
    UnsupportedVersion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("read past end of container data at offset {offset}")]
    Truncated { offset: u64 },

    #[error("no entry '{0}' in the container tree")]
    NotFound(String),

    #[error("entry '{0}' is a directory, not a file")]
    NotAFile(String),

    #[error("file is marked compressed but carries no known compression signature")]
    UnknownCompression,

    #[error("bad acquisition header: {0}")]
    BadHeader(String),

    #[error("bad hypermap stream at byte {offset}: {reason}")]
    BadHypermap { offset: u64, reason: String },

    #[error("hypermap index {index} not available (present: {available:?})")]
    IndexOutOfRange { index: usize, available: Vec<usize> },

    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
