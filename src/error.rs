use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Every fallible engine operation returns this; see
/// the error handling policy: a mutation that fails partway marks its
/// transaction `ERROR` and the only legal continuation is `abort`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key not found")]
    NotFound,

    #[error("key already exists")]
    Exists,

    #[error("write lock held by another transaction")]
    Busy,

    #[error("file has been replaced, reopen the engine")]
    Stale,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("out of memory")]
    NoMem,
}

impl Error {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub(crate) fn invalid_arg(msg: impl Into<String>) -> Self {
        Error::InvalidArg(msg.into())
    }
}

/// Internal error for leaf page codec operations, folded into
/// [`Error::Corrupt`] at the module boundary (mirrors how page-level parse
/// errors are kept separate from the crate-wide error type until they cross
/// into tree-level code).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeafPageError {
    #[error("page full")]
    PageFull,
    #[error("page corrupt: {0}")]
    Corrupt(String),
}

/// Same role as [`LeafPageError`] but for branch pages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BranchPageError {
    #[error("page full")]
    PageFull,
    #[error("page corrupt: {0}")]
    Corrupt(String),
}

impl From<LeafPageError> for Error {
    fn from(e: LeafPageError) -> Self {
        match e {
            LeafPageError::PageFull => Error::corrupt("leaf page full during commit-time write"),
            LeafPageError::Corrupt(msg) => Error::corrupt(format!("leaf: {msg}")),
        }
    }
}

impl From<BranchPageError> for Error {
    fn from(e: BranchPageError) -> Self {
        match e {
            BranchPageError::PageFull => Error::corrupt("branch page full during commit-time write"),
            BranchPageError::Corrupt(msg) => Error::corrupt(format!("branch: {msg}")),
        }
    }
}
