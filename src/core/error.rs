use crate::digest::Digest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobfsError {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Out of space: no contiguous run of free blocks is large enough")]
    NoSpace,

    #[error("Out of resources: inode table is full")]
    NoResources,

    #[error("Out of memory: staging buffer allocation failed")]
    NoMemory,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad state: {0}")]
    BadState(String),

    #[error("Blob already exists: {0}")]
    AlreadyExists(Digest),

    #[error("Blob not found: {0}")]
    NotFound(Digest),
}

impl BlobfsError {
    /// POSIX errno for this error, as a VFS layer would report it.
    pub fn to_errno(&self) -> i32 {
        match self {
            BlobfsError::InvalidArgs(_) => 22, // EINVAL
            BlobfsError::NoSpace => 28,        // ENOSPC
            BlobfsError::NoResources => 28,    // ENOSPC
            BlobfsError::NoMemory => 12,       // ENOMEM
            BlobfsError::Io(_) => 5,           // EIO
            BlobfsError::BadState(_) => 5,     // EIO
            BlobfsError::AlreadyExists(_) => 17, // EEXIST
            BlobfsError::NotFound(_) => 2,     // ENOENT
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        BlobfsError::InvalidArgs(msg.into())
    }

    pub(crate) fn bad_state(msg: impl Into<String>) -> Self {
        BlobfsError::BadState(msg.into())
    }
}

impl From<std::collections::TryReserveError> for BlobfsError {
    fn from(_: std::collections::TryReserveError) -> Self {
        BlobfsError::NoMemory
    }
}

pub type Result<T> = std::result::Result<T, BlobfsError>;
