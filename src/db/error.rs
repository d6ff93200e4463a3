use std::io;

use super::ptr::{Ptr, Void};

/// Problems with the file header. Any of these means the file cannot be used as-is,
/// and the index has to be rebuilt from scratch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("the store does not contain a symdex database (magic bytes are missing)")]
    NotADatabase,
    #[error("database format version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("the store is smaller than the allocator claims to use ({used} > {size})")]
    Truncated { used: u64, size: u64 },
    #[error("the database header is corrupt")]
    Corrupt,
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("error in underlying storage: {0}")]
    Io(#[from] io::Error),
    #[error("invalid database file: {0}")]
    Format(#[from] FormatError),
    #[error("allocation of {size} bytes is larger than the maximum chunk size of {max}")]
    TooLarge { size: u32, max: u32 },
    #[error("attempted a zero sized allocation")]
    ZeroSized,
    #[error("pointer {0:?} does not point to a chunk tracked by the allocator")]
    PointerInvalid(Ptr<Void>),
    #[error("attempted to free {0:?}, which is already free")]
    DoubleFree(Ptr<Void>),
    #[error("data in the store is corrupt or misinterpreted: {0}")]
    Corrupt(&'static str),
    #[error("access of {len} bytes at {at:#X} is outside of the store")]
    OutOfBounds { at: u64, len: u64 },
    #[error("string data is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("root slot {0} does not exist")]
    RootIndex(usize),
    #[error("index operation failed: {0}")]
    Index(String),
}

pub type Result<T, E = DbError> = std::result::Result<T, E>;
