use std::path::PathBuf;

use thiserror::Error;

/// Semantic error kinds raised by the archive, index and shard layers.
///
/// I/O and SQL failures that don't need special handling surface through
/// `Io`/`Sql` unchanged; the CLI wraps everything in `anyhow` and adds
/// context at each call site rather than here.
#[derive(Debug, Error)]
pub enum BarecatError {
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("file already exists: {0}")]
    FileExists(PathBuf),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(PathBuf),

    #[error("is a directory: {0}")]
    IsADirectory(PathBuf),

    #[error("file too large for a shard ({size} bytes, limit is {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("not enough space to place {size} bytes")]
    NotEnoughSpace { size: u64 },

    #[error("CRC32C mismatch for {path}: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        path: PathBuf,
        expected: u32,
        actual: u32,
    },

    #[error("{path} changed size between scan and read: reserved {reserved} bytes, read {actual} bytes")]
    SizeChanged {
        path: PathBuf,
        reserved: u64,
        actual: u64,
    },

    #[error("integrity error: {0}")]
    IntegrityError(String),

    #[error("permission denied: {0}")]
    PermissionError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, BarecatError>;
