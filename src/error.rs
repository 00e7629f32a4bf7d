//! Error types for the segfs engine

use std::io;
use thiserror::Error;

use crate::blockdev::BlockDeviceError;

/// Filesystem error type
///
/// "Not found" and "already exists" are not errors: the facade reports them
/// as neutral return values and leaves the policy to its caller.
#[derive(Error, Debug)]
pub enum LfsError {
    /// Device read or write failed; fatal to the operation in progress
    #[error("I/O error: {0}")]
    Io(#[from] BlockDeviceError),

    /// Sector size cannot be combined into whole blocks
    #[error("Unsupported sector size: {0}")]
    InvalidSectorSize(usize),

    /// The next segment would run past the end of the device
    #[error("No free segments left on device")]
    NoSpace,

    /// File-relative block index beyond the double-indirect range
    #[error("File block index {0} exceeds the maximum file size")]
    FileTooLarge(u64),

    /// Inode record could not be decoded
    #[error("Inode {0} is corrupt")]
    CorruptInode(u64),

    /// Inode map could not be decoded
    #[error("Inode map is corrupt: {0}")]
    CorruptInodeMap(String),

    /// Block allocation attempted while a segment is being committed
    #[error("Segment is being committed")]
    SegmentBusy,

    /// Configuration could not be parsed
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl From<io::Error> for LfsError {
    fn from(err: io::Error) -> Self {
        LfsError::Io(BlockDeviceError::Io(err))
    }
}

/// Result type for file system operations
pub type Result<T> = std::result::Result<T, LfsError>;
