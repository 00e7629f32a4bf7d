//! segfs - a log-structured file system engine
//!
//! This crate stores a hierarchical file system on a raw block device. Data
//! is never overwritten in place: every change is appended to a 1 MiB
//! segment buffer, and a flush writes the buffer out together with the
//! relocated inodes, a fresh inode map and finally the superblock.
//!
//! [`Lfs`] is the single-owner engine; [`LfsVolume`] shares one between
//! tasks and flushes it in the background.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod blockdev;
pub mod cache;
pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod flush;
pub mod fs;
pub mod inode_map;
pub mod layout;
pub mod path;
pub mod resolver;
pub mod segment;
pub mod volume;

pub use blockdev::{BlockDevice, FileBackedBlockDevice, MemoryBlockDevice};
pub use config::LfsConfig;
pub use directory::DirEntry;
pub use error::{LfsError, Result};
pub use fs::Lfs;
pub use layout::{FileType, BLOCK_SIZE, ROOT_INODE, SEGMENT_SIZE};
pub use volume::LfsVolume;

/// Re-export common types and traits
pub mod prelude {
    pub use crate::blockdev::BlockDevice;
    pub use crate::error::{LfsError, Result};
    pub use crate::layout::FileType;
    pub use crate::{Lfs, LfsConfig, LfsVolume};
}
