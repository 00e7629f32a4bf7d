//! On-disk layout definitions for segfs
//!
//! ```text
//! block 0                      superblock
//! blocks 1 ..= 256             segment 0
//! blocks 257 ..= 512           segment 1
//! ...
//! ```
//!
//! Every record is little-endian and packed; offsets below are bytes from
//! the start of the record.

use arrayref::{array_refs, mut_array_refs};
use std::fmt;

use crate::codec::{get_u32, get_u64, put_u32, put_u64};
use crate::error::{LfsError, Result};

/// Magic number identifying a formatted volume ("LFS!")
pub const LFS_MAGIC: u32 = 0x4c46_5321;

/// Smallest addressable unit of the file system
pub const BLOCK_SIZE: usize = 4096;

/// Blocks in one segment (1 MiB)
pub const BLOCKS_PER_SEGMENT: u64 = 256;

/// Bytes in one segment
pub const SEGMENT_SIZE: usize = BLOCK_SIZE * BLOCKS_PER_SEGMENT as usize;

/// Block addresses held by one indirect block
pub const POINTERS_PER_BLOCK: u64 = (BLOCK_SIZE / 8) as u64;

/// Direct block pointers in an inode
pub const DIRECT_POINTERS: usize = 10;

/// First file block index served through the single-indirect block
pub const SINGLE_INDIRECT_START: u64 = DIRECT_POINTERS as u64;

/// First file block index served through the double-indirect block
pub const DOUBLE_INDIRECT_START: u64 = SINGLE_INDIRECT_START + POINTERS_PER_BLOCK;

/// One past the last addressable file block index
pub const MAX_FILE_BLOCKS: u64 = DOUBLE_INDIRECT_START + POINTERS_PER_BLOCK * POINTERS_PER_BLOCK;

/// Serialized inode size
pub const INODE_SIZE: usize = 105;

/// Inodes packed into one block; records never straddle blocks
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;

/// Serialized inode map entry size
pub const INODE_MAP_ENTRY_SIZE: usize = 20;

/// Inode number of the root directory
pub const ROOT_INODE: u64 = 1;

/// Inode number that never names a file
pub const INVALID_INODE: u64 = 0;

/// Index of a block in the volume's address space.
///
/// Address 0 is the superblock and never holds file data, so a zero pointer
/// means "not yet allocated".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPtr(u64);

impl BlockPtr {
    /// The unallocated pointer
    pub const NULL: BlockPtr = BlockPtr(0);

    /// Wrap a raw block address
    pub const fn new(block: u64) -> Self {
        BlockPtr(block)
    }

    /// Raw block address
    pub const fn get(self) -> u64 {
        self.0
    }

    /// True if nothing has been allocated here yet
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The block `n` positions further along the address space
    pub const fn offset(self, n: u64) -> Self {
        BlockPtr(self.0 + n)
    }
}

impl fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of the superblock
pub const SUPERBLOCK_BLOCK: BlockPtr = BlockPtr(0);

/// First block of segment `index`; block 0 is reserved for the superblock
pub const fn segment_start(index: u64) -> BlockPtr {
    BlockPtr(index * BLOCKS_PER_SEGMENT + 1)
}

/// Kind of node an inode describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileType {
    /// Regular file holding user data
    Regular = 1,
    /// Directory holding directory entry records
    Directory = 2,
}

impl TryFrom<u8> for FileType {
    type Error = u8;

    fn try_from(tag: u8) -> std::result::Result<Self, u8> {
        match tag {
            1 => Ok(FileType::Regular),
            2 => Ok(FileType::Directory),
            other => Err(other),
        }
    }
}

/// Volume metadata, always stored at block 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    /// Must equal [`LFS_MAGIC`] on a formatted volume
    pub magic: u32,
    /// First block of the current inode map
    pub inode_map_position: BlockPtr,
    /// Length of the current inode map in blocks
    pub inode_map_size: u64,
    /// Index of the next empty segment
    pub current_segment: u64,
}

impl Superblock {
    /// Bytes used at the start of block 0
    pub const SIZE: usize = 28;

    /// Superblock of a volume with no committed segments
    pub fn new() -> Self {
        Self {
            magic: LFS_MAGIC,
            inode_map_position: BlockPtr::NULL,
            inode_map_size: 0,
            current_segment: 0,
        }
    }

    /// True if the magic marks a formatted volume
    pub fn is_valid(&self) -> bool {
        self.magic == LFS_MAGIC
    }

    /// Encode into a zero-padded block
    pub fn to_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; BLOCK_SIZE];
        put_u32(&mut block, 0, self.magic);
        put_u64(&mut block, 4, self.inode_map_position.get());
        put_u64(&mut block, 12, self.inode_map_size);
        put_u64(&mut block, 20, self.current_segment);
        block
    }

    /// Decode from the start of block 0; the magic is not checked here
    pub fn from_block(block: &[u8]) -> Self {
        Self {
            magic: get_u32(block, 0),
            inode_map_position: BlockPtr(get_u64(block, 4)),
            inode_map_size: get_u64(block, 12),
            current_segment: get_u64(block, 20),
        }
    }
}

impl Default for Superblock {
    fn default() -> Self {
        Self::new()
    }
}

/// In-memory inode; everything but `dirty` is persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// Changed since the last flush
    pub dirty: bool,
    /// Data size in bytes; for directories, the encoded entry bytes
    pub size: u64,
    /// Kind of node
    pub file_type: FileType,
    /// Pointers to the first ten data blocks
    pub direct: [BlockPtr; DIRECT_POINTERS],
    /// Block of pointers to data blocks
    pub indirect: BlockPtr,
    /// Block of pointers to blocks of pointers to data blocks
    pub double_indirect: BlockPtr,
}

impl Inode {
    /// Fresh, empty and dirty inode
    pub fn new(file_type: FileType) -> Self {
        Self {
            dirty: true,
            size: 0,
            file_type,
            direct: [BlockPtr::NULL; DIRECT_POINTERS],
            indirect: BlockPtr::NULL,
            double_indirect: BlockPtr::NULL,
        }
    }

    /// True for directories
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Number of blocks spanned by `size`
    pub fn block_span(&self) -> u64 {
        (self.size + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64
    }

    /// Serialize into the 105-byte record:
    /// size @0, file type @8, direct pointers @9..89, indirect @89, double indirect @97
    pub fn encode(&self, out: &mut [u8; INODE_SIZE]) {
        let (size, file_type, direct, indirect, double) = mut_array_refs![out, 8, 1, 80, 8, 8];
        put_u64(size, 0, self.size);
        file_type[0] = self.file_type as u8;
        for (i, ptr) in self.direct.iter().enumerate() {
            put_u64(direct, i * 8, ptr.get());
        }
        put_u64(indirect, 0, self.indirect.get());
        put_u64(double, 0, self.double_indirect.get());
    }

    /// Deserialize a record; the result is clean
    pub fn decode(inode_number: u64, raw: &[u8; INODE_SIZE]) -> Result<Self> {
        let (size, file_type, direct, indirect, double) = array_refs![raw, 8, 1, 80, 8, 8];
        let file_type =
            FileType::try_from(file_type[0]).map_err(|_| LfsError::CorruptInode(inode_number))?;

        let mut pointers = [BlockPtr::NULL; DIRECT_POINTERS];
        for (i, ptr) in pointers.iter_mut().enumerate() {
            *ptr = BlockPtr(get_u64(direct, i * 8));
        }

        Ok(Self {
            dirty: false,
            size: get_u64(size, 0),
            file_type,
            direct: pointers,
            indirect: BlockPtr(get_u64(indirect, 0)),
            double_indirect: BlockPtr(get_u64(double, 0)),
        })
    }
}

/// Current on-disk position of one inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMapEntry {
    /// Inode number
    pub inode: u64,
    /// Block the inode record lives in
    pub block: BlockPtr,
    /// Byte offset of the record inside `block`
    pub offset: u32,
}

impl InodeMapEntry {
    /// The all-zero record closing a serialized map
    pub const TERMINATOR: InodeMapEntry = InodeMapEntry {
        inode: INVALID_INODE,
        block: BlockPtr::NULL,
        offset: 0,
    };

    /// True for the list terminator
    pub fn is_terminator(&self) -> bool {
        *self == Self::TERMINATOR
    }

    /// Serialize: inode @0, block @8, offset @16
    pub fn encode(&self, out: &mut [u8; INODE_MAP_ENTRY_SIZE]) {
        put_u64(out, 0, self.inode);
        put_u64(out, 8, self.block.get());
        put_u32(out, 16, self.offset);
    }

    /// Deserialize one record
    pub fn decode(raw: &[u8; INODE_MAP_ENTRY_SIZE]) -> Self {
        Self {
            inode: get_u64(raw, 0),
            block: BlockPtr(get_u64(raw, 8)),
            offset: get_u32(raw, 16),
        }
    }
}
