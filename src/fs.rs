//! The log-structured file system engine
//!
//! [`Lfs`] owns every piece of mutable state: the superblock copy, the
//! segment under construction, the inode map and the inode cache. All
//! operations take `&mut self`; sharing an engine between tasks goes through
//! [`crate::volume::LfsVolume`].

use arrayref::array_ref;
use std::sync::Arc;

use crate::blockdev::{BlockDevice, BlockIo};
use crate::cache::BlockCache;
use crate::config::LfsConfig;
use crate::error::{LfsError, Result};
use crate::inode_map::{InodeAllocator, InodeCache, InodeMap};
use crate::layout::{
    FileType, Inode, Superblock, BLOCKS_PER_SEGMENT, BLOCK_SIZE, INODE_SIZE, INVALID_INODE,
    ROOT_INODE, SUPERBLOCK_BLOCK,
};
use crate::path;
use crate::segment::SegmentWriter;

/// Log-structured file system engine over a block device
pub struct Lfs {
    pub(crate) io: BlockIo,
    pub(crate) config: LfsConfig,
    pub(crate) superblock: Superblock,
    pub(crate) segment: SegmentWriter,
    pub(crate) blocks: BlockCache,
    pub(crate) inode_map: InodeMap,
    pub(crate) inodes: InodeCache,
    pub(crate) allocator: InodeAllocator,
    /// Set when state changed that no dirty inode carries, e.g. a deletion
    pub(crate) dirty: bool,
}

/// Read block 0 of `io`
async fn read_superblock(io: &BlockIo) -> Result<Option<Superblock>> {
    if io.block_count() == 0 {
        return Ok(None);
    }
    let mut block = vec![0u8; BLOCK_SIZE];
    io.read_block(SUPERBLOCK_BLOCK, &mut block).await?;
    Ok(Some(Superblock::from_block(&block)))
}

/// Reject a superblock whose inode map or segment index lies outside the device
fn check_superblock(superblock: &Superblock, block_count: u64) -> Result<()> {
    let map_start = superblock.inode_map_position.get();
    let map_end = map_start.checked_add(superblock.inode_map_size);
    if map_start == 0
        || superblock.inode_map_size == 0
        || map_end.map_or(true, |end| end > block_count)
    {
        return Err(LfsError::CorruptInodeMap(format!(
            "map of {} blocks at {} does not fit a device of {} blocks",
            superblock.inode_map_size, superblock.inode_map_position, block_count
        )));
    }

    let segment_start = superblock
        .current_segment
        .checked_mul(BLOCKS_PER_SEGMENT)
        .and_then(|block| block.checked_add(1));
    if segment_start.map_or(true, |start| start > block_count) {
        return Err(LfsError::CorruptInodeMap(format!(
            "segment {} lies past the end of the device",
            superblock.current_segment
        )));
    }
    Ok(())
}

impl Lfs {
    fn with_superblock(io: BlockIo, config: LfsConfig, superblock: Superblock) -> Self {
        Self {
            segment: SegmentWriter::new(superblock.current_segment),
            blocks: BlockCache::new(config.block_cache_capacity),
            inode_map: InodeMap::new(),
            inodes: InodeCache::new(),
            allocator: InodeAllocator::after(ROOT_INODE),
            dirty: false,
            io,
            config,
            superblock,
        }
    }

    /// True if `device` holds a formatted volume
    pub async fn is_formatted(device: Arc<dyn BlockDevice>) -> Result<bool> {
        let io = BlockIo::new(device)?;
        Ok(read_superblock(&io).await?.map_or(false, |sb| sb.is_valid()))
    }

    /// Mount an existing volume.
    ///
    /// Returns `Ok(None)` if the superblock magic does not match; the device
    /// is left untouched in that case.
    pub async fn mount(device: Arc<dyn BlockDevice>, config: LfsConfig) -> Result<Option<Self>> {
        let io = BlockIo::new(device)?;
        let superblock = match read_superblock(&io).await? {
            Some(sb) if sb.is_valid() => sb,
            Some(sb) => {
                log::info!("no volume found (magic {:#010x})", sb.magic);
                return Ok(None);
            }
            None => return Ok(None),
        };

        check_superblock(&superblock, io.block_count())?;
        let mut fs = Self::with_superblock(io, config, superblock);

        let mut bytes = Vec::with_capacity(superblock.inode_map_size as usize * BLOCK_SIZE);
        let mut block = vec![0u8; BLOCK_SIZE];
        for i in 0..superblock.inode_map_size {
            fs.io
                .read_block(superblock.inode_map_position.offset(i), &mut block)
                .await?;
            bytes.extend_from_slice(&block);
        }
        fs.inode_map = InodeMap::from_bytes(&bytes)?;
        if fs.inode_map.get(ROOT_INODE).is_none() {
            return Err(LfsError::CorruptInodeMap(
                "root directory is not mapped".to_string(),
            ));
        }
        fs.allocator = InodeAllocator::after(fs.inode_map.highest());

        log::info!(
            "mounted volume: {} inodes, inode map at {} ({} blocks), next segment {}",
            fs.inode_map.len(),
            superblock.inode_map_position,
            superblock.inode_map_size,
            superblock.current_segment
        );
        Ok(Some(fs))
    }

    /// Write an empty volume to `device` and mount it
    pub async fn format(device: Arc<dyn BlockDevice>, config: LfsConfig) -> Result<Self> {
        let io = BlockIo::new(device)?;
        log::info!("formatting volume of {} blocks", io.block_count());

        let mut fs = Self::with_superblock(io, config, Superblock::new());
        fs.initialize().await?;
        Ok(fs)
    }

    /// Discard all state and reformat the device in place
    pub async fn reset(&mut self) -> Result<()> {
        log::warn!("resetting volume, all data will be lost");
        self.initialize().await
    }

    /// Build an empty volume holding only the root directory and persist it
    async fn initialize(&mut self) -> Result<()> {
        self.superblock = Superblock::new();
        self.segment.reset(self.superblock.current_segment);
        self.blocks.clear();
        self.inode_map.clear();
        self.inodes.clear();
        self.allocator = InodeAllocator::after(ROOT_INODE);

        self.inodes.insert(ROOT_INODE, Inode::new(FileType::Directory));
        self.add_directory_entry(ROOT_INODE, ".", ROOT_INODE).await?;
        self.add_directory_entry(ROOT_INODE, "..", ROOT_INODE).await?;

        self.dirty = true;
        self.flush().await?;
        Ok(())
    }

    /// Flush and release the device
    pub async fn unmount(mut self) -> Result<()> {
        self.flush().await?;
        log::info!("unmounted volume at segment {}", self.segment.index());
        Ok(())
    }

    /// Current superblock contents
    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Configuration the engine was mounted with
    pub fn config(&self) -> &LfsConfig {
        &self.config
    }

    /// Index of the segment being staged
    pub fn current_segment(&self) -> u64 {
        self.segment.index()
    }

    /// Number the next created node will receive
    pub fn next_inode_number(&self) -> u64 {
        self.allocator.peek()
    }

    /// (hits, misses) of the committed block cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.blocks.stats()
    }

    /// Copy of inode `number`, from the cache or from its mapped position
    pub(crate) async fn load_inode(&mut self, number: u64) -> Result<Option<Inode>> {
        if let Some(inode) = self.inodes.get(number) {
            return Ok(Some(inode.clone()));
        }
        let entry = match self.inode_map.get(number) {
            Some(entry) => *entry,
            None => return Ok(None),
        };

        let offset = entry.offset as usize;
        if offset + INODE_SIZE > BLOCK_SIZE {
            return Err(LfsError::CorruptInode(number));
        }
        let block = self.read_block(entry.block).await?;
        let inode = Inode::decode(number, array_ref![block, offset, INODE_SIZE])?;

        log::trace!("loaded inode {} from {}+{}", number, entry.block, offset);
        self.inodes.insert(number, inode.clone());
        Ok(Some(inode))
    }

    /// Put a modified inode back into the cache
    pub(crate) fn store_inode(&mut self, number: u64, inode: Inode) {
        self.inodes.insert(number, inode);
    }

    /// Resolve `path` to an inode, or `None` if it does not exist
    async fn resolve_path(&mut self, path: &str) -> Result<Option<(u64, Inode)>> {
        let number = self.lookup(path).await?;
        if number == INVALID_INODE {
            return Ok(None);
        }
        Ok(self.load_inode(number).await?.map(|inode| (number, inode)))
    }

    /// Create an empty file or directory at `path`.
    ///
    /// Returns false if `path` already exists, names the root, or its parent
    /// is missing or not a directory.
    pub async fn create_node(&mut self, path: &str, file_type: FileType) -> Result<bool> {
        let (parent_path, name) = match path::split_parent(path) {
            Some(split) => split,
            None => return Ok(false),
        };
        if self.lookup(path).await? != INVALID_INODE {
            log::debug!("create {}: already exists", path);
            return Ok(false);
        }
        let parent = match self.resolve_path(&parent_path).await? {
            Some((number, inode)) if inode.is_dir() => number,
            _ => {
                log::debug!("create {}: no parent directory {}", path, parent_path);
                return Ok(false);
            }
        };

        let number = self.allocator.allocate();
        self.inodes.insert(number, Inode::new(file_type));
        if file_type == FileType::Directory {
            self.add_directory_entry(number, ".", number).await?;
            self.add_directory_entry(number, "..", parent).await?;
        }
        self.add_directory_entry(parent, name, number).await?;

        log::debug!("created {:?} {} as inode {}", file_type, path, number);
        Ok(true)
    }

    /// Remove the node at `path`.
    ///
    /// Returns false if it does not exist, is the root, or is a directory
    /// with entries other than `.` and `..`. The node's blocks are not
    /// reclaimed.
    pub async fn delete_node(&mut self, path: &str) -> Result<bool> {
        let (parent_path, name) = match path::split_parent(path) {
            Some(split) => split,
            None => return Ok(false),
        };
        if name == "." || name == ".." {
            log::warn!("delete {}: refusing to unlink a dot entry", path);
            return Ok(false);
        }
        let (number, inode) = match self.resolve_path(path).await? {
            Some(found) => found,
            None => return Ok(false),
        };
        if number == ROOT_INODE {
            return Ok(false);
        }
        if inode.is_dir() {
            let children = self.list_directory_entries(&inode).await?;
            if children.iter().any(|name| name != "." && name != "..") {
                log::warn!("delete {}: directory not empty", path);
                return Ok(false);
            }
        }

        let parent = match self.resolve_path(&parent_path).await? {
            Some((parent, dir)) if dir.is_dir() => {
                if self.find_directory_entry(&dir, name).await? != number {
                    return Ok(false);
                }
                parent
            }
            _ => return Ok(false),
        };
        if !self.delete_directory_entry(parent, name).await? {
            return Ok(false);
        }
        self.inodes.remove(number);
        self.inode_map.remove(number);
        self.dirty = true;

        log::debug!("deleted {} (inode {})", path, number);
        Ok(true)
    }

    /// Read up to `len` bytes at `offset`; the result is clamped to the file
    /// size and empty for missing paths and directories
    pub async fn read_data(&mut self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inode = match self.resolve_path(path).await? {
            Some((_, inode)) if !inode.is_dir() => inode,
            _ => return Ok(Vec::new()),
        };
        if offset >= inode.size {
            return Ok(Vec::new());
        }

        let end = inode.size.min(offset.saturating_add(len));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min((end - pos) as usize);

            let block = self.read_block_of_file(&inode, index).await?;
            out.extend_from_slice(&block[in_block..in_block + chunk]);
            pos += chunk as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset` and return the number of bytes written.
    ///
    /// The file size grows by `data.len()` regardless of `offset`. Missing
    /// paths and directories are left alone and report 0.
    pub async fn write_data(&mut self, path: &str, offset: u64, data: &[u8]) -> Result<u64> {
        let (number, mut inode) = match self.resolve_path(path).await? {
            Some((number, inode)) if !inode.is_dir() => (number, inode),
            _ => return Ok(0),
        };
        if data.is_empty() {
            return Ok(0);
        }

        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(LfsError::FileTooLarge(offset / BLOCK_SIZE as u64))?;
        let size = inode
            .size
            .checked_add(data.len() as u64)
            .ok_or(LfsError::FileTooLarge(end / BLOCK_SIZE as u64))?;
        let mut pos = offset;
        let mut consumed = 0usize;
        while pos < end {
            let index = pos / BLOCK_SIZE as u64;
            let in_block = (pos % BLOCK_SIZE as u64) as usize;
            let chunk = (BLOCK_SIZE - in_block).min((end - pos) as usize);

            let mut block = if chunk == BLOCK_SIZE {
                vec![0u8; BLOCK_SIZE]
            } else {
                self.read_block_of_file(&inode, index).await?
            };
            block[in_block..in_block + chunk].copy_from_slice(&data[consumed..consumed + chunk]);
            self.write_block_of_file(&mut inode, index, &block).await?;

            pos += chunk as u64;
            consumed += chunk;
        }

        inode.size = size;
        inode.dirty = true;
        self.store_inode(number, inode);

        log::trace!("wrote {} bytes at {} to {}", data.len(), offset, path);
        Ok(data.len() as u64)
    }

    /// Type of the node at `path`, or `None` if it does not exist
    pub async fn get_file_type(&mut self, path: &str) -> Result<Option<FileType>> {
        Ok(self
            .resolve_path(path)
            .await?
            .map(|(_, inode)| inode.file_type))
    }

    /// Size in bytes of the file at `path`; 0 for directories and missing paths
    pub async fn get_length(&mut self, path: &str) -> Result<u64> {
        Ok(match self.resolve_path(path).await? {
            Some((_, inode)) if !inode.is_dir() => inode.size,
            _ => 0,
        })
    }

    /// Entry names of the directory at `path`, including `.` and `..`;
    /// empty for missing paths and regular files
    pub async fn get_children(&mut self, path: &str) -> Result<Vec<String>> {
        match self.resolve_path(path).await? {
            Some((_, inode)) if inode.is_dir() => self.list_directory_entries(&inode).await,
            _ => Ok(Vec::new()),
        }
    }
}
