//! Inode map and inode cache
//!
//! Inodes move on every flush, so the map from inode number to on-disk
//! position is rewritten in full each time. The cache holds decoded inodes,
//! including new and modified ones that exist nowhere else until the next
//! flush.

use arrayref::{array_mut_ref, array_ref};
use std::collections::HashMap;

use crate::error::{LfsError, Result};
use crate::layout::{Inode, InodeMapEntry, BLOCK_SIZE, INODE_MAP_ENTRY_SIZE, ROOT_INODE};

/// Inode number -> current on-disk position
#[derive(Debug, Default, Clone)]
pub struct InodeMap {
    entries: HashMap<u64, InodeMapEntry>,
}

impl InodeMap {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of `inode`, if it has ever been flushed
    pub fn get(&self, inode: u64) -> Option<&InodeMapEntry> {
        self.entries.get(&inode)
    }

    /// Record a new position for `entry.inode`
    pub fn insert(&mut self, entry: InodeMapEntry) {
        self.entries.insert(entry.inode, entry);
    }

    /// Forget `inode`; returns true if it was present
    pub fn remove(&mut self, inode: u64) -> bool {
        self.entries.remove(&inode).is_some()
    }

    /// Number of mapped inodes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no inode is mapped
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest mapped inode number, or 0
    pub fn highest(&self) -> u64 {
        self.entries.keys().copied().max().unwrap_or(0)
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Serialize as packed records closed by an all-zero record, padded to
    /// whole blocks. Records may straddle block boundaries.
    pub fn to_blocks(&self) -> Vec<u8> {
        let mut entries: Vec<&InodeMapEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.inode);

        let used = (entries.len() + 1) * INODE_MAP_ENTRY_SIZE;
        let blocks = (used + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let mut out = vec![0u8; blocks * BLOCK_SIZE];

        for (i, entry) in entries.iter().enumerate() {
            let start = i * INODE_MAP_ENTRY_SIZE;
            entry.encode(array_mut_ref![out, start, INODE_MAP_ENTRY_SIZE]);
        }
        // the terminator is already zero
        out
    }

    /// Parse a serialized map, stopping at the terminator
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut map = Self::new();
        let mut offset = 0;

        while offset + INODE_MAP_ENTRY_SIZE <= bytes.len() {
            let entry = InodeMapEntry::decode(array_ref![bytes, offset, INODE_MAP_ENTRY_SIZE]);
            if entry.is_terminator() {
                return Ok(map);
            }
            if entry.inode == 0 || entry.block.is_null() {
                return Err(LfsError::CorruptInodeMap(format!(
                    "malformed record at byte {}",
                    offset
                )));
            }
            map.insert(entry);
            offset += INODE_MAP_ENTRY_SIZE;
        }

        Err(LfsError::CorruptInodeMap("missing terminator".to_string()))
    }
}

/// Decoded inodes, keyed by inode number
#[derive(Debug, Default)]
pub struct InodeCache {
    inodes: HashMap<u64, Inode>,
}

impl InodeCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached copy of `inode`
    pub fn get(&self, inode: u64) -> Option<&Inode> {
        self.inodes.get(&inode)
    }

    /// Mutable cached copy of `inode`
    pub fn get_mut(&mut self, inode: u64) -> Option<&mut Inode> {
        self.inodes.get_mut(&inode)
    }

    /// Insert or replace
    pub fn insert(&mut self, number: u64, inode: Inode) {
        self.inodes.insert(number, inode);
    }

    /// Drop `inode` from the cache
    pub fn remove(&mut self, inode: u64) -> Option<Inode> {
        self.inodes.remove(&inode)
    }

    /// Numbers of all dirty inodes, ascending
    pub fn dirty(&self) -> Vec<u64> {
        let mut dirty: Vec<u64> = self
            .inodes
            .iter()
            .filter(|(_, inode)| inode.dirty)
            .map(|(&number, _)| number)
            .collect();
        dirty.sort_unstable();
        dirty
    }

    /// True if any inode needs writing
    pub fn has_dirty(&self) -> bool {
        self.inodes.values().any(|inode| inode.dirty)
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.inodes.clear();
    }
}

/// Hands out inode numbers; never repeats one within a mount
#[derive(Debug, Clone)]
pub struct InodeAllocator {
    next: u64,
}

impl InodeAllocator {
    /// Start after `highest`, never below the first number after the root
    pub fn after(highest: u64) -> Self {
        Self {
            next: highest.max(ROOT_INODE) + 1,
        }
    }

    /// Take the next number
    pub fn allocate(&mut self) -> u64 {
        let number = self.next;
        self.next += 1;
        number
    }

    /// Number the next call to [`allocate`](Self::allocate) returns
    pub fn peek(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BlockPtr, FileType};

    fn entry(inode: u64, block: u64, offset: u32) -> InodeMapEntry {
        InodeMapEntry {
            inode,
            block: BlockPtr::new(block),
            offset,
        }
    }

    #[test]
    fn test_map_serialization_is_terminated() {
        let mut map = InodeMap::new();
        map.insert(entry(7, 40, 105));
        map.insert(entry(1, 40, 0));

        let blocks = map.to_blocks();
        assert_eq!(blocks.len(), BLOCK_SIZE);
        // sorted by inode number
        assert_eq!(&blocks[0..8], &1u64.to_le_bytes());
        assert_eq!(&blocks[20..28], &7u64.to_le_bytes());
        assert!(blocks[40..60].iter().all(|&b| b == 0));

        let parsed = InodeMap::from_bytes(&blocks).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get(7), Some(&entry(7, 40, 105)));
        assert_eq!(parsed.highest(), 7);
    }

    #[test]
    fn test_map_spanning_blocks() {
        let mut map = InodeMap::new();
        for inode in 1..=300 {
            map.insert(entry(inode, 1000 + inode / 39, (inode % 39) as u32 * 105));
        }

        let blocks = map.to_blocks();
        // 301 records * 20 bytes
        assert_eq!(blocks.len(), 2 * BLOCK_SIZE);

        let parsed = InodeMap::from_bytes(&blocks).unwrap();
        assert_eq!(parsed.len(), 300);
        assert_eq!(parsed.get(205), map.get(205));
    }

    #[test]
    fn test_map_without_terminator_is_corrupt() {
        let mut bytes = vec![0xFFu8; INODE_MAP_ENTRY_SIZE * 2];
        bytes[..8].copy_from_slice(&3u64.to_le_bytes());
        assert!(matches!(
            InodeMap::from_bytes(&bytes),
            Err(LfsError::CorruptInodeMap(_))
        ));
    }

    #[test]
    fn test_dirty_tracking() {
        let mut cache = InodeCache::new();
        cache.insert(4, Inode::new(FileType::Regular));
        let mut clean = Inode::new(FileType::Directory);
        clean.dirty = false;
        cache.insert(2, clean);
        cache.insert(3, Inode::new(FileType::Regular));

        assert!(cache.has_dirty());
        assert_eq!(cache.dirty(), vec![3, 4]);

        cache.get_mut(3).unwrap().dirty = false;
        cache.remove(4);
        assert!(!cache.has_dirty());
    }

    #[test]
    fn test_allocator_never_hands_out_root() {
        let mut allocator = InodeAllocator::after(0);
        assert_eq!(allocator.allocate(), 2);
        assert_eq!(allocator.allocate(), 3);

        let allocator = InodeAllocator::after(57);
        assert_eq!(allocator.peek(), 58);
    }
}
