//! Read cache of committed blocks
//!
//! Once a segment reaches the device its blocks are never written again, so a
//! cached copy stays valid for the lifetime of the mount and the cache needs
//! no write path and no invalidation short of a reformat.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::blockdev::BlockIo;
use crate::error::Result;
use crate::layout::{BlockPtr, BLOCK_SIZE};

/// LRU cache in front of a [`BlockIo`]
pub struct BlockCache {
    cache: LruCache<BlockPtr, Box<[u8; BLOCK_SIZE]>>,
    hits: u64,
    misses: u64,
}

impl BlockCache {
    /// Create a cache holding up to `capacity` blocks (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Read a committed block, going to the device on a miss
    pub async fn read_block(&mut self, io: &BlockIo, block: BlockPtr, buf: &mut [u8]) -> Result<()> {
        if let Some(cached) = self.cache.get(&block) {
            buf.copy_from_slice(&cached[..]);
            self.hits += 1;
            return Ok(());
        }

        io.read_block(block, buf).await?;
        self.misses += 1;

        let mut cached = Box::new([0u8; BLOCK_SIZE]);
        cached.copy_from_slice(buf);
        self.cache.put(block, cached);
        Ok(())
    }

    /// Drop every cached block
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of blocks currently cached
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
