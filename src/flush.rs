//! Checkpointing
//!
//! A flush makes everything staged so far durable and reachable:
//!
//! 1. dirty inodes are packed into fresh blocks, 39 to a block, and their
//!    new positions recorded in the inode map
//! 2. the whole inode map is written as one contiguous run of blocks,
//!    rolling over into the next segment if the current one fills up
//! 3. the segment is committed
//! 4. the superblock is rewritten to point at the new map
//!
//! Until step 4 completes the previous superblock still describes a
//! consistent volume.

use arrayref::array_mut_ref;

use crate::error::Result;
use crate::fs::Lfs;
use crate::layout::{InodeMapEntry, Superblock, BLOCK_SIZE, INODE_SIZE, SUPERBLOCK_BLOCK};

impl Lfs {
    /// True if a flush would write anything
    pub fn needs_flush(&self) -> bool {
        self.dirty || self.inodes.has_dirty() || !self.segment.is_empty()
    }

    /// Commit the current segment if it has no free block left
    async fn roll_segment_if_full(&mut self) -> Result<()> {
        if self.segment.remaining() == 0 {
            self.segment.commit(&self.io).await?;
        }
        Ok(())
    }

    /// Pack all dirty inodes into staged blocks and remap them
    async fn write_dirty_inodes(&mut self) -> Result<usize> {
        let dirty = self.inodes.dirty();
        let mut block = vec![0u8; BLOCK_SIZE];
        let mut used = 0usize;
        let mut position = None;

        for &number in &dirty {
            let target = match position {
                Some(current) if used + INODE_SIZE <= BLOCK_SIZE => current,
                previous => {
                    if previous.is_some() {
                        self.stage_block(&block)?;
                        block.fill(0);
                        used = 0;
                    }
                    self.roll_segment_if_full().await?;
                    let next = self.segment.next_block();
                    position = Some(next);
                    next
                }
            };

            if let Some(inode) = self.inodes.get_mut(number) {
                inode.encode(array_mut_ref![block, used, INODE_SIZE]);
                inode.dirty = false;
            }
            self.inode_map.insert(InodeMapEntry {
                inode: number,
                block: target,
                offset: used as u32,
            });
            used += INODE_SIZE;
        }

        if position.is_some() {
            self.stage_block(&block)?;
        }
        Ok(dirty.len())
    }

    /// Write all dirty state to the device.
    ///
    /// Returns false if there was nothing to write. A failed flush leaves the
    /// engine flagged dirty so a later call retries.
    pub async fn flush(&mut self) -> Result<bool> {
        if !self.needs_flush() {
            return Ok(false);
        }
        self.dirty = true;

        let inodes = self.write_dirty_inodes().await?;

        let map = self.inode_map.to_blocks();
        self.roll_segment_if_full().await?;
        let map_position = self.segment.next_block();
        for chunk in map.chunks(BLOCK_SIZE) {
            self.roll_segment_if_full().await?;
            self.stage_block(chunk)?;
        }

        self.segment.commit(&self.io).await?;

        let superblock = Superblock {
            inode_map_position: map_position,
            inode_map_size: (map.len() / BLOCK_SIZE) as u64,
            current_segment: self.segment.index(),
            ..Superblock::new()
        };
        self.io
            .write_blocks(SUPERBLOCK_BLOCK, &superblock.to_block())
            .await?;
        self.io.sync().await?;
        self.superblock = superblock;
        self.dirty = false;

        log::debug!(
            "flushed {} inodes, inode map at {} ({} blocks), next segment {}",
            inodes,
            map_position,
            superblock.inode_map_size,
            superblock.current_segment
        );
        Ok(true)
    }
}
