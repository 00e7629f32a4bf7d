//! Segment staging buffer
//!
//! All writes land here first. The buffer mirrors the segment that will be
//! written next; a block staged at cursor `c` already owns its final address
//! `segment_start(index) + c`, so pointers to it can be handed out before the
//! segment reaches the device.

use crate::blockdev::BlockIo;
use crate::error::{LfsError, Result};
use crate::layout::{segment_start, BlockPtr, BLOCKS_PER_SEGMENT, BLOCK_SIZE, SEGMENT_SIZE};

/// Writer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Accepting new blocks
    Staging,
    /// Device write in progress; no allocation allowed
    Committing,
}

/// Append-only writer for the segment under construction
pub struct SegmentWriter {
    index: u64,
    buffer: Vec<u8>,
    cursor: usize,
    state: SegmentState,
}

impl SegmentWriter {
    /// Empty writer staging segment `index`
    pub fn new(index: u64) -> Self {
        Self {
            index,
            buffer: vec![0u8; SEGMENT_SIZE],
            cursor: 0,
            state: SegmentState::Staging,
        }
    }

    /// Index of the segment being staged
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Current state
    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Blocks staged so far
    pub fn staged_blocks(&self) -> usize {
        self.cursor
    }

    /// Blocks still free in this segment
    pub fn remaining(&self) -> usize {
        BLOCKS_PER_SEGMENT as usize - self.cursor
    }

    /// True if nothing has been staged
    pub fn is_empty(&self) -> bool {
        self.cursor == 0
    }

    /// Address the next appended block will receive
    pub fn next_block(&self) -> BlockPtr {
        segment_start(self.index).offset(self.cursor as u64)
    }

    /// True if `block` was staged in this segment and is not on the device yet
    pub fn contains(&self, block: BlockPtr) -> bool {
        let start = segment_start(self.index);
        block >= start && block.get() < start.get() + self.cursor as u64
    }

    /// Staged contents of `block`; `None` unless [`contains`](Self::contains) holds
    pub fn staged(&self, block: BlockPtr) -> Option<&[u8]> {
        if !self.contains(block) {
            return None;
        }
        let slot = (block.get() - segment_start(self.index).get()) as usize;
        Some(&self.buffer[slot * BLOCK_SIZE..(slot + 1) * BLOCK_SIZE])
    }

    /// Stage one block and return its address.
    ///
    /// `device_blocks` bounds the address space; a block that would land past
    /// the end of the device is refused with [`LfsError::NoSpace`].
    pub fn append(&mut self, data: &[u8], device_blocks: u64) -> Result<BlockPtr> {
        if self.state != SegmentState::Staging {
            return Err(LfsError::SegmentBusy);
        }
        if self.remaining() == 0 {
            return Err(LfsError::NoSpace);
        }

        let block = self.next_block();
        if block.get() >= device_blocks {
            return Err(LfsError::NoSpace);
        }

        let start = self.cursor * BLOCK_SIZE;
        let len = data.len().min(BLOCK_SIZE);
        self.buffer[start..start + len].copy_from_slice(&data[..len]);
        self.buffer[start + len..start + BLOCK_SIZE].fill(0);
        self.cursor += 1;

        log::trace!("staged block {} in segment {}", block, self.index);
        Ok(block)
    }

    /// Write the staged blocks to the device as one contiguous range and move
    /// on to the next segment.
    ///
    /// On failure the staged blocks are kept so the caller can retry.
    pub async fn commit(&mut self, io: &BlockIo) -> Result<()> {
        if self.cursor == 0 {
            return Ok(());
        }

        self.state = SegmentState::Committing;
        let start = segment_start(self.index);
        let result = io
            .write_blocks(start, &self.buffer[..self.cursor * BLOCK_SIZE])
            .await;
        self.state = SegmentState::Staging;
        result?;

        log::debug!(
            "committed segment {} ({} blocks at {})",
            self.index,
            self.cursor,
            start
        );

        self.index += 1;
        self.cursor = 0;
        Ok(())
    }

    /// Discard staged blocks and restart at segment `index`
    pub fn reset(&mut self, index: u64) {
        self.index = index;
        self.cursor = 0;
        self.state = SegmentState::Staging;
    }
}
