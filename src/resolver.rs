//! Block indirection
//!
//! File block `index` maps to a device block through three tiers:
//!
//! ```text
//! index < 10             direct[index]
//! index < 10 + 512       indirect -> [index - 10]
//! otherwise              double_indirect -> [n / 512] -> [n % 512],  n = index - 522
//! ```
//!
//! Writes never touch a block in place. The data block and every pointer
//! block on its path are staged as new blocks and the inode is redirected to
//! the new top-level pointer.

use crate::codec::{get_u64, put_u64};
use crate::error::{LfsError, Result};
use crate::fs::Lfs;
use crate::layout::{
    BlockPtr, Inode, BLOCK_SIZE, DOUBLE_INDIRECT_START, MAX_FILE_BLOCKS, POINTERS_PER_BLOCK,
    SINGLE_INDIRECT_START,
};

/// Blocks a single file block write may stage: data plus two pointer blocks
const MAX_BLOCKS_PER_WRITE: usize = 3;

fn pointer_at(table: &[u8], slot: u64) -> BlockPtr {
    BlockPtr::new(get_u64(table, slot as usize * 8))
}

fn set_pointer(table: &mut [u8], slot: u64, block: BlockPtr) {
    put_u64(table, slot as usize * 8, block.get());
}

impl Lfs {
    /// Read one block by device address, serving blocks of the segment under
    /// construction from the staging buffer.
    pub(crate) async fn read_block(&mut self, block: BlockPtr) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        if let Some(staged) = self.segment.staged(block) {
            buf.copy_from_slice(staged);
            return Ok(buf);
        }

        self.blocks.read_block(&self.io, block, &mut buf).await?;
        Ok(buf)
    }

    /// Pointer table at `block`, or an all-null table if unallocated
    async fn read_pointer_table(&mut self, block: BlockPtr) -> Result<Vec<u8>> {
        if block.is_null() {
            Ok(vec![0u8; BLOCK_SIZE])
        } else {
            self.read_block(block).await
        }
    }

    /// Stage a block in the current segment
    pub(crate) fn stage_block(&mut self, data: &[u8]) -> Result<BlockPtr> {
        self.segment.append(data, self.io.block_count())
    }

    /// Flush first if the segment cannot take `blocks` more blocks
    async fn ensure_room(&mut self, blocks: usize) -> Result<()> {
        if self.segment.remaining() < blocks {
            log::debug!(
                "segment {} is full, flushing before next write",
                self.segment.index()
            );
            self.flush().await?;
        }
        Ok(())
    }

    /// Device address holding file block `index`, or null if never written
    pub async fn resolve_block(&mut self, inode: &Inode, index: u64) -> Result<BlockPtr> {
        if index >= MAX_FILE_BLOCKS {
            return Err(LfsError::FileTooLarge(index));
        }

        let block = if index < SINGLE_INDIRECT_START {
            inode.direct[index as usize]
        } else if index < DOUBLE_INDIRECT_START {
            if inode.indirect.is_null() {
                return Ok(BlockPtr::NULL);
            }
            let table = self.read_block(inode.indirect).await?;
            pointer_at(&table, index - SINGLE_INDIRECT_START)
        } else {
            if inode.double_indirect.is_null() {
                return Ok(BlockPtr::NULL);
            }
            let n = index - DOUBLE_INDIRECT_START;
            let outer = self.read_block(inode.double_indirect).await?;
            let inner_block = pointer_at(&outer, n / POINTERS_PER_BLOCK);
            if inner_block.is_null() {
                return Ok(BlockPtr::NULL);
            }
            let inner = self.read_block(inner_block).await?;
            pointer_at(&inner, n % POINTERS_PER_BLOCK)
        };

        log::trace!("file block {} -> {}", index, block);
        Ok(block)
    }

    /// Contents of file block `index`; unwritten blocks read as zeros
    pub async fn read_block_of_file(&mut self, inode: &Inode, index: u64) -> Result<Vec<u8>> {
        let block = self.resolve_block(inode, index).await?;
        if block.is_null() {
            return Ok(vec![0u8; BLOCK_SIZE]);
        }
        self.read_block(block).await
    }

    /// Stage `data` as the new file block `index` and redirect `inode` to it.
    ///
    /// Flushes beforehand if the current segment cannot hold the data block
    /// and the rewritten pointer blocks.
    pub async fn write_block_of_file(
        &mut self,
        inode: &mut Inode,
        index: u64,
        data: &[u8],
    ) -> Result<()> {
        if index >= MAX_FILE_BLOCKS {
            return Err(LfsError::FileTooLarge(index));
        }
        self.ensure_room(MAX_BLOCKS_PER_WRITE).await?;

        if index < SINGLE_INDIRECT_START {
            inode.direct[index as usize] = self.stage_block(data)?;
        } else if index < DOUBLE_INDIRECT_START {
            let mut table = self.read_pointer_table(inode.indirect).await?;
            let block = self.stage_block(data)?;
            set_pointer(&mut table, index - SINGLE_INDIRECT_START, block);
            inode.indirect = self.stage_block(&table)?;
        } else {
            let n = index - DOUBLE_INDIRECT_START;
            let (outer_slot, inner_slot) = (n / POINTERS_PER_BLOCK, n % POINTERS_PER_BLOCK);

            let mut outer = self.read_pointer_table(inode.double_indirect).await?;
            let mut inner = self
                .read_pointer_table(pointer_at(&outer, outer_slot))
                .await?;

            let block = self.stage_block(data)?;
            set_pointer(&mut inner, inner_slot, block);
            let inner_block = self.stage_block(&inner)?;
            set_pointer(&mut outer, outer_slot, inner_block);
            inode.double_indirect = self.stage_block(&outer)?;
        }

        inode.dirty = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;
    use crate::config::LfsConfig;
    use crate::layout::FileType;
    use std::sync::Arc;

    const TEN_MIB: usize = 10 * 1024 * 1024;

    fn pattern(index: u64) -> Vec<u8> {
        (0..BLOCK_SIZE)
            .map(|i| (i as u64).wrapping_mul(31).wrapping_add(index) as u8)
            .collect()
    }

    async fn fresh_fs(device: Arc<MemoryBlockDevice>) -> Lfs {
        Lfs::format(device, LfsConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn test_tiers_are_selected_by_index() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let mut fs = fresh_fs(device).await;
        let mut inode = Inode::new(FileType::Regular);

        fs.write_block_of_file(&mut inode, 9, &pattern(9)).await.unwrap();
        assert!(!inode.direct[9].is_null());
        assert!(inode.indirect.is_null());

        fs.write_block_of_file(&mut inode, 10, &pattern(10)).await.unwrap();
        assert!(!inode.indirect.is_null());
        assert!(inode.double_indirect.is_null());

        let first_table = inode.indirect;
        fs.write_block_of_file(&mut inode, 11, &pattern(11)).await.unwrap();
        // the pointer block was rewritten, not patched in place
        assert_ne!(inode.indirect, first_table);

        fs.write_block_of_file(&mut inode, 521, &pattern(521)).await.unwrap();
        assert!(inode.double_indirect.is_null());

        fs.write_block_of_file(&mut inode, 522, &pattern(522)).await.unwrap();
        assert!(!inode.double_indirect.is_null());
    }

    #[tokio::test]
    async fn test_boundary_indices_read_back() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let mut fs = fresh_fs(device).await;
        let mut inode = Inode::new(FileType::Regular);
        let indices = [0u64, 9, 10, 521, 522, 100_000];

        for &index in &indices {
            fs.write_block_of_file(&mut inode, index, &pattern(index)).await.unwrap();
        }
        for &index in &indices {
            assert_eq!(fs.read_block_of_file(&inode, index).await.unwrap(), pattern(index));
        }

        // unwritten blocks on every tier read as zeros
        for index in [1u64, 11, 523, 99_999] {
            let block = fs.read_block_of_file(&inode, index).await.unwrap();
            assert!(block.iter().all(|&b| b == 0), "block {} not empty", index);
        }
    }

    #[tokio::test]
    async fn test_reads_survive_commit() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let mut fs = fresh_fs(device).await;
        let mut inode = Inode::new(FileType::Regular);

        fs.write_block_of_file(&mut inode, 600, &pattern(600)).await.unwrap();
        let staged = fs.resolve_block(&inode, 600).await.unwrap();
        assert!(fs.segment.contains(staged));

        fs.flush().await.unwrap();
        assert!(!fs.segment.contains(staged));
        assert_eq!(fs.read_block_of_file(&inode, 600).await.unwrap(), pattern(600));
    }

    #[tokio::test]
    async fn test_index_beyond_double_indirect() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let mut fs = fresh_fs(device).await;
        let mut inode = Inode::new(FileType::Regular);

        let result = fs
            .write_block_of_file(&mut inode, MAX_FILE_BLOCKS, &pattern(0))
            .await;
        assert!(matches!(result, Err(LfsError::FileTooLarge(_))));
    }

    #[tokio::test]
    async fn test_full_segment_triggers_flush() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let mut fs = fresh_fs(device).await;
        let segment = fs.segment.index();
        let mut inode = Inode::new(FileType::Regular);

        for index in 0..300u64 {
            fs.write_block_of_file(&mut inode, index, &pattern(index)).await.unwrap();
        }
        assert!(fs.segment.index() > segment);
        assert_eq!(fs.read_block_of_file(&inode, 5).await.unwrap(), pattern(5));
        assert_eq!(fs.read_block_of_file(&inode, 299).await.unwrap(), pattern(299));
    }
}
