//! Block device I/O for segfs
//!
//! The file system addresses storage in 4 KiB blocks while devices speak in
//! sectors; [`BlockIo`] bridges the two. Two devices ship with the crate: a
//! file-backed one for images and raw disks, and an in-memory RAM disk.

mod blockdev_trait;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

use crate::error::LfsError;
use crate::layout::{BlockPtr, BLOCK_SIZE};

// Re-export the block device trait and related types
pub use self::blockdev_trait::{BlockDevice, BlockDeviceError, Result};
use self::blockdev_trait::check_transfer;

/// Sector size used by the devices shipped with this crate
pub const DEFAULT_SECTOR_SIZE: usize = 512;

/// A block device that is backed by a file on the filesystem
#[derive(Debug)]
pub struct FileBackedBlockDevice {
    file: Mutex<Option<File>>,
    path: PathBuf,
    size: u64,
    sector_count: u64,
    read_only: bool,
}

impl FileBackedBlockDevice {
    /// Create a new file-backed block device of `size` bytes, truncating any existing file
    pub async fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;

        file.set_len(size).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            sector_count: size / DEFAULT_SECTOR_SIZE as u64,
            read_only: false,
        })
    }

    /// Open an existing image file or raw block device
    pub async fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)
            .await?;

        let size = Self::device_size(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            size,
            sector_count: size / DEFAULT_SECTOR_SIZE as u64,
            read_only,
        })
    }

    /// Size in bytes of a regular file or block device
    #[cfg(unix)]
    fn device_size(path: &Path) -> Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let metadata = std::fs::metadata(path)?;
        if !metadata.file_type().is_block_device() {
            return Ok(metadata.len());
        }

        let file = std::fs::File::open(path)?;

        // BLKGETSIZE64 on Linux
        const BLKGETSIZE64: libc::c_ulong = 0x80081272;

        let mut size: u64 = 0;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size as *mut u64) };
        if result == -1 {
            return Err(BlockDeviceError::Io(std::io::Error::last_os_error()));
        }

        Ok(size)
    }

    #[cfg(not(unix))]
    fn device_size(path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the total size of the device in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Release the underlying file handle
    pub async fn close(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;
        if file_guard.take().is_some() {
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }
}

#[async_trait]
impl BlockDevice for FileBackedBlockDevice {
    async fn read_sectors(&self, buf: &mut [u8], start_sector: u64, sector_count: u64) -> Result<()> {
        check_transfer(self, buf.len(), start_sector, sector_count)?;

        let offset = start_sector * DEFAULT_SECTOR_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(buf).await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    async fn write_sectors(&self, buf: &[u8], start_sector: u64, sector_count: u64) -> Result<()> {
        if self.read_only {
            return Err(BlockDeviceError::ReadOnly);
        }
        check_transfer(self, buf.len(), start_sector, sector_count)?;

        let offset = start_sector * DEFAULT_SECTOR_SIZE as u64;
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(buf).await?;
            file.flush().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn sector_size(&self) -> usize {
        DEFAULT_SECTOR_SIZE
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }

    async fn sync(&self) -> Result<()> {
        let mut file_guard = self.file.lock().await;

        if let Some(file) = &mut *file_guard {
            file.sync_all().await?;
            Ok(())
        } else {
            Err(BlockDeviceError::DeviceClosed)
        }
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// RAM disk
#[derive(Debug)]
pub struct MemoryBlockDevice {
    data: RwLock<Vec<u8>>,
    sector_size: usize,
}

impl MemoryBlockDevice {
    /// Create a zero-filled RAM disk of `size` bytes with 512-byte sectors
    pub fn new(size: usize) -> Self {
        Self::with_sector_size(size, DEFAULT_SECTOR_SIZE)
    }

    /// Create a zero-filled RAM disk with a custom sector size
    pub fn with_sector_size(size: usize, sector_size: usize) -> Self {
        Self {
            data: RwLock::new(vec![0u8; size - size % sector_size]),
            sector_size,
        }
    }

    /// Copy of the whole device contents
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

#[async_trait]
impl BlockDevice for MemoryBlockDevice {
    async fn read_sectors(&self, buf: &mut [u8], start_sector: u64, sector_count: u64) -> Result<()> {
        check_transfer(self, buf.len(), start_sector, sector_count)?;

        let start = start_sector as usize * self.sector_size;
        let data = self.data.read();
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_sectors(&self, buf: &[u8], start_sector: u64, sector_count: u64) -> Result<()> {
        check_transfer(self, buf.len(), start_sector, sector_count)?;

        let start = start_sector as usize * self.sector_size;
        let mut data = self.data.write();
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        (self.data.read().len() / self.sector_size) as u64
    }
}

/// Block-granular view of a sector device.
///
/// Block addresses are volume-relative: block 0 holds the superblock.
#[derive(Clone)]
pub struct BlockIo {
    device: Arc<dyn BlockDevice>,
    sectors_per_block: u64,
    block_count: u64,
}

impl BlockIo {
    /// Wrap a device whose sector size evenly divides the block size
    pub fn new(device: Arc<dyn BlockDevice>) -> crate::error::Result<Self> {
        let sector_size = device.sector_size();
        if sector_size == 0 || sector_size > BLOCK_SIZE || BLOCK_SIZE % sector_size != 0 {
            return Err(LfsError::InvalidSectorSize(sector_size));
        }

        let sectors_per_block = (BLOCK_SIZE / sector_size) as u64;
        let block_count = device.sector_count() / sectors_per_block;

        Ok(Self {
            device,
            sectors_per_block,
            block_count,
        })
    }

    /// Number of whole blocks on the device
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Device sectors per file system block
    pub fn sectors_per_block(&self) -> u64 {
        self.sectors_per_block
    }

    /// Read one block
    pub async fn read_block(&self, block: BlockPtr, buf: &mut [u8]) -> Result<()> {
        self.device
            .read_sectors(buf, block.get() * self.sectors_per_block, self.sectors_per_block)
            .await
    }

    /// Write `buf.len() / BLOCK_SIZE` consecutive blocks starting at `first`
    pub async fn write_blocks(&self, first: BlockPtr, buf: &[u8]) -> Result<()> {
        let blocks = (buf.len() / BLOCK_SIZE) as u64;
        self.device
            .write_sectors(
                buf,
                first.get() * self.sectors_per_block,
                blocks * self.sectors_per_block,
            )
            .await
    }

    /// Sync the underlying device
    pub async fn sync(&self) -> Result<()> {
        self.device.sync().await
    }
}
