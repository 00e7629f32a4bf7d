//! Block device trait definitions for segfs

use std::io;
use thiserror::Error;

/// Error type for block device operations
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    /// The underlying file or device reported an error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transfer extends past the last sector
    #[error("Sector range {start}+{count} out of bounds (device has {total} sectors)")]
    OutOfRange {
        /// First sector of the transfer
        start: u64,
        /// Sectors requested
        count: u64,
        /// Sectors on the device
        total: u64,
    },

    /// Buffer length differs from `sector_count * sector_size`
    #[error("Buffer of {actual} bytes does not match transfer of {expected} bytes")]
    InvalidBufferSize {
        /// Bytes the transfer needs
        expected: usize,
        /// Bytes the buffer holds
        actual: usize,
    },

    /// Write attempted on a device opened read-only
    #[error("Device is read-only")]
    ReadOnly,

    /// The device handle has been released
    #[error("Device is already closed")]
    DeviceClosed,
}

/// Result type for block device operations
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// Sector-granular storage device consumed by the file system.
///
/// Every call completes the whole transfer before its future resolves; the
/// file system issues no queuing or retries of its own.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read `sector_count` sectors starting at `start_sector` into `buf`
    async fn read_sectors(&self, buf: &mut [u8], start_sector: u64, sector_count: u64) -> Result<()>;

    /// Write `sector_count` sectors from `buf` starting at `start_sector`
    async fn write_sectors(&self, buf: &[u8], start_sector: u64, sector_count: u64) -> Result<()>;

    /// Size of one sector in bytes
    fn sector_size(&self) -> usize;

    /// Total number of sectors on the device
    fn sector_count(&self) -> u64;

    /// Sync any pending writes to the device
    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    /// Check if the device is read-only
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Validate a sector transfer against the device geometry and buffer length.
pub(crate) fn check_transfer(
    device: &dyn BlockDevice,
    buf_len: usize,
    start_sector: u64,
    sector_count: u64,
) -> Result<()> {
    let total = device.sector_count();
    if start_sector.checked_add(sector_count).map_or(true, |end| end > total) {
        return Err(BlockDeviceError::OutOfRange {
            start: start_sector,
            count: sector_count,
            total,
        });
    }

    let expected = sector_count as usize * device.sector_size();
    if buf_len != expected {
        return Err(BlockDeviceError::InvalidBufferSize {
            expected,
            actual: buf_len,
        });
    }

    Ok(())
}
