//! Shared, periodically flushed volume
//!
//! [`LfsVolume`] wraps an [`Lfs`] engine in a mutex so the facade can be
//! called from any task, and runs a background task that flushes it every
//! `flush_interval_ms`. Foreground calls and the periodic flush are
//! serialized by the same lock.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::blockdev::BlockDevice;
use crate::config::LfsConfig;
use crate::error::Result;
use crate::fs::Lfs;
use crate::layout::FileType;

/// Requests for the background flush task
#[derive(Debug)]
pub enum FlushTask {
    /// Flush as soon as the engine lock is free
    Flush,
    /// Stop the task
    Shutdown,
}

/// Mounted volume with a background flusher
pub struct LfsVolume {
    fs: Arc<Mutex<Lfs>>,
    task_sender: Option<mpsc::UnboundedSender<FlushTask>>,
    task: Option<JoinHandle<()>>,
}

impl LfsVolume {
    /// Mount `device`.
    ///
    /// An unformatted device is formatted if `config.format_if_unformatted`
    /// is set and reported as `Ok(None)` otherwise. Must be called from
    /// within a tokio runtime.
    pub async fn mount(device: Arc<dyn BlockDevice>, config: LfsConfig) -> Result<Option<Self>> {
        let fs = match Lfs::mount(device.clone(), config.clone()).await? {
            Some(fs) => fs,
            None if config.format_if_unformatted => Lfs::format(device, config).await?,
            None => return Ok(None),
        };
        Ok(Some(Self::start(fs)))
    }

    /// Format `device` and mount the empty volume
    pub async fn format(device: Arc<dyn BlockDevice>, config: LfsConfig) -> Result<Self> {
        let fs = Lfs::format(device, config).await?;
        Ok(Self::start(fs))
    }

    /// Take ownership of a mounted engine and start its flush task
    pub fn start(fs: Lfs) -> Self {
        let period = fs.config().flush_interval();
        let fs = Arc::new(Mutex::new(fs));
        let (sender, receiver) = mpsc::unbounded_channel();
        let task = spawn_flusher(fs.clone(), period, receiver);

        Self {
            fs,
            task_sender: Some(sender),
            task: Some(task),
        }
    }

    /// Ask the background task to flush without waiting for it
    pub fn request_flush(&self) {
        if let Some(sender) = &self.task_sender {
            if sender.send(FlushTask::Flush).is_err() {
                log::warn!("flush task is gone, request dropped");
            }
        }
    }

    /// Flush now; returns false if there was nothing to write
    pub async fn flush(&self) -> Result<bool> {
        self.fs.lock().await.flush().await
    }

    /// See [`Lfs::create_node`]
    pub async fn create_node(&self, path: &str, file_type: FileType) -> Result<bool> {
        self.fs.lock().await.create_node(path, file_type).await
    }

    /// See [`Lfs::delete_node`]
    pub async fn delete_node(&self, path: &str) -> Result<bool> {
        self.fs.lock().await.delete_node(path).await
    }

    /// See [`Lfs::read_data`]
    pub async fn read_data(&self, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.fs.lock().await.read_data(path, offset, len).await
    }

    /// See [`Lfs::write_data`]
    pub async fn write_data(&self, path: &str, offset: u64, data: &[u8]) -> Result<u64> {
        self.fs.lock().await.write_data(path, offset, data).await
    }

    /// See [`Lfs::get_file_type`]
    pub async fn get_file_type(&self, path: &str) -> Result<Option<FileType>> {
        self.fs.lock().await.get_file_type(path).await
    }

    /// See [`Lfs::get_length`]
    pub async fn get_length(&self, path: &str) -> Result<u64> {
        self.fs.lock().await.get_length(path).await
    }

    /// See [`Lfs::get_children`]
    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.fs.lock().await.get_children(path).await
    }

    /// See [`Lfs::lookup`]
    pub async fn lookup(&self, path: &str) -> Result<u64> {
        self.fs.lock().await.lookup(path).await
    }

    /// See [`Lfs::reset`]
    pub async fn reset(&self) -> Result<()> {
        self.fs.lock().await.reset().await
    }

    /// Index of the segment being staged
    pub async fn current_segment(&self) -> u64 {
        self.fs.lock().await.current_segment()
    }

    /// Stop the flush task, then flush whatever is left
    pub async fn unmount(mut self) -> Result<()> {
        self.stop_flusher().await;
        let mut fs = self.fs.lock().await;
        fs.flush().await?;
        log::info!("unmounted volume at segment {}", fs.current_segment());
        Ok(())
    }

    async fn stop_flusher(&mut self) {
        if let Some(sender) = self.task_sender.take() {
            let _ = sender.send(FlushTask::Shutdown);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("flush task failed: {}", e);
            }
        }
    }
}

impl Drop for LfsVolume {
    fn drop(&mut self) {
        let Some(sender) = self.task_sender.take() else {
            return;
        };
        let _ = sender.send(FlushTask::Shutdown);

        // Best effort: errors can only be logged from here
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                log::warn!("volume dropped without unmount, flushing in the background");
                let fs = self.fs.clone();
                handle.spawn(async move {
                    if let Err(e) = fs.lock().await.flush().await {
                        log::error!("final flush of dropped volume failed: {}", e);
                    }
                });
            }
            Err(_) => {
                log::warn!("volume dropped outside a runtime, unflushed changes are lost");
            }
        }
    }
}

fn spawn_flusher(
    fs: Arc<Mutex<Lfs>>,
    period: Duration,
    mut receiver: mpsc::UnboundedReceiver<FlushTask>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            let task = tokio::select! {
                _ = ticker.tick() => FlushTask::Flush,
                task = receiver.recv() => task.unwrap_or(FlushTask::Shutdown),
            };

            match task {
                FlushTask::Flush => {
                    let mut fs = fs.lock().await;
                    match fs.flush().await {
                        Ok(true) => log::debug!("background flush done"),
                        Ok(false) => {}
                        Err(e) => log::error!("background flush failed: {}", e),
                    }
                }
                FlushTask::Shutdown => {
                    log::debug!("stopping flush task");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::MemoryBlockDevice;

    const TEN_MIB: usize = 10 * 1024 * 1024;

    fn config(flush_interval_ms: u64) -> LfsConfig {
        LfsConfig {
            flush_interval_ms,
            ..LfsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_unformatted_device() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        assert!(LfsVolume::mount(device.clone(), config(60_000))
            .await
            .unwrap()
            .is_none());

        let formatting = LfsConfig {
            format_if_unformatted: true,
            ..config(60_000)
        };
        let volume = LfsVolume::mount(device.clone(), formatting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(volume.get_children("/").await.unwrap(), vec![".", ".."]);
        volume.unmount().await.unwrap();

        assert!(Lfs::is_formatted(device).await.unwrap());
    }

    #[tokio::test]
    async fn test_background_flush_persists() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let volume = LfsVolume::format(device.clone(), config(20)).await.unwrap();
        volume.create_node("/log", FileType::Regular).await.unwrap();
        volume.write_data("/log", 0, b"tick").await.unwrap();

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if volume.current_segment().await > 1 {
                flushed = true;
                break;
            }
        }
        assert!(flushed, "background task never flushed");

        // read the device without unmounting
        let mut fs = Lfs::mount(device, LfsConfig::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fs.read_data("/log", 0, 4).await.unwrap(), b"tick");
        drop(volume);
    }

    #[tokio::test]
    async fn test_requested_flush() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let volume = LfsVolume::format(device, config(60_000)).await.unwrap();
        volume.create_node("/a", FileType::Directory).await.unwrap();
        volume.request_flush();

        let mut flushed = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if volume.current_segment().await == 2 {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        volume.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_unmount_flushes() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let volume = LfsVolume::format(device.clone(), config(60_000)).await.unwrap();
        volume.create_node("/etc", FileType::Directory).await.unwrap();
        volume.create_node("/etc/hosts", FileType::Regular).await.unwrap();
        volume.write_data("/etc/hosts", 0, b"127.0.0.1 localhost\n").await.unwrap();
        volume.unmount().await.unwrap();

        let volume = LfsVolume::mount(device, config(60_000)).await.unwrap().unwrap();
        assert_eq!(volume.get_length("/etc/hosts").await.unwrap(), 20);
        assert_eq!(volume.get_children("/etc").await.unwrap(), vec![".", "..", "hosts"]);
        volume.unmount().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_flushes_in_background() {
        let device = Arc::new(MemoryBlockDevice::new(TEN_MIB));
        let volume = LfsVolume::format(device.clone(), config(60_000)).await.unwrap();
        volume.create_node("/tmp", FileType::Directory).await.unwrap();
        drop(volume);

        let mut visible = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut fs = Lfs::mount(device.clone(), LfsConfig::default())
                .await
                .unwrap()
                .unwrap();
            if fs.get_file_type("/tmp").await.unwrap() == Some(FileType::Directory) {
                visible = true;
                break;
            }
        }
        assert!(visible, "dropped volume was never flushed");
    }
}
