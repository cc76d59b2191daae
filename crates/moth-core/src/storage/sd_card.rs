use embedded_sdmmc::{
    BlockDevice, Mode, RawDirectory, RawFile, RawVolume, SdCard, TimeSource, VolumeIdx,
    VolumeManager,
};
use log::{debug, error, warn};

use super::{FileName, Storage, StorageError};

struct OpenFile {
    volume: RawVolume,
    dir: RawDirectory,
    file: RawFile,
}

/// Recordings on the first FAT volume of a block device, normally an SPI SD
/// card.
///
/// The file stays open for the whole session, so the volume manager's raw
/// handles are kept instead of the borrowing `Volume`/`Directory`/`File`
/// wrappers. Files use the 8.3 name from [`FileName::short`].
pub struct SdCardStorage<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    volume_mgr: VolumeManager<B, T, 4, 4, 1>,
    open: Option<OpenFile>,
}

impl<S, D, T> SdCardStorage<SdCard<S, D>, T>
where
    S: embedded_hal::spi::SpiDevice<u8>,
    D: embedded_hal::delay::DelayNs,
    T: TimeSource,
{
    /// Storage on an SD card attached to `spi`
    pub fn spi(spi: S, delay: D, ts: T) -> Self {
        Self::new(SdCard::new(spi, delay), ts)
    }
}

impl<B, T> SdCardStorage<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    /// Create a new storage backend on `block_device`
    pub fn new(block_device: B, ts: T) -> Self {
        let volume_mgr = VolumeManager::new(block_device, ts);

        Self {
            volume_mgr,
            open: None,
        }
    }

    fn open_handles(&self, name: &str) -> Result<OpenFile, StorageError> {
        let volume = self
            .volume_mgr
            .open_raw_volume(VolumeIdx(0))
            .map_err(|e| {
                error!("Failed to open SD card volume: {:?}", e);
                StorageError::Open
            })?;

        let dir = match self.volume_mgr.open_root_dir(volume) {
            Ok(dir) => dir,
            Err(e) => {
                error!("Failed to open root directory: {:?}", e);
                let _ = self.volume_mgr.close_volume(volume);
                return Err(StorageError::Open);
            }
        };

        let file = match self
            .volume_mgr
            .open_file_in_dir(dir, name, Mode::ReadWriteCreateOrTruncate)
        {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to create {}: {:?}", name, e);
                let _ = self.volume_mgr.close_dir(dir);
                let _ = self.volume_mgr.close_volume(volume);
                return Err(StorageError::Open);
            }
        };

        Ok(OpenFile { volume, dir, file })
    }
}

impl<B, T> Storage for SdCardStorage<B, T>
where
    B: BlockDevice,
    T: TimeSource,
{
    fn open(&mut self, name: &FileName) -> Result<(), StorageError> {
        // A session that failed mid-write leaves its file open
        if let Some(stale) = self.open.take() {
            warn!("Dropping handles of an unfinished recording");
            let _ = self.volume_mgr.close_file(stale.file);
            let _ = self.volume_mgr.close_dir(stale.dir);
            let _ = self.volume_mgr.close_volume(stale.volume);
        }

        let short = name.short();
        let handles = self.open_handles(short.as_str())?;
        debug!("Opened {} on SD card", short);
        self.open = Some(handles);

        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        let handles = self.open.as_ref().ok_or(StorageError::NotOpen)?;

        self.volume_mgr.write(handles.file, data).map_err(|e| {
            error!("SD card write of {} bytes failed: {:?}", data.len(), e);
            StorageError::Write
        })
    }

    fn seek(&mut self, offset: u32) -> Result<(), StorageError> {
        let handles = self.open.as_ref().ok_or(StorageError::NotOpen)?;

        self.volume_mgr
            .file_seek_from_start(handles.file, offset)
            .map_err(|e| {
                error!("SD card seek to {} failed: {:?}", offset, e);
                StorageError::Seek
            })
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let handles = self.open.take().ok_or(StorageError::NotOpen)?;

        // Close all three handles even if one fails, report the first failure
        let file = self.volume_mgr.close_file(handles.file);
        let dir = self.volume_mgr.close_dir(handles.dir);
        let volume = self.volume_mgr.close_volume(handles.volume);

        file.and(dir).and(volume).map_err(|e| {
            error!("Failed to close SD card file: {:?}", e);
            StorageError::Close
        })
    }
}
