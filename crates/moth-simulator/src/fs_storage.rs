use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use log::{debug, error};

use moth_core::storage::{FileName, Storage, StorageError};

/// Recordings written to a host directory under their long names
pub struct FsStorage {
    dir: PathBuf,
    file: Option<File>,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            file: None,
        }
    }

    fn file(&mut self) -> Result<&mut File, StorageError> {
        self.file.as_mut().ok_or(StorageError::NotOpen)
    }
}

impl Storage for FsStorage {
    fn open(&mut self, name: &FileName) -> Result<(), StorageError> {
        let path = self.dir.join(name.long().as_str());

        let file = std::fs::create_dir_all(&self.dir)
            .and_then(|_| File::create(&path))
            .map_err(|e| {
                error!("Failed to create {}: {}", path.display(), e);
                StorageError::Open
            })?;

        debug!("Opened {}", path.display());
        self.file = Some(file);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file()?.write_all(data).map_err(|e| {
            error!("Write of {} bytes failed: {}", data.len(), e);
            StorageError::Write
        })
    }

    fn seek(&mut self, offset: u32) -> Result<(), StorageError> {
        self.file()?
            .seek(SeekFrom::Start(offset as u64))
            .map(|_| ())
            .map_err(|e| {
                error!("Seek to {} failed: {}", offset, e);
                StorageError::Seek
            })
    }

    fn close(&mut self) -> Result<(), StorageError> {
        let file = self.file.take().ok_or(StorageError::NotOpen)?;

        file.sync_all().map_err(|e| {
            error!("Failed to flush recording: {}", e);
            StorageError::Close
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_rewritten_in_place() {
        let dir = std::env::temp_dir().join(format!("moth-sim-{}", std::process::id()));
        let mut storage = FsStorage::new(&dir);
        let name = FileName::new(1_700_000_000, false);

        storage.open(&name).unwrap();
        storage.write(&[0; 4]).unwrap();
        storage.write(b"data").unwrap();
        storage.seek(0).unwrap();
        storage.write(b"RIFF").unwrap();
        storage.close().unwrap();

        let path = dir.join("20231114_221320.WAV");
        assert_eq!(std::fs::read(&path).unwrap(), b"RIFFdata");
        assert_eq!(storage.write(b"late"), Err(StorageError::NotOpen));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
