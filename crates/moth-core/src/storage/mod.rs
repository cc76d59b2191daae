//! Recording file storage
//!
//! A session writes exactly one file through the [`Storage`] trait: a header
//! placeholder, audio interleaved with silence markers, the trailing metadata
//! chunk, then a seek back to offset 0 and the final header. Backends log the
//! low-level cause of a failure and report a [`StorageError`]; the session
//! aborts on the first one.

pub mod sd_card;

use core::fmt::Write;

use heapless::String;
use thiserror_no_std::Error;

use crate::time::CivilTime;

/// Failed storage operation
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open recording file")]
    Open,

    #[error("Failed to write recording file")]
    Write,

    #[error("Failed to seek in recording file")]
    Seek,

    #[error("Failed to close recording file")]
    Close,

    #[error("No recording file is open")]
    NotOpen,
}

/// Sequential file sink with a single rewind for the header
pub trait Storage {
    /// Creates (or truncates) the file and makes it current
    fn open(&mut self, name: &FileName) -> Result<(), StorageError>;

    /// Appends to the current file
    fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Moves the write position to `offset` bytes from the start
    fn seek(&mut self, offset: u32) -> Result<(), StorageError>;

    fn close(&mut self) -> Result<(), StorageError>;
}

impl<S: Storage> Storage for &mut S {
    fn open(&mut self, name: &FileName) -> Result<(), StorageError> {
        (**self).open(name)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        (**self).write(data)
    }

    fn seek(&mut self, offset: u32) -> Result<(), StorageError> {
        (**self).seek(offset)
    }

    fn close(&mut self) -> Result<(), StorageError> {
        (**self).close()
    }
}

/// Name of a recording, derived from its local start time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileName {
    local_time: i64,
    thresholded: bool,
}

impl FileName {
    /// `thresholded` marks recordings made with an amplitude threshold
    pub const fn new(local_time: i64, thresholded: bool) -> Self {
        Self {
            local_time,
            thresholded,
        }
    }

    pub const fn local_time(&self) -> i64 {
        self.local_time
    }

    /// `YYYYMMDD_HHMMSS.WAV`, or `YYYYMMDD_HHMMSST.WAV` when thresholded
    pub fn long(&self) -> String<24> {
        let time = CivilTime::from_timestamp(self.local_time);
        let mut name = String::new();
        // 20 characters at most, always fits
        let _ = write!(
            name,
            "{:04}{:02}{:02}_{:02}{:02}{:02}{}.WAV",
            time.year,
            time.month,
            time.day,
            time.hour,
            time.minute,
            time.second,
            if self.thresholded { "T" } else { "" }
        );
        name
    }

    /// 8.3 name for FAT volumes without long file name support
    pub fn short(&self) -> String<12> {
        let mut name = String::new();
        let _ = write!(name, "{:08X}.WAV", self.local_time as u32);
        name
    }
}
