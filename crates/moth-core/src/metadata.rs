//! Recording metadata seam
//!
//! The session only needs to know how many bytes to reserve for the header
//! and when to write the header and trailer. A [`MetadataFormatter`] turns a
//! [`RecordingSummary`] into the actual bytes.

use alloc::vec::Vec;
use core::fmt;

use crate::config::{FrequencyFilter, Gain};
use crate::session::RecordingState;

/// Readings taken just before a recording starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionReadings {
    pub battery_millivolts: u32,
    pub temperature_millicelsius: i32,
}

/// Everything known about a finished recording
#[derive(Debug, Clone, Copy)]
pub struct RecordingSummary<'a> {
    /// UTC start time
    pub start_time: u32,
    pub timezone_minutes: i16,
    pub effective_sample_rate: u32,
    /// Samples of audio the file claims to hold
    pub data_samples: u32,
    pub gain: Gain,
    pub filter: FrequencyFilter,
    pub amplitude_threshold: u16,
    pub readings: SessionReadings,
    pub state: RecordingState,
    pub file_name: &'a str,
}

impl RecordingSummary<'_> {
    pub fn local_time(&self) -> i64 {
        self.start_time as i64 + self.timezone_minutes as i64 * 60
    }
}

/// File header and trailer formatting
pub trait MetadataFormatter {
    /// Bytes reserved at the start of the file for the header
    fn header_len(&self) -> usize;

    /// Appends the trailing metadata written after the audio
    fn write_trailer(&self, summary: &RecordingSummary<'_>, out: &mut Vec<u8>);

    /// Appends exactly [`MetadataFormatter::header_len`] header bytes
    fn write_header(&self, summary: &RecordingSummary<'_>, trailer_len: usize, out: &mut Vec<u8>);
}

/// Battery voltage as shown in file comments, e.g. `3.6V`
pub struct BatteryText(pub u32);

impl fmt::Display for BatteryText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            mv if mv < 2500 => write!(f, "less than 2.5V"),
            mv if mv > 4900 => write!(f, "greater than 4.9V"),
            mv => write!(f, "{}.{}V", mv / 1000, mv / 100 % 10),
        }
    }
}

/// Temperature to one decimal place, e.g. `-3.5C`
pub struct TemperatureText(pub i32);

impl fmt::Display for TemperatureText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let decidegrees = (self.0.unsigned_abs() + 50) / 100;
        write!(f, "{}{}.{}C", sign, decidegrees / 10, decidegrees % 10)
    }
}

/// Cutoff in units of 100 Hz shown as kHz, e.g. `12.5kHz`
pub struct CutoffText(pub u16);

impl fmt::Display for CutoffText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}kHz", self.0 / 10, self.0 % 10)
    }
}
