//! WAV file metadata
//!
//! Fixed 488-byte header followed by the audio and a GUANO trailer:
//!
//! ```text
//! RIFF <size> WAVE
//!   fmt  (16)   PCM, mono, 16-bit
//!   LIST (436)  INFO
//!     ICMT (384)  recording comment
//!     IART (32)   device name
//!   data <size> samples and silence markers
//!   guan <size> GUANO text
//! ```
//!
//! The text chunks have fixed sizes so the header length never depends on
//! the recording, which lets the session reserve it before capture starts.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;

use crate::config::FrequencyFilter;
use crate::metadata::{
    BatteryText, CutoffText, MetadataFormatter, RecordingSummary, TemperatureText,
};
use crate::time::CivilTime;

const LENGTH_OF_COMMENT: usize = 384;
const LENGTH_OF_ARTIST: usize = 32;

const RIFF_CHUNK: usize = 8;
const FORMAT_CHUNK_BODY: usize = 16;
const INFO_BODY: usize = 4 + 8 + LENGTH_OF_COMMENT + 8 + LENGTH_OF_ARTIST;

/// Bytes before the first sample
pub const WAV_HEADER_LEN: usize =
    RIFF_CHUNK + 4 + RIFF_CHUNK + FORMAT_CHUNK_BODY + RIFF_CHUNK + INFO_BODY + RIFF_CHUNK;

const PCM_FORMAT: u16 = 1;
const NUMBER_OF_CHANNELS: u16 = 1;
const BITS_PER_SAMPLE: u16 = 16;

/// Writes recordings as WAV with a text comment and GUANO trailer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavFormatter {
    pub make: &'static str,
    pub model: &'static str,
    pub device_id: u64,
    pub firmware: &'static str,
}

impl Default for WavFormatter {
    fn default() -> Self {
        Self {
            make: "moth-rs",
            model: "Moth",
            device_id: 0,
            firmware: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl WavFormatter {
    pub fn new(device_id: u64) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }

    /// Device name written as the artist
    pub fn artist(&self) -> String {
        let mut artist = String::new();
        let _ = write!(artist, "{} {:016X}", self.model, self.device_id);
        artist
    }

    /// Free-text description of the recording
    pub fn comment(&self, summary: &RecordingSummary<'_>) -> String {
        let time = CivilTime::from_timestamp(summary.local_time());
        let mut comment = String::new();

        let _ = write!(comment, "Recorded at {} (UTC", time);
        write_offset(&mut comment, summary.timezone_minutes, false);
        let _ = write!(
            comment,
            ") by {} at {} gain setting while battery state was {} and temperature was {}.",
            self.artist(),
            summary.gain.label(),
            BatteryText(summary.readings.battery_millivolts),
            TemperatureText(summary.readings.temperature_millicelsius),
        );

        if summary.amplitude_threshold > 0 {
            let _ = write!(
                comment,
                " Amplitude threshold was {}.",
                summary.amplitude_threshold
            );
        }

        match summary.filter {
            FrequencyFilter::None => {}
            FrequencyFilter::LowPass { high } => {
                let _ = write!(
                    comment,
                    " Low-pass filter applied with cut-off frequency of {}.",
                    CutoffText(high)
                );
            }
            FrequencyFilter::HighPass { low } => {
                let _ = write!(
                    comment,
                    " High-pass filter applied with cut-off frequency of {}.",
                    CutoffText(low)
                );
            }
            FrequencyFilter::BandPass { low, high } => {
                let _ = write!(
                    comment,
                    " Band-pass filter applied with cut-off frequencies of {} and {}.",
                    CutoffText(low),
                    CutoffText(high)
                );
            }
        }

        if let Some(reason) = summary.state.cancellation_reason() {
            let _ = write!(
                comment,
                " Recording cancelled before completion due to {}.",
                reason
            );
        }

        comment
    }

    /// GUANO metadata text, without chunk framing
    pub fn guano(&self, summary: &RecordingSummary<'_>) -> String {
        let time = CivilTime::from_timestamp(summary.local_time());
        let mut guano = String::new();

        let _ = write!(
            guano,
            "GUANO|Version:1.0\nMake:{}\nModel:{}\nSerial:{:016X}\nFirmware Version:{}\n",
            self.make, self.model, self.device_id, self.firmware
        );
        let _ = write!(
            guano,
            "Timestamp:{:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
            time.year, time.month, time.day, time.hour, time.minute, time.second
        );
        if summary.timezone_minutes == 0 {
            guano.push('Z');
        } else {
            write_offset(&mut guano, summary.timezone_minutes, true);
        }
        let _ = write!(
            guano,
            "\nSamplerate:{}\nLength:{}.{:03}\nOriginal Filename:{}\n",
            summary.effective_sample_rate,
            summary.data_samples / summary.effective_sample_rate.max(1),
            (summary.data_samples % summary.effective_sample_rate.max(1)) as u64 * 1000
                / summary.effective_sample_rate.max(1) as u64,
            summary.file_name
        );
        let battery = summary.readings.battery_millivolts;
        let _ = write!(
            guano,
            "Moth|Battery Voltage:{}.{}\nTemperature Int:{}",
            battery / 1000,
            battery / 100 % 10,
            TemperatureText(summary.readings.temperature_millicelsius)
        );
        // Drop the unit the comment text uses
        guano.pop();

        guano
    }
}

/// Timezone offset as `+1`, `-3:30` or with `padded` set `+01:00`
fn write_offset(out: &mut String, minutes: i16, padded: bool) {
    if minutes == 0 && !padded {
        return;
    }

    let sign = if minutes < 0 { '-' } else { '+' };
    let hours = minutes.unsigned_abs() / 60;
    let mins = minutes.unsigned_abs() % 60;

    let _ = if padded {
        write!(out, "{}{:02}:{:02}", sign, hours, mins)
    } else if mins == 0 {
        write!(out, "{}{}", sign, hours)
    } else {
        write!(out, "{}{}:{:02}", sign, hours, mins)
    };
}

fn put_chunk_header(out: &mut Vec<u8>, id: &[u8; 4], size: u32) {
    out.extend_from_slice(id);
    out.extend_from_slice(&size.to_le_bytes());
}

/// Copies `text` into a zero-padded field, keeping a terminating zero
fn put_fixed_text(out: &mut Vec<u8>, text: &str, len: usize) {
    let bytes = &text.as_bytes()[..text.len().min(len - 1)];
    out.extend_from_slice(bytes);
    out.resize(out.len() + len - bytes.len(), 0);
}

impl MetadataFormatter for WavFormatter {
    fn header_len(&self) -> usize {
        WAV_HEADER_LEN
    }

    fn write_trailer(&self, summary: &RecordingSummary<'_>, out: &mut Vec<u8>) {
        let guano = self.guano(summary);

        put_chunk_header(out, b"guan", guano.len() as u32);
        out.extend_from_slice(guano.as_bytes());
        // RIFF chunks are word aligned
        if guano.len() % 2 == 1 {
            out.push(0);
        }
    }

    fn write_header(&self, summary: &RecordingSummary<'_>, trailer_len: usize, out: &mut Vec<u8>) {
        let data_bytes = summary.data_samples.saturating_mul(2);
        let riff_size = ((WAV_HEADER_LEN - RIFF_CHUNK) as u32)
            .saturating_add(data_bytes)
            .saturating_add(trailer_len as u32);
        let rate = summary.effective_sample_rate;
        let block_align = NUMBER_OF_CHANNELS * BITS_PER_SAMPLE / 8;

        put_chunk_header(out, b"RIFF", riff_size);
        out.extend_from_slice(b"WAVE");

        put_chunk_header(out, b"fmt ", FORMAT_CHUNK_BODY as u32);
        out.extend_from_slice(&PCM_FORMAT.to_le_bytes());
        out.extend_from_slice(&NUMBER_OF_CHANNELS.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&(rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());

        put_chunk_header(out, b"LIST", INFO_BODY as u32);
        out.extend_from_slice(b"INFO");
        put_chunk_header(out, b"ICMT", LENGTH_OF_COMMENT as u32);
        put_fixed_text(out, &self.comment(summary), LENGTH_OF_COMMENT);
        put_chunk_header(out, b"IART", LENGTH_OF_ARTIST as u32);
        put_fixed_text(out, &self.artist(), LENGTH_OF_ARTIST);

        put_chunk_header(out, b"data", data_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Gain;
    use crate::metadata::SessionReadings;
    use crate::session::RecordingState;

    fn summary() -> RecordingSummary<'static> {
        RecordingSummary {
            start_time: 1_700_000_000,
            timezone_minutes: 0,
            effective_sample_rate: 48_000,
            data_samples: 96_000,
            gain: Gain::Medium,
            filter: FrequencyFilter::None,
            amplitude_threshold: 0,
            readings: SessionReadings {
                battery_millivolts: 3_650,
                temperature_millicelsius: 21_340,
            },
            state: RecordingState::Okay,
            file_name: "20231114_221320.WAV",
        }
    }

    fn u32_at(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ])
    }

    #[test]
    fn test_header_layout() {
        let formatter = WavFormatter::new(0x0123_4567_89AB_CDEF);
        let mut header = Vec::new();
        formatter.write_header(&summary(), 100, &mut header);

        assert_eq!(header.len(), 488);
        assert_eq!(formatter.header_len(), 488);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(u32_at(&header, 4), 480 + 192_000 + 100);
        assert_eq!(&header[8..16], b"WAVEfmt ");
        assert_eq!(u32_at(&header, 24), 48_000);
        assert_eq!(u32_at(&header, 28), 96_000);
        assert_eq!(&header[36..40], b"LIST");
        assert_eq!(&header[44..52], b"INFOICMT");
        assert_eq!(&header[440..444], b"IART");
        assert_eq!(&header[448..469], b"Moth 0123456789ABCDEF");
        assert_eq!(&header[480..484], b"data");
        assert_eq!(u32_at(&header, 484), 192_000);
    }

    #[test]
    fn test_riff_size_saturates_at_file_size_ceiling() {
        let formatter = WavFormatter::new(1);
        let mut summary = summary();
        summary.effective_sample_rate = 8_020;
        summary.data_samples = (u32::MAX - WAV_HEADER_LEN as u32) / 2;

        let mut header = Vec::new();
        formatter.write_header(&summary, 200, &mut header);

        assert_eq!(header.len(), WAV_HEADER_LEN);
        assert_eq!(u32_at(&header, 4), u32::MAX);
        assert_eq!(u32_at(&header, 484), summary.data_samples * 2);
    }

    #[test]
    fn test_comment_text() {
        let formatter = WavFormatter::new(0x0123_4567_89AB_CDEF);
        assert_eq!(
            formatter.comment(&summary()),
            "Recorded at 22:13:20 14/11/2023 (UTC) by Moth 0123456789ABCDEF at medium gain \
             setting while battery state was 3.6V and temperature was 21.3C."
        );

        let mut summary = summary();
        summary.timezone_minutes = -210;
        summary.amplitude_threshold = 120;
        summary.filter = FrequencyFilter::BandPass { low: 10, high: 80 };
        summary.state = RecordingState::SupplyVoltageLow;
        let comment = formatter.comment(&summary);

        assert!(comment.starts_with("Recorded at 18:43:20 14/11/2023 (UTC-3:30) by"));
        assert!(comment.ends_with(
            " Amplitude threshold was 120. Band-pass filter applied with cut-off frequencies \
             of 1.0kHz and 8.0kHz. Recording cancelled before completion due to low voltage."
        ));
    }

    #[test]
    fn test_guano_trailer() {
        let mut summary = summary();
        summary.timezone_minutes = 60;
        let formatter = WavFormatter::new(1);

        let guano = formatter.guano(&summary);
        assert!(guano.starts_with("GUANO|Version:1.0\n"));
        assert!(guano.contains("\nSerial:0000000000000001\n"));
        assert!(guano.contains("\nTimestamp:2023-11-14T23:13:20+01:00\n"));
        assert!(guano.contains("\nLength:2.000\n"));
        assert!(guano.contains("\nOriginal Filename:20231114_221320.WAV\n"));
        assert!(guano.ends_with("Moth|Battery Voltage:3.6\nTemperature Int:21.3"));

        let mut trailer = Vec::new();
        formatter.write_trailer(&summary, &mut trailer);
        assert_eq!(&trailer[..4], b"guan");
        assert_eq!(u32_at(&trailer, 4) as usize, guano.len());
        assert_eq!(trailer.len() % 2, 0);
    }

    #[test]
    fn test_long_comment_is_truncated() {
        let mut header = Vec::new();
        put_fixed_text(&mut header, &"x".repeat(500), LENGTH_OF_COMMENT);

        assert_eq!(header.len(), LENGTH_OF_COMMENT);
        assert_eq!(header[LENGTH_OF_COMMENT - 1], 0);
    }
}
