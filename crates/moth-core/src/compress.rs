//! Silence compression
//!
//! Runs of full buffers that never crossed the amplitude threshold are not
//! written. When the next buffer that must be written arrives, a single
//! marker block the size of one buffer is written first in place of the run.
//!
//! Marker layout, in 16-bit samples:
//!
//! | Samples  | Content                                           |
//! |----------|---------------------------------------------------|
//! | 0..32    | run length, least significant bit first, `1` for a set bit and `-1` for a clear bit |
//! | 32..     | zero                                              |
//!
//! The marker occupies one buffer of real time, so a run of `n` buffers
//! shortens the recording by `n - 1` buffer durations.

use alloc::vec::Vec;

/// Samples carrying the run length at the start of a marker
pub const MARKER_BITS: usize = 32;

/// What to do with one drained buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Elide the buffer
    Skip,
    /// Write the buffer, preceded by a marker for `pending_run` elided buffers
    Write { pending_run: Option<u32> },
}

/// Per-session run tracking
#[derive(Debug)]
pub struct SilenceCompressor {
    enabled: bool,
    run: u32,
    buffers_seen: u32,
}

impl SilenceCompressor {
    /// A compressor that only elides when `enabled` (an amplitude threshold is
    /// configured)
    pub const fn new(enabled: bool) -> Self {
        Self {
            enabled,
            run: 0,
            buffers_seen: 0,
        }
    }

    /// Classifies the next buffer of the session.
    ///
    /// The first buffer and partial buffers are always written.
    pub fn decide(&mut self, threshold_exceeded: bool, full_length: bool) -> Decision {
        let first = self.buffers_seen == 0;
        self.buffers_seen = self.buffers_seen.saturating_add(1);

        if self.enabled && !threshold_exceeded && !first && full_length {
            self.run += 1;
            return Decision::Skip;
        }

        Decision::Write {
            pending_run: self.take_run(),
        }
    }

    /// Ends the current run, returning its length if any buffers were elided
    pub fn take_run(&mut self) -> Option<u32> {
        match core::mem::take(&mut self.run) {
            0 => None,
            run => Some(run),
        }
    }

    pub const fn pending_run(&self) -> u32 {
        self.run
    }
}

/// Samples removed from the reported duration by a marker for `run` buffers
pub const fn elided_samples(run: u32, samples_per_buffer: usize) -> u64 {
    (run as u64).saturating_sub(1) * samples_per_buffer as u64
}

/// Fills `marker` with the encoding of `run`
pub fn encode_marker(run: u32, marker: &mut [i16]) {
    let (bits, rest) = marker.split_at_mut(MARKER_BITS.min(marker.len()));
    for (i, sample) in bits.iter_mut().enumerate() {
        *sample = if (run >> i) & 1 == 1 { 1 } else { -1 };
    }
    rest.fill(0);
}

/// Appends a little-endian marker block of `samples` samples
pub fn extend_marker_bytes(run: u32, samples: usize, out: &mut Vec<u8>) {
    for i in 0..samples {
        let sample: i16 = if i >= MARKER_BITS {
            0
        } else if (run >> i) & 1 == 1 {
            1
        } else {
            -1
        };
        out.extend_from_slice(&sample.to_le_bytes());
    }
}

/// Recovers the run length from a marker block
///
/// Returns `None` if `marker` is not a valid marker.
pub fn decode_marker(marker: &[i16]) -> Option<u32> {
    if marker.len() < MARKER_BITS || marker[MARKER_BITS..].iter().any(|&s| s != 0) {
        return None;
    }

    marker[..MARKER_BITS]
        .iter()
        .enumerate()
        .try_fold(0u32, |run, (i, &sample)| match sample {
            1 => Some(run | 1 << i),
            -1 => Some(run),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_first_buffer_always_written() {
        let mut compressor = SilenceCompressor::new(true);
        assert_eq!(
            compressor.decide(false, true),
            Decision::Write { pending_run: None }
        );
    }

    #[test]
    fn test_run_flushed_before_loud_buffer() {
        let mut compressor = SilenceCompressor::new(true);
        compressor.decide(true, true);

        for _ in 0..3 {
            assert_eq!(compressor.decide(false, true), Decision::Skip);
        }
        assert_eq!(compressor.pending_run(), 3);

        assert_eq!(
            compressor.decide(true, true),
            Decision::Write {
                pending_run: Some(3)
            }
        );
        assert_eq!(compressor.pending_run(), 0);
    }

    #[test]
    fn test_partial_buffer_is_written() {
        let mut compressor = SilenceCompressor::new(true);
        compressor.decide(true, true);
        compressor.decide(false, true);

        assert_eq!(
            compressor.decide(false, false),
            Decision::Write {
                pending_run: Some(1)
            }
        );
    }

    #[test]
    fn test_disabled_never_skips() {
        let mut compressor = SilenceCompressor::new(false);
        for _ in 0..4 {
            assert_eq!(
                compressor.decide(false, true),
                Decision::Write { pending_run: None }
            );
        }
        assert_eq!(compressor.take_run(), None);
    }

    #[test]
    fn test_marker_encoding() {
        let mut marker = vec![7i16; 256];
        encode_marker(0b1011, &mut marker);

        assert_eq!(&marker[..5], &[1, 1, -1, 1, -1]);
        assert!(marker[5..32].iter().all(|&s| s == -1));
        assert!(marker[32..].iter().all(|&s| s == 0));
        assert_eq!(decode_marker(&marker), Some(0b1011));
    }

    #[test]
    fn test_marker_bytes_match_samples() {
        let mut marker = vec![0i16; 64];
        encode_marker(u32::MAX - 4, &mut marker);

        let mut bytes = Vec::new();
        extend_marker_bytes(u32::MAX - 4, 64, &mut bytes);

        let expected: Vec<u8> = marker.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_audio_is_not_a_marker() {
        let mut audio = vec![0i16; 64];
        audio[3] = 200;
        assert_eq!(decode_marker(&audio), None);

        let mut marker = vec![0i16; 64];
        encode_marker(5, &mut marker);
        marker[40] = 1;
        assert_eq!(decode_marker(&marker), None);
    }

    #[test]
    fn test_elided_samples() {
        assert_eq!(elided_samples(3, 1024), 2048);
        assert_eq!(elided_samples(1, 1024), 0);
    }
}
