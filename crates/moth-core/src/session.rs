//! Recording session
//!
//! One [`RecordingSession`] makes one recording window into one file:
//!
//! ```text
//! Initializing -> Draining -> Finalizing -> RecordingState
//! ```
//!
//! * Initializing: derive [`CaptureSettings`], size the buffer pool, start
//!   capture, open the file and write a header placeholder.
//! * Draining: drain every completed slot through the [`SilenceCompressor`],
//!   then check the stop signal and supply voltage once per pass, then sleep
//!   until the next transfer interrupt.
//! * Finalizing: flush a pending silent run, write the trailer, rewrite the
//!   header with the final sizes, close.
//!
//! A storage failure aborts at once with [`StorageError`]: no further storage
//! call is made and the file is left unfinalized.

use alloc::vec;
use alloc::vec::Vec;

use heapless::String;
use log::{debug, error, info, warn};

use crate::compress::{Decision, SilenceCompressor, elided_samples, extend_marker_bytes};
use crate::config::{ConfigurationIndex, ConfigurationSnapshot, FrequencyFilter, Gain};
use crate::filter::{DigitalFilter, FilterDesign};
use crate::metadata::{MetadataFormatter, RecordingSummary, SessionReadings};
use crate::platform::{Led, Platform, StopSignal};
use crate::pool::{Consumer, MAXIMUM_SAMPLES_IN_TRANSFER, SampleBufferPool};
use crate::storage::{FileName, Storage, StorageError};

pub const NUMBER_OF_BYTES_IN_SAMPLE: u32 = 2;

/// Largest file the 32-bit RIFF sizes can describe
pub const MAXIMUM_WAV_FILE_SIZE: u32 = u32::MAX - 1;

/// Warm-up lasts `1 / FRACTION_OF_SECOND_FOR_WARMUP` seconds
pub const FRACTION_OF_SECOND_FOR_WARMUP: u32 = 2;

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Okay,
    FileSizeLimited,
    TotalFileSizeLimited,
    SupplyVoltageLow,
    ExternallyStopped,
    StorageError,
}

impl RecordingState {
    /// Picks the reported outcome when several conditions hold at once
    pub const fn from_flags(
        externally_stopped: bool,
        supply_voltage_low: bool,
        file_size_limited: bool,
        total_file_size_limited: bool,
    ) -> Self {
        if externally_stopped {
            Self::ExternallyStopped
        } else if supply_voltage_low {
            Self::SupplyVoltageLow
        } else if file_size_limited {
            Self::FileSizeLimited
        } else if total_file_size_limited {
            Self::TotalFileSizeLimited
        } else {
            Self::Okay
        }
    }

    /// Reason shown in the file comment for a recording cut short
    pub const fn cancellation_reason(self) -> Option<&'static str> {
        match self {
            Self::Okay | Self::StorageError => None,
            Self::ExternallyStopped => Some("change of switch position"),
            Self::SupplyVoltageLow => Some("low voltage"),
            Self::FileSizeLimited => Some("file size limit"),
            Self::TotalFileSizeLimited => Some("total file size limit"),
        }
    }
}

/// Capture parameters derived from the configuration for one session
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub index: ConfigurationIndex,
    /// ADC rate before decimation
    pub sample_rate: u32,
    pub sample_rate_divider: u32,
    pub effective_sample_rate: u32,
    pub clock_divider: u8,
    pub acquisition_cycles: u8,
    pub oversample_rate: u32,
    pub gain: Gain,
    pub filter: FrequencyFilter,
    pub design: FilterDesign,
    /// Compensates the oversampling and decimation sums
    pub gain_multiplier: f32,
    /// Raw samples per DMA transfer
    pub transfer_samples: usize,
    pub warmup_transfers: u32,
    pub amplitude_threshold: u16,
    pub energy_saver: bool,
}

impl CaptureSettings {
    pub fn new(config: &ConfigurationSnapshot, index: ConfigurationIndex) -> Self {
        let capture = config.capture(index);
        let divider = capture.sample_rate_divider.max(1);

        // Largest power of two not above the decimated maximum, in raw samples
        let mut decimated = (MAXIMUM_SAMPLES_IN_TRANSFER / divider as usize).max(1);
        while decimated & (decimated - 1) != 0 {
            decimated &= decimated - 1;
        }
        let transfer_samples = decimated * divider as usize;

        Self {
            index,
            sample_rate: capture.sample_rate,
            sample_rate_divider: divider,
            effective_sample_rate: capture.sample_rate / divider,
            clock_divider: capture.clock_divider,
            acquisition_cycles: config.acquisition_cycles,
            oversample_rate: config.oversample_rate,
            gain: capture.gain,
            filter: capture.filter,
            design: FilterDesign::from_config(capture.filter),
            gain_multiplier: 16.0 / (config.oversample_rate.max(1) * divider) as f32,
            transfer_samples,
            warmup_transfers: capture.sample_rate
                / FRACTION_OF_SECOND_FOR_WARMUP
                / transfer_samples as u32,
            amplitude_threshold: capture.amplitude_threshold,
            energy_saver: capture.energy_saver,
        }
    }

    /// Samples one transfer adds to a slot
    pub fn decimated_transfer_samples(&self) -> usize {
        self.transfer_samples / self.sample_rate_divider as usize
    }

    /// Applies the filter design and gain for this session
    pub fn configure_filter<F: DigitalFilter>(&self, filter: &mut F) {
        filter.configure(self.effective_sample_rate, self.design);
        filter.apply_gain(self.gain_multiplier);
    }

    /// Target sample count for `duration` seconds, and whether a file of at
    /// most `maximum_file_size` bytes shortened it
    pub fn sample_budget(
        &self,
        duration: u32,
        header_len: usize,
        maximum_file_size: u32,
    ) -> (u64, bool) {
        let maximum_seconds = (maximum_file_size.saturating_sub(header_len as u32))
            / NUMBER_OF_BYTES_IN_SAMPLE
            / self.effective_sample_rate.max(1);
        let limited = duration > maximum_seconds;

        (
            self.effective_sample_rate as u64 * duration.min(maximum_seconds) as u64,
            limited,
        )
    }
}

/// Daily byte allowance shared by opportunistic recordings
pub struct OpportunisticBudget<'a> {
    /// Bytes written so far today, updated as the session writes
    pub written: &'a mut u64,
    pub limit: u64,
}

impl OpportunisticBudget<'_> {
    fn is_exceeded(&self) -> bool {
        *self.written > self.limit
    }
}

/// Outcome and counters of a finished session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub state: RecordingState,
    /// `None` when the session ended before opening a file
    pub file_name: Option<String<24>>,
    /// Samples drained from the pool, elided ones included
    pub samples_processed: u64,
    /// Samples removed from the reported duration by markers
    pub compressed_samples: u64,
    /// Samples the file header reports
    pub data_samples: u32,
    /// Audio and marker bytes written, header and trailer excluded
    pub audio_bytes_written: u64,
    pub markers_written: u32,
    pub buffers_elided: u32,
    pub overruns: u32,
}

impl SessionReport {
    fn not_started(state: RecordingState) -> Self {
        Self {
            state,
            file_name: None,
            samples_processed: 0,
            compressed_samples: 0,
            data_samples: 0,
            audio_bytes_written: 0,
            markers_written: 0,
            buffers_elided: 0,
            overruns: 0,
        }
    }
}

#[derive(Default)]
struct Progress {
    samples_processed: u64,
    compressed_samples: u64,
    audio_bytes_written: u64,
    markers_written: u32,
    buffers_elided: u32,
    externally_stopped: bool,
    supply_voltage_low: bool,
    total_file_size_limited: bool,
}

/// One recording window
pub struct RecordingSession<'a> {
    config: &'a ConfigurationSnapshot,
    settings: CaptureSettings,
    start_time: u32,
    duration: u32,
    budget: Option<OpportunisticBudget<'a>>,
    maximum_file_size: u32,
}

impl<'a> RecordingSession<'a> {
    pub fn new(
        config: &'a ConfigurationSnapshot,
        index: ConfigurationIndex,
        start_time: u32,
        duration: u32,
    ) -> Self {
        Self {
            config,
            settings: CaptureSettings::new(config, index),
            start_time,
            duration,
            budget: None,
            maximum_file_size: MAXIMUM_WAV_FILE_SIZE,
        }
    }

    /// Counts this session's bytes against a daily allowance
    pub fn with_budget(mut self, budget: OpportunisticBudget<'a>) -> Self {
        self.budget = Some(budget);
        self
    }

    /// Caps the file below [`MAXIMUM_WAV_FILE_SIZE`]
    pub fn with_maximum_file_size(mut self, bytes: u32) -> Self {
        self.maximum_file_size = bytes.min(MAXIMUM_WAV_FILE_SIZE);
        self
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Makes the recording.
    ///
    /// Graceful early endings are reported in [`SessionReport::state`]; only
    /// a storage failure is an error.
    pub fn run<P, S, M>(
        mut self,
        platform: &mut P,
        storage: &mut S,
        formatter: &M,
        stop: &StopSignal,
        readings: SessionReadings,
    ) -> Result<SessionReport, StorageError>
    where
        P: Platform,
        S: Storage,
        M: MetadataFormatter,
    {
        let header_len = formatter.header_len();
        let (target_samples, file_size_limited) =
            self.settings.sample_budget(self.duration, header_len, self.maximum_file_size);

        if self.budget.as_ref().is_some_and(|b| b.is_exceeded()) {
            info!("Daily opportunistic file size limit reached, skipping recording");
            return Ok(SessionReport::not_started(RecordingState::TotalFileSizeLimited));
        }

        let mut filter = platform.new_filter();
        self.settings.configure_filter(&mut filter);

        let pool = SampleBufferPool::new(platform.sample_memory_samples());
        let samples_per_buffer = pool.samples_per_buffer();
        let (producer, mut consumer) = pool.split(filter, &self.settings);

        let name = FileName::new(
            self.config.local_time(self.start_time),
            self.settings.amplitude_threshold > 0,
        );
        let long_name = name.long();
        info!(
            "Recording {} ({}) for {}s at {} Hz",
            long_name,
            self.settings.index.label(),
            self.duration,
            self.settings.effective_sample_rate
        );

        stop.clear();
        platform.start_capture(producer, &self.settings);

        let mut progress = Progress::default();
        let mut compressor = SilenceCompressor::new(self.settings.amplitude_threshold > 0);
        let drained = self.open(platform, storage, &name, header_len).and_then(|_| {
            self.drain(
                platform,
                storage,
                &mut consumer,
                &mut compressor,
                &mut progress,
                target_samples,
                stop,
            )
        });

        platform.stop_capture();
        if self.config.enable_led {
            platform.set_led(Led::Red, false);
        }
        if let Err(e) = drained {
            error!("Recording {} aborted: {}", long_name, e);
            return Err(e);
        }

        // Finalizing
        if let Some(run) = compressor.take_run() {
            self.write_marker(platform, storage, run, samples_per_buffer, &mut progress)?;
        }

        let state = RecordingState::from_flags(
            progress.externally_stopped,
            progress.supply_voltage_low,
            file_size_limited,
            progress.total_file_size_limited,
        );
        let data_samples = (progress.samples_processed - progress.compressed_samples) as u32;
        let summary = RecordingSummary {
            start_time: self.start_time,
            timezone_minutes: self.config.timezone_minutes,
            effective_sample_rate: self.settings.effective_sample_rate,
            data_samples,
            gain: self.settings.gain,
            filter: self.settings.filter,
            amplitude_threshold: self.settings.amplitude_threshold,
            readings,
            state,
            file_name: long_name.as_str(),
        };

        self.finalize(platform, storage, formatter, &summary)?;

        let overruns = consumer.overruns();
        if overruns > 0 {
            warn!("{} buffer overruns during {}", overruns, long_name);
        }
        info!(
            "Finished {}: {:?}, {} samples, {} markers",
            long_name, state, data_samples, progress.markers_written
        );

        Ok(SessionReport {
            state,
            file_name: Some(long_name),
            samples_processed: progress.samples_processed,
            compressed_samples: progress.compressed_samples,
            data_samples,
            audio_bytes_written: progress.audio_bytes_written,
            markers_written: progress.markers_written,
            buffers_elided: progress.buffers_elided,
            overruns,
        })
    }

    fn open<P: Platform, S: Storage>(
        &self,
        platform: &mut P,
        storage: &mut S,
        name: &FileName,
        header_len: usize,
    ) -> Result<(), StorageError> {
        if self.config.enable_led {
            platform.set_led(Led::Red, true);
        }
        storage.open(name)?;
        storage.write(&vec![0u8; header_len])?;
        if self.config.enable_led {
            platform.set_led(Led::Red, false);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn drain<P: Platform, S: Storage>(
        &mut self,
        platform: &mut P,
        storage: &mut S,
        consumer: &mut Consumer,
        compressor: &mut SilenceCompressor,
        progress: &mut Progress,
        target_samples: u64,
        stop: &StopSignal,
    ) -> Result<(), StorageError> {
        let samples_per_buffer = consumer.samples_per_buffer();
        let mut bytes = Vec::with_capacity(samples_per_buffer * NUMBER_OF_BYTES_IN_SAMPLE as usize);

        loop {
            while progress.samples_processed < target_samples && !progress.total_file_size_limited {
                let Some(buffer) = consumer.consume() else {
                    break;
                };

                let to_write =
                    (target_samples - progress.samples_processed).min(samples_per_buffer as u64)
                        as usize;

                match compressor.decide(buffer.threshold_exceeded(), to_write == samples_per_buffer) {
                    Decision::Skip => progress.buffers_elided += 1,
                    Decision::Write { pending_run } => {
                        if let Some(run) = pending_run {
                            self.write_marker(platform, storage, run, samples_per_buffer, progress)?;
                        }

                        bytes.clear();
                        buffer.extend_le_bytes(to_write, &mut bytes);
                        self.write_block(platform, storage, &bytes, progress)?;
                    }
                }

                drop(buffer);
                progress.samples_processed += to_write as u64;
            }

            if progress.samples_processed >= target_samples || progress.total_file_size_limited {
                return Ok(());
            }

            if stop.is_requested() {
                debug!("Stop requested");
                progress.externally_stopped = true;
                return Ok(());
            }

            if self.config.enable_low_voltage_cutoff && !platform.is_supply_above_threshold() {
                debug!("Supply voltage low");
                progress.supply_voltage_low = true;
                return Ok(());
            }

            platform.sleep_until_interrupt();
        }
    }

    fn write_marker<P: Platform, S: Storage>(
        &mut self,
        platform: &mut P,
        storage: &mut S,
        run: u32,
        samples_per_buffer: usize,
        progress: &mut Progress,
    ) -> Result<(), StorageError> {
        let mut marker = Vec::with_capacity(samples_per_buffer * NUMBER_OF_BYTES_IN_SAMPLE as usize);
        extend_marker_bytes(run, samples_per_buffer, &mut marker);
        self.write_block(platform, storage, &marker, progress)?;

        progress.markers_written += 1;
        progress.compressed_samples += elided_samples(run, samples_per_buffer);
        Ok(())
    }

    /// Writes audio or marker bytes and charges them to the daily budget
    fn write_block<P: Platform, S: Storage>(
        &mut self,
        platform: &mut P,
        storage: &mut S,
        bytes: &[u8],
        progress: &mut Progress,
    ) -> Result<(), StorageError> {
        if self.config.enable_led {
            platform.set_led(Led::Red, true);
        }
        storage.write(bytes)?;
        if self.config.enable_led {
            platform.set_led(Led::Red, false);
        }

        progress.audio_bytes_written += bytes.len() as u64;
        if let Some(budget) = self.budget.as_mut() {
            *budget.written += bytes.len() as u64;
            if budget.is_exceeded() {
                progress.total_file_size_limited = true;
            }
        }
        Ok(())
    }

    fn finalize<P: Platform, S: Storage, M: MetadataFormatter>(
        &self,
        platform: &mut P,
        storage: &mut S,
        formatter: &M,
        summary: &RecordingSummary<'_>,
    ) -> Result<(), StorageError> {
        let mut trailer = Vec::new();
        formatter.write_trailer(summary, &mut trailer);

        let mut header = Vec::with_capacity(formatter.header_len());
        formatter.write_header(summary, trailer.len(), &mut header);

        if self.config.enable_led {
            platform.set_led(Led::Red, true);
        }
        storage.write(&trailer)?;
        storage.seek(0)?;
        storage.write(&header)?;
        storage.close()?;
        if self.config.enable_led {
            platform.set_led(Led::Red, false);
        }

        Ok(())
    }
}
