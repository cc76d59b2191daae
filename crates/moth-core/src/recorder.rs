//! Per-wake foreground sequence
//!
//! The device powers down between recordings and restarts from reset, so all
//! continuity lives in retained memory. Every wake runs [`Recorder::wake`]:
//!
//! 1. Load the schedule state and configuration.
//! 2. If the next window has started, record what is left of it.
//! 3. Schedule the next window.
//! 4. Store, then power down until the window or for at most
//!    [`MAXIMUM_WAKE_INTERVAL_SECS`].

use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::{ConfigurationIndex, ConfigurationSnapshot, CycleIndex};
use crate::metadata::{MetadataFormatter, SessionReadings};
use crate::platform::{Device, Led, StopSignal};
use crate::schedule::{Schedule, schedule};
use crate::session::{
    MAXIMUM_WAV_FILE_SIZE, OpportunisticBudget, RecordingSession, RecordingState, SessionReport,
};
use crate::state::{RetainedError, RetainedMemory, RetainedStore, ScheduleState};
use crate::storage::Storage;
use crate::time::CivilTime;

/// Longest power-down while waiting for a window
pub const MAXIMUM_WAKE_INTERVAL_SECS: u32 = 2;

pub const WAITING_LED_FLASH_MS: u32 = 10;
pub const FAILURE_LED_FLASH_MS: u32 = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecorderError {
    #[error("Retained state could not be stored: {0}")]
    Retained(RetainedError),
}

/// What one wake did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeReport {
    /// Outcome of the recording attempted on this wake
    pub recording: Option<RecordingState>,
    /// Session details when a session ran to completion
    pub session: Option<SessionReport>,
    pub time_of_next_recording: u32,
    pub duration_of_next_recording: u32,
    pub sleep_secs: u32,
}

/// Owns the device and everything a wake needs
pub struct Recorder<'a, D, S, M, R>
where
    D: Device,
    S: Storage,
    M: MetadataFormatter,
    R: RetainedMemory,
{
    device: D,
    storage: S,
    formatter: M,
    store: RetainedStore<R>,
    stop: &'a StopSignal,
    maximum_file_size: u32,
}

impl<'a, D, S, M, R> Recorder<'a, D, S, M, R>
where
    D: Device,
    S: Storage,
    M: MetadataFormatter,
    R: RetainedMemory,
{
    pub fn new(device: D, storage: S, formatter: M, retained: R, stop: &'a StopSignal) -> Self {
        Self {
            device,
            storage,
            formatter,
            store: RetainedStore::new(retained),
            stop,
            maximum_file_size: MAXIMUM_WAV_FILE_SIZE,
        }
    }

    /// Splits recordings into files of at most `bytes` bytes
    pub fn with_maximum_file_size(mut self, bytes: u32) -> Self {
        self.maximum_file_size = bytes;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Installs a new configuration: counters start over and the first
    /// window is scheduled from now.
    pub fn apply_configuration(
        &mut self,
        config: ConfigurationSnapshot,
    ) -> Result<Schedule, RecorderError> {
        let mut state = ScheduleState::default();
        let next = schedule(self.device.now(), &config, &state);
        state.apply(next);

        match next {
            Schedule::Scheduled {
                start,
                duration,
                index,
                ..
            } => info!(
                "Configured, first recording at {} for {}s ({})",
                start,
                duration,
                index.label()
            ),
            Schedule::Never => info!("Configured, no recording will be made"),
        }

        self.store
            .store(&state, &config)
            .map_err(RecorderError::Retained)?;
        Ok(next)
    }

    /// Runs one wake and powers down
    pub fn wake(&mut self) -> Result<WakeReport, RecorderError> {
        let (mut state, config) = self.store.load_or_default();
        let now = self.device.now();

        let mut recording = None;
        let mut session = None;

        if !state.is_never() && now >= state.time_of_next_recording {
            let missed = now - state.time_of_next_recording;
            let duration = state.duration_of_next_recording.saturating_sub(missed);
            if missed > 0 {
                debug!("Woke {}s late, {}s of the window left", missed, duration);
            }

            if duration > 0 {
                let (outcome, report) = self.record(&mut state, &config, now, duration);
                recording = Some(outcome);

                if outcome == RecordingState::Okay
                    && state.cycle_of_next_recording == CycleIndex::Initial
                    && config
                        .duty_cycle
                        .cycle(CycleIndex::Initial)
                        .is_some_and(|initial| initial.record_secs == duration)
                {
                    state.complete_initial_recordings += 1;
                }
                state.number_of_recordings += 1;

                if outcome == RecordingState::FileSizeLimited
                    && let Some(report) = report.as_ref()
                {
                    // Carry on with the rest of the window in a new file
                    let rate = config.capture(state.index_of_next_recording).effective_sample_rate();
                    let recorded = (report.samples_processed / rate.max(1) as u64) as u32;
                    state.time_of_next_recording = now + recorded;
                    state.duration_of_next_recording = duration.saturating_sub(recorded);
                } else {
                    self.reschedule(&mut state, &config, now.saturating_add(duration));
                }
                session = report;
            } else {
                self.reschedule(&mut state, &config, now);
            }
        } else if !state.is_never() && config.enable_led {
            self.device.flash_led(Led::Green, WAITING_LED_FLASH_MS);
        }

        let now = self.device.now();
        let sleep_secs = if state.time_of_next_recording <= now {
            0
        } else {
            (state.time_of_next_recording - now).min(MAXIMUM_WAKE_INTERVAL_SECS)
        };

        self.store
            .store(&state, &config)
            .map_err(RecorderError::Retained)?;
        self.device.power_down(sleep_secs);

        Ok(WakeReport {
            recording,
            session,
            time_of_next_recording: state.time_of_next_recording,
            duration_of_next_recording: state.duration_of_next_recording,
            sleep_secs,
        })
    }

    fn reschedule(&mut self, state: &mut ScheduleState, config: &ConfigurationSnapshot, earliest: u32) {
        let from = self.device.now().max(earliest);
        let next = schedule(from, config, state);
        state.apply(next);

        match next {
            Schedule::Scheduled {
                start,
                duration,
                index,
                ..
            } => info!(
                "Next recording at {} for {}s ({})",
                start,
                duration,
                index.label()
            ),
            Schedule::Never => info!("No further recordings scheduled"),
        }
    }

    fn record(
        &mut self,
        state: &mut ScheduleState,
        config: &ConfigurationSnapshot,
        start: u32,
        duration: u32,
    ) -> (RecordingState, Option<SessionReport>) {
        if config.enable_low_voltage_cutoff && !self.device.is_supply_above_threshold() {
            warn!("Supply voltage too low to start recording");
            self.flash_failure(config);
            return (RecordingState::SupplyVoltageLow, None);
        }

        let readings = SessionReadings {
            battery_millivolts: self.device.battery_millivolts(),
            temperature_millicelsius: self.device.temperature_millicelsius(),
        };

        let day_of_year = CivilTime::from_timestamp(config.local_time(start)).day_of_year;
        state.roll_day(day_of_year);

        let index = state.index_of_next_recording;
        let mut session = RecordingSession::new(config, index, start, duration)
            .with_maximum_file_size(self.maximum_file_size);
        if index == ConfigurationIndex::Opportunistic
            && let Some(opportunistic) = config.opportunistic
        {
            session = session.with_budget(OpportunisticBudget {
                written: &mut state.opportunistic_bytes_written,
                limit: opportunistic.daily_byte_limit(),
            });
        }

        match session.run(
            &mut self.device,
            &mut self.storage,
            &self.formatter,
            self.stop,
            readings,
        ) {
            Ok(report) => (report.state, Some(report)),
            Err(e) => {
                warn!("Recording failed: {}", e);
                self.flash_failure(config);
                (RecordingState::StorageError, None)
            }
        }
    }

    fn flash_failure(&mut self, config: &ConfigurationSnapshot) {
        if !config.enable_led {
            return;
        }

        self.device.set_led(Led::Red, true);
        self.device.flash_led(Led::Green, FAILURE_LED_FLASH_MS);
        self.device.set_led(Led::Red, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DutyCycle, OpportunisticConfig, SleepRecordCycle, StartStopPeriod};
    use crate::filter::{DigitalFilter, FilterDesign};
    use crate::platform::Platform;
    use crate::pool::Producer;
    use crate::session::CaptureSettings;
    use crate::state::ArrayRetainedMemory;
    use crate::storage::{FileName, StorageError};
    use crate::wav::WavFormatter;
    use alloc::vec;
    use alloc::vec::Vec;

    struct PassThrough;

    impl DigitalFilter for PassThrough {
        fn configure(&mut self, _: u32, _: FilterDesign) {}

        fn apply_gain(&mut self, _: f32) {}

        fn filter(&mut self, raw: &[i16], out: &mut [i16], _: u32, _: u16) -> bool {
            out.copy_from_slice(&raw[..out.len()]);
            false
        }
    }

    /// One transfer per interrupt, each advancing the clock by its duration
    struct FakeDevice {
        now_ms: u64,
        producer: Option<Producer<PassThrough>>,
        transfer_samples: usize,
        sample_rate: u32,
        supply_ok: bool,
        sleeps: Vec<u32>,
        green_flashes: u32,
    }

    impl FakeDevice {
        fn at(now: u32) -> Self {
            Self {
                now_ms: now as u64 * 1000,
                producer: None,
                transfer_samples: 0,
                sample_rate: 1,
                supply_ok: true,
                sleeps: Vec::new(),
                green_flashes: 0,
            }
        }
    }

    impl Platform for FakeDevice {
        type Filter = PassThrough;

        fn new_filter(&mut self) -> PassThrough {
            PassThrough
        }

        fn sample_memory_samples(&self) -> usize {
            8 * 1024
        }

        fn start_capture(&mut self, producer: Producer<PassThrough>, settings: &CaptureSettings) {
            self.transfer_samples = settings.transfer_samples;
            self.sample_rate = settings.sample_rate;
            self.producer = Some(producer);
        }

        fn stop_capture(&mut self) {
            self.producer = None;
        }

        fn sleep_until_interrupt(&mut self) {
            self.now_ms += self.transfer_samples as u64 * 1000 / self.sample_rate as u64;
            let raw = vec![100; self.transfer_samples];
            if let Some(producer) = self.producer.as_mut() {
                producer.produce(&raw);
            }
        }

        fn is_supply_above_threshold(&mut self) -> bool {
            self.supply_ok
        }

        fn set_led(&mut self, _: Led, _: bool) {}
    }

    impl Device for FakeDevice {
        fn now(&mut self) -> u32 {
            (self.now_ms / 1000) as u32
        }

        fn power_down(&mut self, seconds: u32) {
            self.sleeps.push(seconds);
            self.now_ms += seconds as u64 * 1000;
        }

        fn battery_millivolts(&mut self) -> u32 {
            3_700
        }

        fn temperature_millicelsius(&mut self) -> i32 {
            20_000
        }

        fn delay_ms(&mut self, _: u32) {}

        fn flash_led(&mut self, led: Led, _: u32) {
            if led == Led::Green {
                self.green_flashes += 1;
            }
        }
    }

    #[derive(Default)]
    struct CountingStorage {
        opened: Vec<FileName>,
        bytes: u64,
        fail: bool,
    }

    impl Storage for CountingStorage {
        fn open(&mut self, name: &FileName) -> Result<(), StorageError> {
            self.opened.push(*name);
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
            if self.fail {
                return Err(StorageError::Write);
            }
            self.bytes += data.len() as u64;
            Ok(())
        }

        fn seek(&mut self, _: u32) -> Result<(), StorageError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// 2023-11-14T00:00:00Z
    const MIDNIGHT: u32 = 1_699_920_000;

    fn config() -> ConfigurationSnapshot {
        let mut config = ConfigurationSnapshot::default();
        config.enable_led = false;
        for capture in config.captures.iter_mut() {
            capture.sample_rate = 8_192;
            capture.sample_rate_divider = 1;
        }
        config.periods.push(StartStopPeriod::new(60, 120)).unwrap();
        config
    }

    type TestRecorder<'a> =
        Recorder<'a, FakeDevice, CountingStorage, WavFormatter, ArrayRetainedMemory>;

    fn recorder(stop: &StopSignal, now: u32) -> TestRecorder<'_> {
        Recorder::new(
            FakeDevice::at(now),
            CountingStorage::default(),
            WavFormatter::default(),
            ArrayRetainedMemory::new(),
            stop,
        )
    }

    #[test]
    fn test_configuration_schedules_first_window() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);

        let first = recorder.apply_configuration(config()).unwrap();
        assert_eq!(first.start(), MIDNIGHT + 3_600);
        assert_eq!(first.duration(), 3_600);

        // Waiting: one short power-down per wake
        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, None);
        assert_eq!(report.sleep_secs, 2);
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_600);
    }

    #[test]
    fn test_waiting_blinks_green_when_enabled() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);
        let mut config = config();
        config.enable_led = true;
        recorder.apply_configuration(config).unwrap();

        recorder.wake().unwrap();
        assert_eq!(recorder.device().green_flashes, 1);
    }

    #[test]
    fn test_late_wake_records_remainder_and_reschedules() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);
        let mut config = config();
        config.duty_cycle = DutyCycle::Standard(SleepRecordCycle::new(8, 2));
        recorder.apply_configuration(config).unwrap();

        // One second into a two second window
        recorder.device_mut().now_ms = (MIDNIGHT as u64 + 3_601) * 1000;
        let report = recorder.wake().unwrap();

        assert_eq!(report.recording, Some(RecordingState::Okay));
        let session = report.session.unwrap();
        assert_eq!(session.samples_processed, 8_192);
        assert_eq!(recorder.storage().opened.len(), 1);
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_610);
        assert_eq!(report.duration_of_next_recording, 2);
    }

    #[test]
    fn test_file_size_limit_continues_window_in_new_file() {
        let stop = StopSignal::new();
        // One second of 8192 Hz audio per file
        let mut recorder =
            recorder(&stop, MIDNIGHT + 3_600).with_maximum_file_size(488 + 2 * 8_192 + 1);
        recorder.apply_configuration(config()).unwrap();

        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, Some(RecordingState::FileSizeLimited));
        assert_eq!(report.session.unwrap().samples_processed, 8_192);
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_601);
        assert_eq!(report.duration_of_next_recording, 3_599);
        assert_eq!(report.sleep_secs, 0);

        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, Some(RecordingState::FileSizeLimited));
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_602);
        assert_eq!(report.duration_of_next_recording, 3_598);

        let opened = &recorder.storage().opened;
        assert_eq!(opened.len(), 2);
        assert_ne!(opened[0], opened[1]);
    }

    #[test]
    fn test_missed_window_is_skipped() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);
        let mut config = config();
        config.duty_cycle = DutyCycle::Standard(SleepRecordCycle::new(8, 2));
        recorder.apply_configuration(config).unwrap();

        recorder.device_mut().now_ms = (MIDNIGHT as u64 + 3_605) * 1000;
        let report = recorder.wake().unwrap();

        assert_eq!(report.recording, None);
        assert!(recorder.storage().opened.is_empty());
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_610);
    }

    #[test]
    fn test_low_supply_skips_recording() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT + 3_600);
        recorder.apply_configuration(config()).unwrap();
        recorder.device_mut().supply_ok = false;

        let report = recorder.wake().unwrap();

        assert_eq!(report.recording, Some(RecordingState::SupplyVoltageLow));
        assert!(report.session.is_none());
        assert!(recorder.storage().opened.is_empty());
        // The window is abandoned, the next one is tomorrow
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 86_400 + 3_600);
    }

    #[test]
    fn test_storage_failure_is_reported_and_rescheduled() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);
        let mut config = config();
        config.duty_cycle = DutyCycle::Standard(SleepRecordCycle::new(8, 2));
        recorder.apply_configuration(config).unwrap();

        recorder.device_mut().now_ms = (MIDNIGHT as u64 + 3_600) * 1000;
        recorder.storage.fail = true;
        let report = recorder.wake().unwrap();

        assert_eq!(report.recording, Some(RecordingState::StorageError));
        assert_eq!(report.time_of_next_recording, MIDNIGHT + 3_610);
    }

    #[test]
    fn test_initial_cycle_completions_are_counted() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT + 3_600);
        let mut config = config();
        config.duty_cycle = DutyCycle::InitialThenStandard {
            initial: SleepRecordCycle::new(3, 1),
            initial_recordings: 1,
            standard: SleepRecordCycle::new(18, 2),
        };
        recorder.apply_configuration(config).unwrap();

        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, Some(RecordingState::Okay));

        let (state, _) = recorder.store.load_or_default();
        assert_eq!(state.number_of_recordings, 1);
        assert_eq!(state.complete_initial_recordings, 1);
        assert_eq!(state.cycle_of_next_recording, CycleIndex::Standard);
    }

    #[test]
    fn test_opportunistic_total_resets_on_new_day() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT + 3_600);
        let mut config = config();
        config.opportunistic = Some(OpportunisticConfig {
            max_duration_secs: 1,
            max_total_file_size_mb: 1,
        });
        recorder.apply_configuration(config.clone()).unwrap();

        // Yesterday's total was over the limit
        let mut state = ScheduleState {
            time_of_next_recording: MIDNIGHT + 3_600,
            duration_of_next_recording: 1,
            index_of_next_recording: ConfigurationIndex::Opportunistic,
            previous_day_of_year: Some(316),
            opportunistic_bytes_written: 5_000_000,
            ..ScheduleState::default()
        };
        recorder.store.store(&state, &config).unwrap();

        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, Some(RecordingState::Okay));

        (state, _) = recorder.store.load_or_default();
        assert_eq!(state.previous_day_of_year, Some(317));
        assert_eq!(state.opportunistic_bytes_written, 2 * 8_192);
    }

    #[test]
    fn test_unconfigured_device_never_records() {
        let stop = StopSignal::new();
        let mut recorder = recorder(&stop, MIDNIGHT);

        let report = recorder.wake().unwrap();
        assert_eq!(report.recording, None);
        assert_eq!(report.sleep_secs, 2);
        assert_eq!(recorder.device().sleeps, [2]);
    }
}
