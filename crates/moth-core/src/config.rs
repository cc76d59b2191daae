//! Recording configuration snapshot
//!
//! A [`ConfigurationSnapshot`] is produced upstream (by the configuration
//! parser or the host application) and applied all at once. The engine treats
//! it as valid: periods sorted and non-overlapping, non-zero sample rates and
//! dividers, non-zero cycle lengths when duty cycling is enabled.

use heapless::Vec;
use serde::{Deserialize, Serialize};

/// Maximum number of daily start/stop periods
pub const MAX_START_STOP_PERIODS: usize = 5;

/// Cutoff frequencies are configured in units of 100 Hz
pub const FILTER_FREQ_MULTIPLIER: u32 = 100;

pub const SECONDS_IN_MINUTE: u32 = 60;
pub const SECONDS_IN_DAY: u32 = 86_400;

const BYTES_IN_ONE_MB: u64 = 1024 * 1024;

/// Which capture settings a recording uses
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationIndex {
    Standard,
    Opportunistic,
}

impl ConfigurationIndex {
    pub const fn slot(self) -> usize {
        match self {
            Self::Standard => 0,
            Self::Opportunistic => 1,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Opportunistic => "opportunistic",
        }
    }
}

/// Which sleep/record cycle a recording was scheduled from
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleIndex {
    Initial,
    Standard,
}

/// One alternating sleep/record pattern
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepRecordCycle {
    pub sleep_secs: u32,
    pub record_secs: u32,
}

impl SleepRecordCycle {
    pub const fn new(sleep_secs: u32, record_secs: u32) -> Self {
        Self {
            sleep_secs,
            record_secs,
        }
    }

    /// Length of one full record + sleep cycle
    pub const fn period_secs(&self) -> u32 {
        self.sleep_secs + self.record_secs
    }
}

/// Duty cycling applied inside the active periods
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DutyCycle {
    /// Record for the whole of every active period
    Disabled,
    /// A single repeating cycle
    Standard(SleepRecordCycle),
    /// `initial` until `initial_recordings` complete recordings were made
    /// with it, then `standard`
    InitialThenStandard {
        initial: SleepRecordCycle,
        initial_recordings: u32,
        standard: SleepRecordCycle,
    },
}

impl DutyCycle {
    /// Picks the cycle for the next recording.
    ///
    /// Returns `None` when duty cycling is disabled.
    pub fn select(
        &self,
        number_of_recordings: u32,
        complete_initial_recordings: u32,
    ) -> Option<(CycleIndex, SleepRecordCycle)> {
        match *self {
            Self::Disabled => None,
            Self::Standard(cycle) => Some((CycleIndex::Standard, cycle)),
            Self::InitialThenStandard {
                initial,
                initial_recordings,
                standard,
            } => {
                if number_of_recordings == 0 || complete_initial_recordings < initial_recordings {
                    Some((CycleIndex::Initial, initial))
                } else {
                    Some((CycleIndex::Standard, standard))
                }
            }
        }
    }

    /// The configured cycle for `index`, if there is one
    pub fn cycle(&self, index: CycleIndex) -> Option<SleepRecordCycle> {
        match (*self, index) {
            (Self::Disabled, _) => None,
            (Self::Standard(cycle), CycleIndex::Standard) => Some(cycle),
            (Self::Standard(_), CycleIndex::Initial) => None,
            (Self::InitialThenStandard { initial, .. }, CycleIndex::Initial) => Some(initial),
            (Self::InitialThenStandard { standard, .. }, CycleIndex::Standard) => Some(standard),
        }
    }
}

/// A daily window, in UTC minutes of day, during which recording may occur
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartStopPeriod {
    pub start_minutes: u16,
    pub stop_minutes: u16,
}

impl StartStopPeriod {
    pub const fn new(start_minutes: u16, stop_minutes: u16) -> Self {
        Self {
            start_minutes,
            stop_minutes,
        }
    }

    pub const fn start_secs(&self) -> u32 {
        self.start_minutes as u32 * SECONDS_IN_MINUTE
    }

    pub const fn stop_secs(&self) -> u32 {
        self.stop_minutes as u32 * SECONDS_IN_MINUTE
    }

    pub const fn length_secs(&self) -> u32 {
        self.stop_secs() - self.start_secs()
    }
}

/// Microphone gain setting
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gain {
    Low,
    LowMedium,
    #[default]
    Medium,
    MediumHigh,
    High,
}

impl Gain {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::LowMedium => "low-medium",
            Self::Medium => "medium",
            Self::MediumHigh => "medium-high",
            Self::High => "high",
        }
    }
}

/// Requested frequency filter, cutoffs in units of 100 Hz
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrequencyFilter {
    #[default]
    None,
    LowPass {
        high: u16,
    },
    HighPass {
        low: u16,
    },
    BandPass {
        low: u16,
        high: u16,
    },
}

/// Capture settings for one configuration index
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// ADC sample rate in Hz, before decimation
    pub sample_rate: u32,
    pub sample_rate_divider: u32,
    pub clock_divider: u8,
    pub gain: Gain,
    pub filter: FrequencyFilter,
    /// Zero disables silence compression
    pub amplitude_threshold: u16,
    pub energy_saver: bool,
}

impl CaptureConfig {
    /// Sample rate written to the file
    pub const fn effective_sample_rate(&self) -> u32 {
        self.sample_rate / self.sample_rate_divider
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 384_000,
            sample_rate_divider: 8,
            clock_divider: 4,
            gain: Gain::Medium,
            filter: FrequencyFilter::None,
            amplitude_threshold: 0,
            energy_saver: false,
        }
    }
}

/// Short extra recordings inserted into idle sleep gaps
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpportunisticConfig {
    /// Zero leaves the duration bounded only by the gap
    pub max_duration_secs: u32,
    pub max_total_file_size_mb: u32,
}

impl OpportunisticConfig {
    pub const fn daily_byte_limit(&self) -> u64 {
        self.max_total_file_size_mb as u64 * BYTES_IN_ONE_MB
    }
}

/// Everything the engine needs to schedule and make recordings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationSnapshot {
    /// Local time offset from UTC, used for file names and daily accounting
    pub timezone_minutes: i16,
    pub enable_led: bool,
    pub enable_low_voltage_cutoff: bool,
    pub acquisition_cycles: u8,
    pub oversample_rate: u32,
    pub duty_cycle: DutyCycle,
    /// Indexed by [`ConfigurationIndex::slot`]
    pub captures: [CaptureConfig; 2],
    /// `None` disables opportunistic recording
    pub opportunistic: Option<OpportunisticConfig>,
    pub periods: Vec<StartStopPeriod, MAX_START_STOP_PERIODS>,
    pub earliest_recording_time: Option<u32>,
    pub latest_recording_time: Option<u32>,
}

impl ConfigurationSnapshot {
    pub fn capture(&self, index: ConfigurationIndex) -> &CaptureConfig {
        &self.captures[index.slot()]
    }

    /// Converts a UTC timestamp to local seconds since the epoch
    pub fn local_time(&self, timestamp: u32) -> i64 {
        timestamp as i64 + self.timezone_minutes as i64 * SECONDS_IN_MINUTE as i64
    }
}

impl Default for ConfigurationSnapshot {
    fn default() -> Self {
        Self {
            timezone_minutes: 0,
            enable_led: true,
            enable_low_voltage_cutoff: true,
            acquisition_cycles: 16,
            oversample_rate: 1,
            duty_cycle: DutyCycle::Disabled,
            captures: [CaptureConfig::default(); 2],
            opportunistic: None,
            periods: Vec::new(),
            earliest_recording_time: None,
            latest_recording_time: None,
        }
    }
}
