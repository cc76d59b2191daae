//! Schedule state persisted across power-down
//!
//! The device is fully powered down between wake cycles. Everything the next
//! wake needs survives in a small retained memory region as one versioned
//! record holding the [`ScheduleState`] and the active
//! [`ConfigurationSnapshot`].
//!
//! Record layout (postcard):
//!
//! | Field   | Notes                                   |
//! |---------|-----------------------------------------|
//! | magic   | [`RETAINED_MAGIC`], absent after a cold start |
//! | version | [`RETAINED_VERSION`]                    |
//! | state   | [`ScheduleState`]                       |
//! | config  | [`ConfigurationSnapshot`]               |

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::{ConfigurationIndex, ConfigurationSnapshot, CycleIndex};
use crate::schedule::{NEVER, Schedule};

pub const RETAINED_MAGIC: u32 = 0x4D4F_5448;
pub const RETAINED_VERSION: u16 = 1;

/// Size of the retained memory region in bytes
pub const RETAINED_REGION_SIZE: usize = 512;

/// Counters and the next window, read and rewritten once per wake
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleState {
    /// [`NEVER`] when no recording will happen
    pub time_of_next_recording: u32,
    pub duration_of_next_recording: u32,
    pub index_of_next_recording: ConfigurationIndex,
    pub cycle_of_next_recording: CycleIndex,
    pub number_of_recordings: u32,
    pub complete_initial_recordings: u32,
    /// Local day of year of the last opportunistic size accounting
    pub previous_day_of_year: Option<u16>,
    pub opportunistic_bytes_written: u64,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            time_of_next_recording: 0,
            duration_of_next_recording: 0,
            // Opportunistic so the first schedule never inserts an opportunistic window
            index_of_next_recording: ConfigurationIndex::Opportunistic,
            cycle_of_next_recording: CycleIndex::Standard,
            number_of_recordings: 0,
            complete_initial_recordings: 0,
            previous_day_of_year: None,
            opportunistic_bytes_written: 0,
        }
    }
}

impl ScheduleState {
    /// Stores a scheduling decision as the next recording
    pub fn apply(&mut self, schedule: Schedule) {
        match schedule {
            Schedule::Scheduled {
                start,
                duration,
                index,
                cycle,
            } => {
                self.time_of_next_recording = start;
                self.duration_of_next_recording = duration;
                self.index_of_next_recording = index;
                self.cycle_of_next_recording = cycle;
            }
            Schedule::Never => {
                self.time_of_next_recording = NEVER;
                self.duration_of_next_recording = 0;
                self.index_of_next_recording = ConfigurationIndex::Standard;
            }
        }
    }

    pub const fn is_never(&self) -> bool {
        self.time_of_next_recording == NEVER
    }

    /// Zeroes the opportunistic byte total when the local day changed
    pub fn roll_day(&mut self, day_of_year: u16) {
        if self.previous_day_of_year != Some(day_of_year) {
            self.opportunistic_bytes_written = 0;
            self.previous_day_of_year = Some(day_of_year);
        }
    }
}

/// Errors loading or storing the retained record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RetainedError {
    #[error("Retained memory holds no record")]
    Uninitialised,

    #[error("Retained record version {found} is not supported")]
    UnsupportedVersion { found: u16 },

    #[error("Retained record could not be decoded")]
    Decode,

    #[error("Retained record does not fit in the retained region")]
    Encode,
}

/// Memory that keeps its contents through deep power-down
pub trait RetainedMemory {
    /// Fills `buffer` from the start of the region
    fn read(&mut self, buffer: &mut [u8; RETAINED_REGION_SIZE]);

    /// Overwrites the region
    fn write(&mut self, data: &[u8; RETAINED_REGION_SIZE]);
}

#[derive(Serialize, Deserialize)]
struct RecordHeader {
    magic: u32,
    version: u16,
}

#[derive(Serialize, Deserialize)]
struct RetainedRecord {
    magic: u32,
    version: u16,
    state: ScheduleState,
    config: ConfigurationSnapshot,
}

/// Versioned load/store of the retained record
pub struct RetainedStore<M: RetainedMemory> {
    memory: M,
}

impl<M: RetainedMemory> RetainedStore<M> {
    pub fn new(memory: M) -> Self {
        Self { memory }
    }

    /// Loads the persisted state and configuration
    pub fn load(&mut self) -> Result<(ScheduleState, ConfigurationSnapshot), RetainedError> {
        let mut buffer = [0u8; RETAINED_REGION_SIZE];
        self.memory.read(&mut buffer);

        let (header, _) = postcard::take_from_bytes::<RecordHeader>(&buffer)
            .map_err(|_| RetainedError::Uninitialised)?;
        if header.magic != RETAINED_MAGIC {
            return Err(RetainedError::Uninitialised);
        }
        if header.version != RETAINED_VERSION {
            return Err(RetainedError::UnsupportedVersion {
                found: header.version,
            });
        }

        let record =
            postcard::from_bytes::<RetainedRecord>(&buffer).map_err(|_| RetainedError::Decode)?;
        debug!(
            "Loaded retained state: next recording at {} for {}s",
            record.state.time_of_next_recording, record.state.duration_of_next_recording
        );

        Ok((record.state, record.config))
    }

    /// Loads the record, falling back to defaults after a cold start or a
    /// version change
    pub fn load_or_default(&mut self) -> (ScheduleState, ConfigurationSnapshot) {
        match self.load() {
            Ok(loaded) => loaded,
            Err(RetainedError::Uninitialised) => {
                debug!("No retained record, starting from defaults");
                (ScheduleState::default(), ConfigurationSnapshot::default())
            }
            Err(e) => {
                warn!("Discarding retained record: {}", e);
                (ScheduleState::default(), ConfigurationSnapshot::default())
            }
        }
    }

    /// Overwrites the retained record
    pub fn store(
        &mut self,
        state: &ScheduleState,
        config: &ConfigurationSnapshot,
    ) -> Result<(), RetainedError> {
        let record = RetainedRecord {
            magic: RETAINED_MAGIC,
            version: RETAINED_VERSION,
            state: *state,
            config: config.clone(),
        };

        let mut buffer = [0u8; RETAINED_REGION_SIZE];
        postcard::to_slice(&record, &mut buffer).map_err(|_| RetainedError::Encode)?;
        self.memory.write(&buffer);

        Ok(())
    }
}

/// Retained memory backed by a plain byte array
///
/// Used by the simulator and tests; on hardware the region is a
/// battery-backed RAM block.
pub struct ArrayRetainedMemory {
    bytes: [u8; RETAINED_REGION_SIZE],
}

impl ArrayRetainedMemory {
    /// Region contents after a cold start
    pub const fn new() -> Self {
        Self {
            bytes: [0; RETAINED_REGION_SIZE],
        }
    }
}

impl Default for ArrayRetainedMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl RetainedMemory for ArrayRetainedMemory {
    fn read(&mut self, buffer: &mut [u8; RETAINED_REGION_SIZE]) {
        buffer.copy_from_slice(&self.bytes);
    }

    fn write(&mut self, data: &[u8; RETAINED_REGION_SIZE]) {
        self.bytes.copy_from_slice(data);
    }
}

impl<M: RetainedMemory> RetainedMemory for &mut M {
    fn read(&mut self, buffer: &mut [u8; RETAINED_REGION_SIZE]) {
        (**self).read(buffer)
    }

    fn write(&mut self, data: &[u8; RETAINED_REGION_SIZE]) {
        (**self).write(data)
    }
}
