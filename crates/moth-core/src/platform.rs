//! Hardware abstraction consumed by the engine
//!
//! [`Platform`] is what a [`crate::session::RecordingSession`] needs while
//! capturing; [`Device`] adds what the per-wake sequence in
//! [`crate::recorder`] needs around it.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::filter::DigitalFilter;
use crate::pool::Producer;
use crate::session::CaptureSettings;

/// Supply voltage below which recording stops, in millivolts
pub const MINIMUM_SUPPLY_VOLTAGE: u32 = 2800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Led {
    Red,
    Green,
}

/// Capture-time hardware
pub trait Platform {
    type Filter: DigitalFilter;

    /// A fresh filter for the next session
    fn new_filter(&mut self) -> Self::Filter;

    /// Sample memory available to the buffer pool, in samples
    fn sample_memory_samples(&self) -> usize;

    /// Starts the microphone and DMA, handing `producer` to the transfer
    /// interrupt
    fn start_capture(&mut self, producer: Producer<Self::Filter>, settings: &CaptureSettings);

    /// Stops capture and drops the producer held by interrupt context
    fn stop_capture(&mut self);

    /// Low-power wait until the next interrupt
    fn sleep_until_interrupt(&mut self);

    /// Whether the supply is above [`MINIMUM_SUPPLY_VOLTAGE`]
    fn is_supply_above_threshold(&mut self) -> bool;

    fn set_led(&mut self, led: Led, on: bool);
}

/// Whole-device hardware used between recordings
pub trait Device: Platform {
    /// Seconds since the epoch, UTC
    fn now(&mut self) -> u32;

    /// Powers down for `seconds`. On hardware the next wake restarts from
    /// reset.
    fn power_down(&mut self, seconds: u32);

    fn battery_millivolts(&mut self) -> u32;

    fn temperature_millicelsius(&mut self) -> i32;

    fn delay_ms(&mut self, ms: u32);

    /// Lights `led` for `ms` milliseconds
    fn flash_led(&mut self, led: Led, ms: u32) {
        self.set_led(led, true);
        self.delay_ms(ms);
        self.set_led(led, false);
    }
}

/// Externally latched request to stop recording, e.g. from a switch
/// interrupt
pub struct StopSignal {
    requested: AtomicBool,
}

impl StopSignal {
    pub const fn new() -> Self {
        Self {
            requested: AtomicBool::new(false),
        }
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.requested.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
