//! Simulated recorder hardware
//!
//! A capture thread stands in for the DMA transfer interrupt: it synthesises
//! one raw transfer per transfer period, hands it to the static
//! [`TransferHandoff`] and signals the foreground. Time runs `speedup` times
//! faster than the wall clock while capturing and power-downs are skipped
//! instantly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use moth_core::filter::DecimatingFilter;
use moth_core::handoff::TransferHandoff;
use moth_core::platform::{Device, Led, MINIMUM_SUPPLY_VOLTAGE, Platform};
use moth_core::pool::Producer;
use moth_core::session::CaptureSettings;

static HANDOFF: TransferHandoff<DecimatingFilter> = TransferHandoff::new();

/// Sample memory given to the buffer pool: eight 8192-sample buffers
const SAMPLE_MEMORY_SAMPLES: usize = 8 * 8192;

const FULL_BATTERY_MILLIVOLTS: u32 = 4_200;

/// Battery drain per simulated second of capture, in microvolts
const DRAIN_MICROVOLTS_PER_SECOND: u64 = 500;

/// Transfer interrupts raised and not yet waited for
#[derive(Default)]
struct Interrupts {
    raised: Mutex<u64>,
    wake: Condvar,
}

impl Interrupts {
    fn raise(&self) {
        let mut raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        *raised += 1;
        self.wake.notify_one();
    }

    /// Blocks until an interrupt after `seen` was raised, returning the new count
    fn wait_after(&self, seen: u64) -> u64 {
        let raised = self.raised.lock().unwrap_or_else(PoisonError::into_inner);
        let raised = self
            .wake
            .wait_while(raised, |raised| *raised == seen)
            .unwrap_or_else(PoisonError::into_inner);
        *raised
    }
}

/// Quiet noise with a periodic loud chirp, so silence compression has
/// something to elide. Values are on the 12-bit ADC scale the capture gain
/// expects.
struct SyntheticSource {
    sample_rate: u32,
    position: u64,
    seed: u32,
}

impl SyntheticSource {
    /// A chirp every this many seconds
    const CHIRP_EVERY_SECS: u64 = 4;
    const CHIRP_LENGTH_MS: u64 = 300;
    const CHIRP_AMPLITUDE: f32 = 1_500.0;
    const NOISE_AMPLITUDE: u32 = 12;

    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            seed: 0x1234_5678,
        }
    }

    fn fill(&mut self, raw: &mut [i16]) {
        let rate = self.sample_rate as u64;
        let cycle = rate * Self::CHIRP_EVERY_SECS;
        let chirp = rate * Self::CHIRP_LENGTH_MS / 1000;

        for sample in raw.iter_mut() {
            // Numerical Recipes LCG
            self.seed = self.seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let noise = (self.seed >> 16) % (2 * Self::NOISE_AMPLITUDE);
            let mut value = noise as f32 - Self::NOISE_AMPLITUDE as f32;

            let phase = self.position % cycle;
            if phase < chirp {
                let t = phase as f32 / self.sample_rate as f32;
                // Sweeps 2 kHz to 10 kHz
                let frequency = 2_000.0 + 8_000.0 * phase as f32 / chirp as f32;
                value += Self::CHIRP_AMPLITUDE * (core::f32::consts::TAU * frequency * t).sin();
            }

            *sample = value as i16;
            self.position += 1;
        }
    }
}

/// Simulation clock: virtual seconds since the epoch
struct SimClock {
    base_ms: u64,
    started: Instant,
    speedup: u32,
    skipped_ms: u64,
}

impl SimClock {
    fn now_ms(&self) -> u64 {
        self.base_ms + self.started.elapsed().as_millis() as u64 * self.speedup as u64 + self.skipped_ms
    }
}

pub struct SimulatedDevice {
    clock: SimClock,
    interrupts: Arc<Interrupts>,
    seen: u64,
    capturing: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    capture_started_ms: u64,
    drained_microvolts: u64,
    leds: [bool; 2],
}

impl SimulatedDevice {
    pub fn new(start_time: u32, speedup: u32) -> Self {
        Self {
            clock: SimClock {
                base_ms: start_time as u64 * 1000,
                started: Instant::now(),
                speedup: speedup.max(1),
                skipped_ms: 0,
            },
            interrupts: Arc::new(Interrupts::default()),
            seen: 0,
            capturing: Arc::new(AtomicBool::new(false)),
            capture: None,
            capture_started_ms: 0,
            drained_microvolts: 0,
            leds: [false; 2],
        }
    }
}

impl Platform for SimulatedDevice {
    type Filter = DecimatingFilter;

    fn new_filter(&mut self) -> DecimatingFilter {
        DecimatingFilter::new()
    }

    fn sample_memory_samples(&self) -> usize {
        SAMPLE_MEMORY_SAMPLES
    }

    fn start_capture(&mut self, producer: Producer<DecimatingFilter>, settings: &CaptureSettings) {
        HANDOFF.install(producer);
        self.capturing.store(true, Ordering::Release);
        self.capture_started_ms = self.clock.now_ms();

        let capturing = Arc::clone(&self.capturing);
        let interrupts = Arc::clone(&self.interrupts);
        let transfer_samples = settings.transfer_samples;
        let period = Duration::from_secs_f64(
            transfer_samples as f64 / settings.sample_rate as f64 / self.clock.speedup as f64,
        );
        let mut source = SyntheticSource::new(settings.sample_rate);

        debug!(
            "Capture started: {} raw samples every {:?}",
            transfer_samples, period
        );

        self.capture = Some(thread::spawn(move || {
            let mut raw = vec![0i16; transfer_samples];
            let mut next = Instant::now();

            while capturing.load(Ordering::Acquire) {
                source.fill(&mut raw);
                HANDOFF.on_transfer(&raw);
                interrupts.raise();

                next += period;
                thread::sleep(next.saturating_duration_since(Instant::now()));
            }
        }));
    }

    fn stop_capture(&mut self) {
        self.capturing.store(false, Ordering::Release);
        if let Some(handle) = self.capture.take()
            && handle.join().is_err()
        {
            log::error!("Capture thread panicked");
        }

        let captured_secs = self.clock.now_ms().saturating_sub(self.capture_started_ms) / 1000;
        self.drained_microvolts += captured_secs * DRAIN_MICROVOLTS_PER_SECOND;

        if HANDOFF.take().is_none() {
            warn!("Capture stopped without an installed producer");
        }
    }

    fn sleep_until_interrupt(&mut self) {
        self.seen = self.interrupts.wait_after(self.seen);
    }

    fn is_supply_above_threshold(&mut self) -> bool {
        self.battery_millivolts() >= MINIMUM_SUPPLY_VOLTAGE
    }

    fn set_led(&mut self, led: Led, on: bool) {
        let slot = &mut self.leds[led as usize];
        if *slot != on {
            trace!("{:?} LED {}", led, if on { "on" } else { "off" });
            *slot = on;
        }
    }
}

impl Device for SimulatedDevice {
    fn now(&mut self) -> u32 {
        (self.clock.now_ms() / 1000) as u32
    }

    fn power_down(&mut self, seconds: u32) {
        trace!("Power down for {}s", seconds);
        self.clock.skipped_ms += seconds as u64 * 1000;
    }

    fn battery_millivolts(&mut self) -> u32 {
        FULL_BATTERY_MILLIVOLTS.saturating_sub((self.drained_microvolts / 1000) as u32)
    }

    fn temperature_millicelsius(&mut self) -> i32 {
        // Slow daily swing around 18 C
        let hours = (self.clock.now_ms() / 3_600_000 % 24) as f32;
        18_000 + (4_000.0 * (core::f32::consts::TAU * hours / 24.0).sin()) as i32
    }

    fn delay_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis((ms / self.clock.speedup) as u64));
    }
}
