//! Desktop simulator for the moth-rs recording engine.
//!
//! Runs the real per-wake sequence from moth-core against a simulated device
//! and writes WAV files to a host directory. The microphone is a synthetic
//! source of quiet noise with a chirp every few seconds.
//!
//! # Environment
//!
//! | Variable                  | Default      | Meaning                                  |
//! |---------------------------|--------------|------------------------------------------|
//! | `RUST_LOG`                | unset        | log filter, e.g. `info` or `moth_core=debug` |
//! | `MOTH_SIM_OUTPUT`         | `recordings` | directory for WAV files                  |
//! | `MOTH_SIM_SPEEDUP`        | `20`         | simulated seconds per wall-clock second  |
//! | `MOTH_SIM_RECORDINGS`     | `4`          | recordings to make before exiting        |
//! | `MOTH_SIM_STOP_AFTER_SECS`| unset        | wall-clock seconds before a switch stop  |

mod device;
mod fs_storage;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{error, info, warn};

use moth_core::config::{
    ConfigurationSnapshot, DutyCycle, FrequencyFilter, OpportunisticConfig, SECONDS_IN_DAY,
    SECONDS_IN_MINUTE, SleepRecordCycle, StartStopPeriod,
};
use moth_core::platform::StopSignal;
use moth_core::recorder::Recorder;
use moth_core::schedule::NEVER;
use moth_core::state::ArrayRetainedMemory;
use moth_core::wav::WavFormatter;

use device::SimulatedDevice;
use fs_storage::FsStorage;

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

const DEFAULT_SPEEDUP: u32 = 20;
const DEFAULT_RECORDINGS: u32 = 4;
const DEFAULT_OUTPUT_DIR: &str = "recordings";

/// Serial number written to every file
const DEVICE_ID: u64 = 0x24F0_0000_5EED_0001;

/// Switch interrupt shared with the stop timer thread
static STOP: StopSignal = StopSignal::new();

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparsable {}={}", name, value);
            default
        }),
        Err(_) => default,
    }
}

/// A ten minute period starting on the next minute, recording 10 s of every
/// 30 s with opportunistic recordings in the gaps
fn demo_configuration(now: u32) -> ConfigurationSnapshot {
    let mut config = ConfigurationSnapshot::default();

    let minute_of_day = (now % SECONDS_IN_DAY / SECONDS_IN_MINUTE) as u16;
    // Keep the period inside one day
    let start = (minute_of_day + 1).min(24 * 60 - 10);
    let _ = config.periods.push(StartStopPeriod::new(start, start + 10));

    config.duty_cycle = DutyCycle::InitialThenStandard {
        initial: SleepRecordCycle::new(10, 5),
        initial_recordings: 1,
        standard: SleepRecordCycle::new(20, 10),
    };

    let standard = &mut config.captures[0];
    standard.sample_rate = 96_000;
    standard.sample_rate_divider = 2;
    standard.amplitude_threshold = 500;
    standard.filter = FrequencyFilter::HighPass { low: 10 };

    let opportunistic = &mut config.captures[1];
    opportunistic.sample_rate = 48_000;
    opportunistic.sample_rate_divider = 1;

    config.opportunistic = Some(OpportunisticConfig {
        max_duration_secs: 5,
        max_total_file_size_mb: 1,
    });

    config
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();

    let speedup = env_or("MOTH_SIM_SPEEDUP", DEFAULT_SPEEDUP);
    let target = env_or("MOTH_SIM_RECORDINGS", DEFAULT_RECORDINGS);
    let output = env_or("MOTH_SIM_OUTPUT", String::from(DEFAULT_OUTPUT_DIR));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32;

    info!("Starting moth-rs simulator");
    info!("Speedup {}x, writing to {}/", speedup, output);

    let mut recorder = Recorder::new(
        SimulatedDevice::new(now, speedup),
        FsStorage::new(&output),
        WavFormatter::new(DEVICE_ID),
        ArrayRetainedMemory::new(),
        &STOP,
    );

    if let Err(e) = recorder.apply_configuration(demo_configuration(now)) {
        error!("Failed to apply configuration: {}", e);
        return;
    }

    if let Ok(secs) = std::env::var("MOTH_SIM_STOP_AFTER_SECS")
        && let Ok(secs) = secs.parse::<u64>()
    {
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            info!("Switch moved, requesting stop");
            STOP.request();
        });
    }

    // -----------------------------------------------------------------------
    // Wake loop
    // -----------------------------------------------------------------------
    let mut recordings = 0;
    while recordings < target {
        let report = match recorder.wake() {
            Ok(report) => report,
            Err(e) => {
                error!("Wake failed: {}", e);
                break;
            }
        };

        if let Some(state) = report.recording {
            recordings += 1;
            match report.session {
                Some(session) => info!(
                    "Recording {}/{}: {:?}, {} ({} samples, {} buffers elided, {} overruns)",
                    recordings,
                    target,
                    state,
                    session.file_name.as_deref().unwrap_or("no file"),
                    session.data_samples,
                    session.buffers_elided,
                    session.overruns
                ),
                None => info!("Recording {}/{}: {:?}", recordings, target, state),
            }
        }

        if report.time_of_next_recording == NEVER {
            info!("Nothing left to record");
            break;
        }
    }

    info!("Simulator exiting");
}
