//! Duty-cycle scheduler
//!
//! [`schedule`] is a pure function of the current time, the configuration
//! snapshot and the persisted counters. It yields the next recording window,
//! or [`Schedule::Never`] when no window can ever occur.
//!
//! Start/stop periods are evaluated in UTC seconds of day. The earliest
//! recording time moves the evaluation point forward; the latest recording
//! time truncates or cancels the result.

use crate::config::{
    ConfigurationIndex, ConfigurationSnapshot, CycleIndex, SECONDS_IN_DAY, SleepRecordCycle,
    StartStopPeriod,
};
use crate::state::ScheduleState;
use crate::time::seconds_of_day;

/// Idle margin kept on both sides of an opportunistic recording
pub const OPPORTUNISTIC_GAP_SECS: u32 = 5;

/// Sentinel start time meaning "never"
pub const NEVER: u32 = u32::MAX;

/// Outcome of a scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    Scheduled {
        start: u32,
        duration: u32,
        index: ConfigurationIndex,
        cycle: CycleIndex,
    },
    Never,
}

impl Schedule {
    pub const fn start(&self) -> u32 {
        match self {
            Self::Scheduled { start, .. } => *start,
            Self::Never => NEVER,
        }
    }

    pub const fn duration(&self) -> u32 {
        match self {
            Self::Scheduled { duration, .. } => *duration,
            Self::Never => 0,
        }
    }

    pub const fn index(&self) -> ConfigurationIndex {
        match self {
            Self::Scheduled { index, .. } => *index,
            Self::Never => ConfigurationIndex::Standard,
        }
    }
}

struct Window {
    start: u32,
    duration: u32,
    index: ConfigurationIndex,
}

/// Computes the next recording window at or after `current_time`.
pub fn schedule(current_time: u32, config: &ConfigurationSnapshot, state: &ScheduleState) -> Schedule {
    let selected = config.duty_cycle.select(
        state.number_of_recordings,
        state.complete_initial_recordings,
    );
    let cycle_index = selected.map_or(CycleIndex::Standard, |(index, _)| index);
    let cycle = selected.map(|(_, cycle)| cycle);

    let Some(first_period) = config.periods.first() else {
        return Schedule::Never;
    };

    let now = match config.earliest_recording_time {
        Some(earliest) => current_time.max(earliest),
        None => current_time,
    };
    let current_seconds = seconds_of_day(now);

    let window = config
        .periods
        .iter()
        .find_map(|period| {
            window_in_period(
                now,
                current_seconds,
                period,
                cycle,
                config,
                state.index_of_next_recording,
            )
        })
        .unwrap_or_else(|| Window {
            start: now
                .saturating_add(SECONDS_IN_DAY - current_seconds)
                .saturating_add(first_period.start_secs()),
            duration: first_duration(first_period, cycle),
            index: ConfigurationIndex::Standard,
        });

    match config.latest_recording_time {
        Some(latest) if window.start >= latest => Schedule::Never,
        Some(latest) => Schedule::Scheduled {
            start: window.start,
            duration: window.duration.min(latest - window.start),
            index: window.index,
            cycle: cycle_index,
        },
        None => Schedule::Scheduled {
            start: window.start,
            duration: window.duration,
            index: window.index,
            cycle: cycle_index,
        },
    }
}

/// Duration of a recording starting at the beginning of `period`
fn first_duration(period: &StartStopPeriod, cycle: Option<SleepRecordCycle>) -> u32 {
    match cycle {
        None => period.length_secs(),
        Some(cycle) => cycle.record_secs.min(period.length_secs()),
    }
}

fn window_in_period(
    now: u32,
    current_seconds: u32,
    period: &StartStopPeriod,
    cycle: Option<SleepRecordCycle>,
    config: &ConfigurationSnapshot,
    previous_index: ConfigurationIndex,
) -> Option<Window> {
    let start_secs = period.start_secs();
    let stop_secs = period.stop_secs();

    if current_seconds <= start_secs {
        return Some(Window {
            start: now + (start_secs - current_seconds),
            duration: first_duration(period, cycle),
            index: ConfigurationIndex::Standard,
        });
    }

    if current_seconds >= stop_secs {
        return None;
    }

    let elapsed = current_seconds - start_secs;
    let remaining = stop_secs - current_seconds;

    let Some(cycle) = cycle else {
        return Some(Window {
            start: now,
            duration: remaining,
            index: ConfigurationIndex::Standard,
        });
    };

    let phase = elapsed % cycle.period_secs();
    if phase < cycle.record_secs {
        return Some(Window {
            start: now,
            duration: (cycle.record_secs - phase).min(remaining),
            index: ConfigurationIndex::Standard,
        });
    }

    let wait = cycle.period_secs() - phase;
    let elapsed_at_boundary = elapsed + wait;
    if elapsed_at_boundary >= period.length_secs() {
        return None;
    }

    let boundary = now + wait;
    let mut window = Window {
        start: boundary,
        duration: cycle
            .record_secs
            .min(period.length_secs() - elapsed_at_boundary),
        index: ConfigurationIndex::Standard,
    };

    if let Some(opportunistic) = config.opportunistic
        && previous_index == ConfigurationIndex::Standard
        && wait > 2 * OPPORTUNISTIC_GAP_SECS
    {
        window.start = boundary - cycle.sleep_secs + OPPORTUNISTIC_GAP_SECS;
        window.duration = cycle.sleep_secs - 2 * OPPORTUNISTIC_GAP_SECS;
        if opportunistic.max_duration_secs > 0 {
            window.duration = window.duration.min(opportunistic.max_duration_secs);
        }
        window.index = ConfigurationIndex::Opportunistic;
    }

    Some(window)
}
