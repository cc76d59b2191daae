//! Hardware-independent recording engine for moth-rs
//!
//! This crate contains the platform-agnostic logic of a duty-cycled acoustic
//! recorder: the recording scheduler, the interrupt-fed sample buffer pool,
//! silence compression, the recording session state machine and the per-wake
//! foreground sequence that ties them together with persisted state.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod compress;
pub mod config;
pub mod filter;
pub mod handoff;
pub mod metadata;
pub mod platform;
pub mod pool;
pub mod recorder;
pub mod schedule;
pub mod session;
pub mod state;
pub mod storage;
pub mod time;
pub mod wav;
