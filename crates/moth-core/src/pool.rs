//! Sample buffer pool
//!
//! A fixed ring of [`NUMBER_OF_BUFFERS`] equally sized buffers shared between
//! one producer (the DMA transfer interrupt) and one consumer (the foreground
//! drain loop).
//!
//! Both sides count completed slots with monotonic counters: the producer
//! publishes `written` with release ordering after filling a slot, the
//! consumer publishes `read` after it is done with one. The difference is the
//! number of slots ready to drain.
//!
//! There is no backpressure. If the consumer falls a whole ring behind, the
//! producer keeps filling and overwrites the oldest unread slot. Slot memory
//! is atomic, so an overwritten slot holds torn audio rather than undefined
//! behaviour. Every lap is counted in [`Consumer::overruns`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, Ordering};

use crate::filter::DigitalFilter;
use crate::session::CaptureSettings;

pub const NUMBER_OF_BUFFERS: usize = 8;

/// Largest single DMA transfer, in raw samples
pub const MAXIMUM_SAMPLES_IN_TRANSFER: usize = 1024;

struct PoolShared {
    samples: Box<[AtomicI16]>,
    samples_per_buffer: usize,
    thresholds: [AtomicBool; NUMBER_OF_BUFFERS],
    written: AtomicU32,
    read: AtomicU32,
    overruns: AtomicU32,
}

impl PoolShared {
    fn slot(&self, count: u32) -> &[AtomicI16] {
        let start = (count as usize % NUMBER_OF_BUFFERS) * self.samples_per_buffer;
        &self.samples[start..start + self.samples_per_buffer]
    }

    fn threshold(&self, count: u32) -> &AtomicBool {
        &self.thresholds[count as usize % NUMBER_OF_BUFFERS]
    }
}

/// Unsplit pool, carved from the platform's sample memory
pub struct SampleBufferPool {
    shared: Arc<PoolShared>,
}

impl SampleBufferPool {
    /// Divides `memory_samples` into [`NUMBER_OF_BUFFERS`] slots.
    ///
    /// Slot length is rounded down to a whole number of maximum transfers so
    /// that every decimated transfer fits a slot exactly, with one transfer
    /// as the minimum.
    pub fn new(memory_samples: usize) -> Self {
        let per_buffer = memory_samples / NUMBER_OF_BUFFERS;
        let samples_per_buffer = (per_buffer - per_buffer % MAXIMUM_SAMPLES_IN_TRANSFER)
            .max(MAXIMUM_SAMPLES_IN_TRANSFER);

        let samples = (0..samples_per_buffer * NUMBER_OF_BUFFERS)
            .map(|_| AtomicI16::new(0))
            .collect();

        Self {
            shared: Arc::new(PoolShared {
                samples,
                samples_per_buffer,
                thresholds: core::array::from_fn(|_| AtomicBool::new(false)),
                written: AtomicU32::new(0),
                read: AtomicU32::new(0),
                overruns: AtomicU32::new(0),
            }),
        }
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.shared.samples_per_buffer
    }

    /// Splits the pool into its interrupt-side and foreground-side halves.
    ///
    /// The filter must already be configured for the session.
    pub fn split<F: DigitalFilter>(
        self,
        filter: F,
        settings: &CaptureSettings,
    ) -> (Producer<F>, Consumer) {
        let producer = Producer {
            shared: Arc::clone(&self.shared),
            filter,
            scratch: vec![0; settings.decimated_transfer_samples()],
            decimation: settings.sample_rate_divider,
            threshold: settings.amplitude_threshold,
            warmup_remaining: settings.warmup_transfers,
            write_offset: 0,
            written: 0,
        };
        let consumer = Consumer {
            shared: self.shared,
            read: 0,
        };

        (producer, consumer)
    }
}

/// Interrupt-side half of the pool
///
/// Owns the digital filter. [`Producer::produce`] is bounded and never
/// blocks or allocates.
pub struct Producer<F> {
    shared: Arc<PoolShared>,
    filter: F,
    scratch: Vec<i16>,
    decimation: u32,
    threshold: u16,
    warmup_remaining: u32,
    write_offset: usize,
    written: u32,
}

impl<F: DigitalFilter> Producer<F> {
    /// Filters one raw transfer into the current slot.
    ///
    /// Returns whether the amplitude threshold was exceeded. Transfers during
    /// warm-up are filtered so the filter state settles, then dropped.
    pub fn produce(&mut self, raw: &[i16]) -> bool {
        let decimated = (raw.len() / self.decimation as usize).min(self.scratch.len());
        let exceeded = self.filter.filter(
            raw,
            &mut self.scratch[..decimated],
            self.decimation,
            self.threshold,
        );

        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return exceeded;
        }

        let mut offset = 0;
        while offset < decimated {
            if exceeded {
                self.shared
                    .threshold(self.written)
                    .store(true, Ordering::Relaxed);
            }

            let slot = self.shared.slot(self.written);
            let count = (decimated - offset).min(slot.len() - self.write_offset);
            for (dst, &src) in slot[self.write_offset..self.write_offset + count]
                .iter()
                .zip(&self.scratch[offset..offset + count])
            {
                dst.store(src, Ordering::Relaxed);
            }

            offset += count;
            self.write_offset += count;
            if self.write_offset == slot.len() {
                self.advance();
            }
        }

        exceeded
    }

    fn advance(&mut self) {
        self.write_offset = 0;
        self.written = self.written.wrapping_add(1);
        self.shared.written.store(self.written, Ordering::Release);

        // The slot now being filled still holds unread data
        let read = self.shared.read.load(Ordering::Acquire);
        if self.written.wrapping_sub(read) >= NUMBER_OF_BUFFERS as u32 {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
        }

        self.shared
            .threshold(self.written)
            .store(false, Ordering::Relaxed);
    }

    /// Transfers still to be discarded before capture counts
    pub fn warmup_remaining(&self) -> u32 {
        self.warmup_remaining
    }
}

/// Foreground half of the pool
pub struct Consumer {
    shared: Arc<PoolShared>,
    read: u32,
}

impl Consumer {
    /// Completed slots not yet consumed.
    ///
    /// After an overrun this counts only the slots [`Consumer::consume`] can
    /// still hand out, never the one being refilled.
    pub fn available(&self) -> usize {
        let written = self.shared.written.load(Ordering::Acquire);
        (written.wrapping_sub(self.read) as usize).min(NUMBER_OF_BUFFERS - 1)
    }

    /// Takes the oldest completed slot.
    ///
    /// The slot is released to the producer when the returned guard drops.
    /// After an overrun the consumer skips ahead to the oldest slot that is
    /// not being refilled.
    pub fn consume(&mut self) -> Option<FilledBuffer<'_>> {
        let written = self.shared.written.load(Ordering::Acquire);
        if written == self.read {
            return None;
        }

        if written.wrapping_sub(self.read) >= NUMBER_OF_BUFFERS as u32 {
            self.read = written.wrapping_sub(NUMBER_OF_BUFFERS as u32 - 1);
            self.shared.read.store(self.read, Ordering::Release);
        }

        let count = self.read;
        self.read = self.read.wrapping_add(1);

        Some(FilledBuffer {
            shared: &self.shared,
            count,
            threshold_exceeded: self.shared.threshold(count).load(Ordering::Relaxed),
        })
    }

    pub fn samples_per_buffer(&self) -> usize {
        self.shared.samples_per_buffer
    }

    /// Times the producer started refilling an unread slot
    pub fn overruns(&self) -> u32 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

/// A completed slot on loan to the consumer
pub struct FilledBuffer<'a> {
    shared: &'a PoolShared,
    count: u32,
    threshold_exceeded: bool,
}

impl FilledBuffer<'_> {
    pub fn threshold_exceeded(&self) -> bool {
        self.threshold_exceeded
    }

    pub fn len(&self) -> usize {
        self.shared.samples_per_buffer
    }

    pub fn is_empty(&self) -> bool {
        self.shared.samples_per_buffer == 0
    }

    pub fn sample(&self, index: usize) -> i16 {
        self.shared.slot(self.count)[index].load(Ordering::Relaxed)
    }

    /// Appends the first `samples` samples as little-endian PCM
    pub fn extend_le_bytes(&self, samples: usize, out: &mut Vec<u8>) {
        for sample in &self.shared.slot(self.count)[..samples] {
            out.extend_from_slice(&sample.load(Ordering::Relaxed).to_le_bytes());
        }
    }
}

impl Drop for FilledBuffer<'_> {
    fn drop(&mut self) {
        self.shared
            .read
            .store(self.count.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigurationIndex, ConfigurationSnapshot};
    use crate::filter::FilterDesign;

    /// Copies every `decimation`-th sample, flags any sample above threshold
    struct PassThrough;

    impl DigitalFilter for PassThrough {
        fn configure(&mut self, _: u32, _: FilterDesign) {}

        fn apply_gain(&mut self, _: f32) {}

        fn filter(&mut self, raw: &[i16], out: &mut [i16], decimation: u32, threshold: u16) -> bool {
            let mut exceeded = false;
            for (o, block) in out.iter_mut().zip(raw.chunks_exact(decimation as usize)) {
                *o = block[0];
                exceeded |= block[0].unsigned_abs() > threshold;
            }
            exceeded
        }
    }

    fn settings(threshold: u16, warmup: u32) -> CaptureSettings {
        let mut config = ConfigurationSnapshot::default();
        config.captures[0].sample_rate = 8_000;
        config.captures[0].sample_rate_divider = 1;
        config.captures[0].amplitude_threshold = threshold;
        let mut settings = CaptureSettings::new(&config, ConfigurationIndex::Standard);
        settings.warmup_transfers = warmup;
        settings
    }

    fn transfer(value: i16) -> Vec<i16> {
        vec![value; 1024]
    }

    #[test]
    fn test_slot_size_rounding() {
        assert_eq!(SampleBufferPool::new(8 * 1024).samples_per_buffer(), 1024);
        assert_eq!(SampleBufferPool::new(8 * 3000).samples_per_buffer(), 2048);
        assert_eq!(SampleBufferPool::new(100).samples_per_buffer(), 1024);
    }

    #[test]
    fn test_produce_then_consume_in_order() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 0));

        assert_eq!(consumer.available(), 0);
        assert!(consumer.consume().is_none());

        for value in 1..=3 {
            producer.produce(&transfer(value));
        }
        assert_eq!(consumer.available(), 3);

        for value in 1..=3 {
            let buffer = consumer.consume().unwrap();
            assert_eq!(buffer.sample(0), value);
            assert_eq!(buffer.sample(1023), value);
        }
        assert_eq!(consumer.available(), 0);
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn test_threshold_flag_accumulates_per_slot() {
        // Two transfers per slot
        let mut config = ConfigurationSnapshot::default();
        config.captures[0].sample_rate = 8_000;
        config.captures[0].sample_rate_divider = 2;
        config.captures[0].amplitude_threshold = 100;
        let mut settings = CaptureSettings::new(&config, ConfigurationIndex::Standard);
        settings.warmup_transfers = 0;
        assert_eq!(settings.decimated_transfer_samples(), 512);

        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings);

        assert!(producer.produce(&transfer(500)));
        assert!(!producer.produce(&transfer(0)));
        assert!(!producer.produce(&transfer(0)));
        assert!(!producer.produce(&transfer(0)));

        assert!(consumer.consume().unwrap().threshold_exceeded());
        assert!(!consumer.consume().unwrap().threshold_exceeded());
    }

    #[test]
    fn test_warmup_transfers_are_discarded() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 2));

        producer.produce(&transfer(11));
        producer.produce(&transfer(12));
        assert_eq!(producer.warmup_remaining(), 0);
        assert_eq!(consumer.available(), 0);

        producer.produce(&transfer(13));
        assert_eq!(consumer.consume().unwrap().sample(0), 13);
    }

    #[test]
    fn test_overrun_overwrites_oldest_and_is_counted() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 0));

        for value in 0..10 {
            producer.produce(&transfer(value));
        }

        // Completing slots 7, 8 and 9 started refills of unread slots
        assert_eq!(consumer.overruns(), 3);

        // Oldest slot not being refilled holds the fourth transfer
        assert_eq!(consumer.consume().unwrap().sample(0), 3);
        assert_eq!(consumer.available(), 6);
    }

    #[test]
    fn test_available_is_bounded_after_overrun() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 0));

        for value in 0..7 {
            producer.produce(&transfer(value));
        }
        assert_eq!(consumer.available(), 7);
        assert_eq!(consumer.overruns(), 0);

        for value in 7..10 {
            producer.produce(&transfer(value));
        }
        assert_eq!(consumer.overruns(), 3);
        assert_eq!(consumer.available(), NUMBER_OF_BUFFERS - 1);

        // Every slot reported as available can be consumed
        let mut consumed = 0;
        while consumer.consume().is_some() {
            consumed += 1;
        }
        assert_eq!(consumed, NUMBER_OF_BUFFERS - 1);
        assert_eq!(consumer.available(), 0);
    }

    #[test]
    fn test_release_on_drop() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 0));

        for value in 0..8 {
            producer.produce(&transfer(value));
            drop(consumer.consume());
        }
        assert_eq!(consumer.overruns(), 0);
    }

    #[test]
    fn test_extend_le_bytes() {
        let (mut producer, mut consumer) =
            SampleBufferPool::new(8 * 1024).split(PassThrough, &settings(100, 0));
        producer.produce(&transfer(-2));

        let mut bytes = Vec::new();
        consumer.consume().unwrap().extend_le_bytes(2, &mut bytes);
        assert_eq!(bytes, [0xFE, 0xFF, 0xFE, 0xFF]);
    }
}
