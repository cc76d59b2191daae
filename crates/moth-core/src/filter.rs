//! Digital filter seam
//!
//! The producer runs every raw transfer through a [`DigitalFilter`] that
//! decimates, filters and scales it, and reports whether the amplitude
//! threshold was crossed. Hardware builds plug in their own IIR
//! implementation; [`DecimatingFilter`] is a lightweight reference used by
//! the simulator and tests.

use core::f32::consts::PI;

use crate::config::{FILTER_FREQ_MULTIPLIER, FrequencyFilter};

/// Lower edge applied to every design to remove the DC offset
pub const DC_BLOCKING_FREQ: u32 = 48;

/// Filter response requested for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDesign {
    HighPass { cutoff_hz: u32 },
    BandPass { low_hz: u32, high_hz: u32 },
}

impl FilterDesign {
    /// Maps the configured filter onto a design, always keeping the
    /// DC-blocking floor
    pub fn from_config(filter: FrequencyFilter) -> Self {
        match filter {
            FrequencyFilter::None => Self::HighPass {
                cutoff_hz: DC_BLOCKING_FREQ,
            },
            FrequencyFilter::LowPass { high } => Self::BandPass {
                low_hz: DC_BLOCKING_FREQ,
                high_hz: FILTER_FREQ_MULTIPLIER * high as u32,
            },
            FrequencyFilter::HighPass { low } => Self::HighPass {
                cutoff_hz: DC_BLOCKING_FREQ.max(FILTER_FREQ_MULTIPLIER * low as u32),
            },
            FrequencyFilter::BandPass { low, high } => Self::BandPass {
                low_hz: DC_BLOCKING_FREQ.max(FILTER_FREQ_MULTIPLIER * low as u32),
                high_hz: FILTER_FREQ_MULTIPLIER * high as u32,
            },
        }
    }
}

/// Filter collaborator driven from interrupt context
///
/// Implementations must not allocate or block in [`DigitalFilter::filter`].
pub trait DigitalFilter {
    fn configure(&mut self, effective_sample_rate: u32, design: FilterDesign);

    /// Scales every output sample by `multiplier`
    fn apply_gain(&mut self, multiplier: f32);

    /// Decimates `raw` by `decimation` into `out`.
    ///
    /// `out` holds `raw.len() / decimation` samples. Returns whether the
    /// magnitude of any output sample exceeded `threshold`.
    fn filter(&mut self, raw: &[i16], out: &mut [i16], decimation: u32, threshold: u16) -> bool;
}

/// Boxcar decimation followed by first-order high-pass and low-pass stages
#[derive(Debug, Clone)]
pub struct DecimatingFilter {
    high_pass_alpha: f32,
    /// `None` for a pure high-pass design
    low_pass_alpha: Option<f32>,
    gain: f32,
    previous_input: f32,
    previous_high_pass: f32,
    previous_low_pass: f32,
}

impl DecimatingFilter {
    pub fn new() -> Self {
        Self {
            high_pass_alpha: 0.0,
            low_pass_alpha: None,
            gain: 1.0,
            previous_input: 0.0,
            previous_high_pass: 0.0,
            previous_low_pass: 0.0,
        }
    }
}

impl Default for DecimatingFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Smoothing factor of a first-order high-pass stage
fn high_pass_alpha(sample_rate: u32, cutoff_hz: u32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz as f32);
    let dt = 1.0 / sample_rate as f32;
    rc / (rc + dt)
}

/// Smoothing factor of a first-order low-pass stage
fn low_pass_alpha(sample_rate: u32, cutoff_hz: u32) -> f32 {
    let rc = 1.0 / (2.0 * PI * cutoff_hz as f32);
    let dt = 1.0 / sample_rate as f32;
    dt / (rc + dt)
}

impl DigitalFilter for DecimatingFilter {
    fn configure(&mut self, effective_sample_rate: u32, design: FilterDesign) {
        let (low_hz, high_hz) = match design {
            FilterDesign::HighPass { cutoff_hz } => (cutoff_hz, None),
            FilterDesign::BandPass { low_hz, high_hz } => (low_hz, Some(high_hz)),
        };

        self.high_pass_alpha = high_pass_alpha(effective_sample_rate, low_hz);
        self.low_pass_alpha = high_hz.map(|hz| low_pass_alpha(effective_sample_rate, hz));
        self.previous_input = 0.0;
        self.previous_high_pass = 0.0;
        self.previous_low_pass = 0.0;
    }

    fn apply_gain(&mut self, multiplier: f32) {
        self.gain = multiplier;
    }

    fn filter(&mut self, raw: &[i16], out: &mut [i16], decimation: u32, threshold: u16) -> bool {
        let mut exceeded = false;

        for (block, sample) in raw.chunks_exact(decimation as usize).zip(out.iter_mut()) {
            let input = block.iter().map(|&s| s as f32).sum::<f32>();

            let high_pass =
                self.high_pass_alpha * (self.previous_high_pass + input - self.previous_input);
            self.previous_input = input;
            self.previous_high_pass = high_pass;

            let output = match self.low_pass_alpha {
                Some(alpha) => {
                    self.previous_low_pass += alpha * (high_pass - self.previous_low_pass);
                    self.previous_low_pass
                }
                None => high_pass,
            };

            let scaled = (output * self.gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            if scaled.unsigned_abs() > threshold {
                exceeded = true;
            }
            *sample = scaled;
        }

        exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_design_keeps_dc_floor() {
        assert_eq!(
            FilterDesign::from_config(FrequencyFilter::None),
            FilterDesign::HighPass { cutoff_hz: 48 }
        );
        assert_eq!(
            FilterDesign::from_config(FrequencyFilter::LowPass { high: 80 }),
            FilterDesign::BandPass {
                low_hz: 48,
                high_hz: 8000
            }
        );
        assert_eq!(
            FilterDesign::from_config(FrequencyFilter::HighPass { low: 0 }),
            FilterDesign::HighPass { cutoff_hz: 48 }
        );
        assert_eq!(
            FilterDesign::from_config(FrequencyFilter::BandPass { low: 10, high: 40 }),
            FilterDesign::BandPass {
                low_hz: 1000,
                high_hz: 4000
            }
        );
    }

    #[test]
    fn test_dc_input_settles_to_zero() {
        let mut filter = DecimatingFilter::new();
        filter.configure(48_000, FilterDesign::from_config(FrequencyFilter::None));

        let raw = [1000i16; 4096];
        let mut out = [0i16; 512];
        for _ in 0..20 {
            filter.filter(&raw, &mut out, 8, 0);
        }

        assert!(out.iter().all(|s| s.unsigned_abs() < 10));
    }

    #[test]
    fn test_threshold_detection() {
        let mut filter = DecimatingFilter::new();
        filter.configure(48_000, FilterDesign::from_config(FrequencyFilter::None));
        filter.apply_gain(2.0);

        let silent = [0i16; 1024];
        let mut out = [0i16; 128];
        assert!(!filter.filter(&silent, &mut out, 8, 10));

        let mut loud = [0i16; 1024];
        for (i, s) in loud.iter_mut().enumerate() {
            *s = if (i / 64) % 2 == 0 { 500 } else { -500 };
        }
        assert!(filter.filter(&loud, &mut out, 8, 10));
    }

    #[test]
    fn test_decimation_output_length() {
        let mut filter = DecimatingFilter::new();
        filter.configure(8_000, FilterDesign::from_config(FrequencyFilter::None));

        let raw = [7i16; 48];
        let mut out = [i16::MAX; 8];
        filter.filter(&raw, &mut out[..6], 8, 0);

        assert_eq!(out[6], i16::MAX);
        assert_eq!(out[7], i16::MAX);
    }
}
