// src/filter.rs

//! Per-unit low-pass filter.
//!
//! A state variable filter with the low-pass tap only. At `FILTER_OPEN_HZ`
//! the filter is fully open and passes samples through untouched.

use std::f32::consts::PI;

pub const MIN_CUTOFF_HZ: f32 = 20.0;
pub const FILTER_OPEN_HZ: f32 = 20_000.0;
const RESONANCE: f32 = 0.1;

#[derive(Clone, Debug)]
pub struct LowPass {
    sample_rate: f32,
    z1: f32,
    z2: f32,
}

impl LowPass {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate: sample_rate.max(1.0),
            z1: 0.0,
            z2: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }

    #[inline]
    pub fn process(&mut self, input: f32, cutoff_hz: f32) -> f32 {
        if cutoff_hz >= FILTER_OPEN_HZ {
            self.reset();
            return input;
        }
        let nyquist_guard = (self.sample_rate / 2.0 - MIN_CUTOFF_HZ).max(MIN_CUTOFF_HZ);
        let cutoff = cutoff_hz.clamp(MIN_CUTOFF_HZ, nyquist_guard);

        let g = (PI * cutoff / self.sample_rate).tan();
        let k = 2.0 - 2.0 * RESONANCE;
        let a1 = 1.0 / (1.0 + g * (g + k));
        let a2 = g * a1;
        let a3 = g * a2;

        let v3 = input - self.z2;
        let v1 = a1 * self.z1 + a2 * v3;
        let v2 = self.z2 + a2 * self.z1 + a3 * v3;

        // Clamp to keep the state out of denormals.
        self.z1 = (2.0 * v1 - self.z1).clamp(-1e6, 1e6);
        self.z2 = (2.0 * v2 - self.z2).clamp(-1e6, 1e6);
        v2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn peak_of_sine(freq: f32, cutoff: f32) -> f32 {
        let sr = 48_000.0;
        let mut f = LowPass::new(sr);
        let mut peak = 0.0f32;
        for i in 0..48_000 {
            let s = (i as f32 / sr * freq * std::f32::consts::TAU).sin();
            let out = f.process(s, cutoff);
            // Skip the settling time.
            if i > 24_000 {
                peak = peak.max(out.abs());
            }
        }
        peak
    }

    #[test]
    fn test_open_filter_passes_through() {
        let mut f = LowPass::new(48_000.0);
        for s in [0.5, -0.25, 0.9] {
            assert_eq!(f.process(s, FILTER_OPEN_HZ), s);
        }
    }

    #[test]
    fn test_low_cutoff_attenuates_highs() {
        let passed = peak_of_sine(100.0, 1000.0);
        let cut = peak_of_sine(8000.0, 1000.0);
        assert_relative_eq!(passed, 1.0, epsilon = 0.1);
        assert!(cut < 0.1, "8 kHz leaked through at {cut}");
    }

    #[test]
    fn test_dc_settles_to_input() {
        let mut f = LowPass::new(1000.0);
        let mut out = 0.0;
        for _ in 0..2000 {
            out = f.process(0.3, 200.0);
        }
        assert_relative_eq!(out, 0.3, epsilon = 1e-3);
    }

    #[test]
    fn test_cutoff_is_clamped_at_low_sample_rates() {
        let mut f = LowPass::new(30.0);
        assert!(f.process(1.0, 5_000.0).is_finite());
    }
}
