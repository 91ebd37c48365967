// src/latency.rs

//! Phase correction between the nominal loop length and what a capture
//! actually delivered.
//!
//! The correction is `nominal - actual`. A positive value (short capture,
//! the usual device-buffering case) delays playback start within the loop.
//! A negative value cannot be expressed as a start time, so the start is
//! clamped to zero and the overshoot is skipped at the head of the buffer
//! instead ("pre-roll"). Either way the content lines up with the loop end.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseCorrection {
    /// Signed `nominal - actual`, in seconds.
    pub correction_secs: f64,
    /// Loop-relative time at which playback starts. Never negative.
    pub start_offset_secs: f64,
    /// Seconds skipped at the head of the content. Never negative.
    pub preroll_secs: f64,
}

impl PhaseCorrection {
    pub fn from_correction(correction_secs: f64) -> Self {
        if correction_secs >= 0.0 {
            Self {
                correction_secs,
                start_offset_secs: correction_secs,
                preroll_secs: 0.0,
            }
        } else {
            Self {
                correction_secs,
                start_offset_secs: 0.0,
                preroll_secs: -correction_secs,
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LatencyCompensator;

impl LatencyCompensator {
    pub fn compensate(nominal_secs: f64, actual_secs: f64) -> PhaseCorrection {
        let correction = PhaseCorrection::from_correction(nominal_secs - actual_secs);
        tracing::debug!(
            nominal = nominal_secs,
            actual = actual_secs,
            correction = correction.correction_secs,
            "latency compensation"
        );
        correction
    }

    /// Recomputes the correction for content whose captured length is fixed
    /// but whose loop may have changed since (session load, tempo or length
    /// edits).
    pub fn recompute(loop_duration_secs: f64, captured_secs: f64) -> PhaseCorrection {
        Self::compensate(loop_duration_secs, captured_secs)
    }

    /// Samples to skip at the head of a buffer for the given pre-roll.
    pub fn preroll_samples(correction: &PhaseCorrection, sample_rate: u32) -> usize {
        (correction.preroll_secs * sample_rate as f64).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_exact_capture_needs_no_correction() {
        let c = LatencyCompensator::compensate(8.0, 8.0);
        assert_eq!(c, PhaseCorrection::default());
    }

    #[test]
    fn test_short_capture_delays_start() {
        let c = LatencyCompensator::compensate(8.0, 7.95);
        assert_relative_eq!(c.correction_secs, 0.05, epsilon = 1e-9);
        assert_relative_eq!(c.start_offset_secs, 0.05, epsilon = 1e-9);
        assert_eq!(c.preroll_secs, 0.0);
    }

    #[test]
    fn test_long_capture_clamps_start_and_prerolls() {
        let c = LatencyCompensator::compensate(8.0, 8.12);
        assert_relative_eq!(c.correction_secs, -0.12, epsilon = 1e-9);
        assert_eq!(c.start_offset_secs, 0.0);
        assert_relative_eq!(c.preroll_secs, 0.12, epsilon = 1e-9);
    }

    #[test]
    fn test_alignment_is_preserved_either_way() {
        for actual in [7.5, 7.99, 8.0, 8.01, 8.7] {
            let c = LatencyCompensator::compensate(8.0, actual);
            // start + audible content == loop length
            assert_relative_eq!(
                c.start_offset_secs + actual - c.preroll_secs,
                8.0,
                epsilon = 1e-9
            );
        }
    }

    #[test]
    fn test_preroll_samples() {
        let c = PhaseCorrection::from_correction(-0.12);
        assert_eq!(LatencyCompensator::preroll_samples(&c, 48_000), 5_760);
    }
}
