// src/metronome.rs

use crate::track::db_to_gain;

pub const DEFAULT_METRONOME_VOLUME_DB: f32 = -12.0;
const ACCENT_PITCH_HZ: f32 = 1760.0;
const BEAT_PITCH_HZ: f32 = 880.0;

pub struct Metronome {
    phase: f32,
    envelope: f32,
    sample_rate: f32,
    pitch: f32,
    enabled: bool,
    volume_db: f32,
    last_beat: Option<u64>,
}

impl Metronome {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            phase: 0.0,
            envelope: 0.0,
            sample_rate,
            pitch: BEAT_PITCH_HZ,
            enabled: false,
            volume_db: DEFAULT_METRONOME_VOLUME_DB,
            last_beat: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.envelope = 0.0;
        }
    }

    pub fn volume_db(&self) -> f32 {
        self.volume_db
    }

    pub fn set_volume_db(&mut self, db: f32) {
        self.volume_db = db;
    }

    pub fn reset(&mut self) {
        self.last_beat = None;
        self.envelope = 0.0;
    }

    pub fn trigger(&mut self, pitch_hz: f32) {
        self.envelope = 1.0;
        self.phase = 0.0;
        self.pitch = pitch_hz;
    }

    /// Next click sample for a frame at `absolute_beats`. Clicks fire on
    /// every whole beat, accented on the first beat of each bar.
    pub fn process_at(&mut self, absolute_beats: f64, beats_per_measure: u32) -> f32 {
        let beat = absolute_beats.max(0.0).floor() as u64;
        if self.last_beat != Some(beat) {
            self.last_beat = Some(beat);
            if self.enabled {
                let accent = beat % beats_per_measure.max(1) as u64 == 0;
                self.trigger(if accent { ACCENT_PITCH_HZ } else { BEAT_PITCH_HZ });
            }
        }
        if !self.enabled {
            return 0.0;
        }
        self.process() * db_to_gain(self.volume_db)
    }

    pub fn process(&mut self) -> f32 {
        if self.envelope <= 1e-6 {
            return 0.0;
        }
        let phase_inc = self.pitch / self.sample_rate;
        self.phase = (self.phase + phase_inc) % 1.0;
        let sine_sample = (self.phase * std::f32::consts::TAU).sin();

        let output = sine_sample * self.envelope;
        self.envelope *= 0.999;

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metronome_is_silent() {
        let mut m = Metronome::new(48_000.0);
        for i in 0..1000 {
            assert_eq!(m.process_at(i as f64 * 0.001, 4), 0.0);
        }
    }

    #[test]
    fn test_clicks_on_each_beat_with_accent() {
        let mut m = Metronome::new(48_000.0);
        m.set_enabled(true);
        m.process_at(0.0, 4);
        assert_eq!(m.pitch, ACCENT_PITCH_HZ);
        m.process_at(1.0, 4);
        assert_eq!(m.pitch, BEAT_PITCH_HZ);
        m.process_at(4.0, 4);
        assert_eq!(m.pitch, ACCENT_PITCH_HZ);
    }

    #[test]
    fn test_click_decays() {
        let mut m = Metronome::new(48_000.0);
        m.trigger(880.0);
        let mut last = 0.0;
        for _ in 0..20_000 {
            last = m.process();
        }
        assert!(last.abs() < 1e-3);
    }
}
