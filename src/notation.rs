// src/notation.rs

//! Maps gesture coordinates to notes.
//!
//! X picks a note from a C-major pentatonic scale spanning C2..A7, Y sets the
//! velocity. Loudness follows `-30 + 30 * velocity` dB.

use crate::gesture::Coord;
use crate::track::db_to_gain;

const PENTATONIC_STEPS: [u8; 5] = [0, 2, 4, 7, 9];
const LOWEST_OCTAVE: u8 = 2;
const HIGHEST_OCTAVE: u8 = 7;
pub const SCALE_LEN: usize = PENTATONIC_STEPS.len() * (HIGHEST_OCTAVE - LOWEST_OCTAVE + 1) as usize;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Note {
    pub midi: u8,
    pub velocity: f32,
}

impl Note {
    pub fn frequency_hz(&self) -> f32 {
        440.0 * 2.0_f32.powf((self.midi as f32 - 69.0) / 12.0)
    }

    pub fn volume_db(&self) -> f32 {
        -30.0 + 30.0 * self.velocity
    }

    pub fn gain(&self) -> f32 {
        db_to_gain(self.volume_db())
    }
}

/// MIDI note number of the `index`-th scale degree, clamped to the scale.
pub fn scale_note(index: usize) -> u8 {
    let index = index.min(SCALE_LEN - 1);
    let octave = LOWEST_OCTAVE as usize + index / PENTATONIC_STEPS.len();
    let step = PENTATONIC_STEPS[index % PENTATONIC_STEPS.len()];
    // MIDI octave numbering: C4 = 60.
    (12 * (octave + 1)) as u8 + step
}

pub fn note_for(coord: Coord) -> Note {
    let x = coord.x.clamp(0.0, 1.0);
    let index = (x * (SCALE_LEN - 1) as f32).floor() as usize;
    Note {
        midi: scale_note(index),
        velocity: coord.y.clamp(0.0, 1.0),
    }
}

pub fn note_name(midi: u8) -> String {
    const NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];
    let octave = midi as i32 / 12 - 1;
    format!("{}{}", NAMES[midi as usize % 12], octave)
}

/// A single sine voice that follows the coordinate of an instrument unit.
#[derive(Clone, Debug)]
pub struct Voice {
    phase: f32,
    frequency: f32,
    gain: f32,
    target_gain: f32,
    sample_rate: f32,
}

impl Voice {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            phase: 0.0,
            frequency: 0.0,
            gain: 0.0,
            target_gain: 0.0,
            sample_rate,
        }
    }

    pub fn play(&mut self, note: Note) {
        self.frequency = note.frequency_hz();
        self.target_gain = note.gain();
    }

    pub fn release(&mut self) {
        self.target_gain = 0.0;
    }

    pub fn process(&mut self) -> f32 {
        // One-pole smoothing avoids zipper noise on coordinate jumps.
        self.gain += (self.target_gain - self.gain) * 0.005;
        if self.gain <= 1e-5 && self.target_gain == 0.0 {
            return 0.0;
        }
        self.phase = (self.phase + self.frequency / self.sample_rate) % 1.0;
        (self.phase * std::f32::consts::TAU).sin() * self.gain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scale_bounds() {
        assert_eq!(note_name(scale_note(0)), "C2");
        assert_eq!(note_name(scale_note(SCALE_LEN - 1)), "A7");
        assert_eq!(scale_note(1000), scale_note(SCALE_LEN - 1));
    }

    #[test]
    fn test_coordinate_mapping() {
        let low = note_for(Coord::new(0.0, 0.0));
        assert_eq!(note_name(low.midi), "C2");
        assert_relative_eq!(low.volume_db(), -30.0);
        let high = note_for(Coord::new(1.0, 1.0));
        assert_eq!(note_name(high.midi), "A7");
        assert_relative_eq!(high.volume_db(), 0.0);
    }

    #[test]
    fn test_a4_is_440() {
        // A4 is midi 69
        assert_relative_eq!(Note { midi: 69, velocity: 1.0 }.frequency_hz(), 440.0);
    }

    #[test]
    fn test_voice_fades_out_after_release() {
        let mut v = Voice::new(48_000.0);
        v.play(note_for(Coord::new(0.5, 1.0)));
        for _ in 0..4800 {
            v.process();
        }
        v.release();
        let mut tail = 1.0;
        for _ in 0..48_000 {
            tail = v.process();
        }
        assert!(tail.abs() < 1e-4);
    }
}
