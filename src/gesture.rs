// src/gesture.rs

//! Recorded 2D control gestures.
//!
//! A gesture is a list of `{t, c}` points, `t` in transport beats and `c` a
//! coordinate in the unit square. Replay is keyed by transport beats, not
//! wall-clock time, so a tempo change re-times playback automatically.

use serde::{Deserialize, Serialize};

/// Duration used when a gesture has no measurable length (single sample).
pub const DEFAULT_GESTURE_DURATION_BEATS: f64 = 1.0;
const MIN_GESTURE_DURATION_BEATS: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f32,
    pub y: f32,
}

impl Coord {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x: x.clamp(0.0, 1.0),
            y: y.clamp(0.0, 1.0),
        }
    }

    fn lerp(self, other: Coord, progress: f32) -> Coord {
        Coord {
            x: self.x + progress * (other.x - self.x),
            y: self.y + progress * (other.y - self.y),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GesturePoint {
    pub t: f64,
    pub c: Coord,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Gesture {
    points: Vec<GesturePoint>,
    /// Beats between the loop start and the first point.
    start_offset_beats: f64,
}

impl Gesture {
    /// Builds a gesture re-based so the first point sits at `t = 0`.
    /// Points that go back in time are dropped. Returns `None` when empty.
    pub fn from_points(raw: Vec<GesturePoint>, start_offset_beats: f64) -> Option<Self> {
        let origin = raw.first()?.t;
        let mut points: Vec<GesturePoint> = Vec::with_capacity(raw.len());
        for p in raw {
            let t = p.t - origin;
            if points.last().map_or(true, |last| t >= last.t) {
                points.push(GesturePoint {
                    t,
                    c: Coord::new(p.c.x, p.c.y),
                });
            }
        }
        Some(Self {
            points,
            start_offset_beats: start_offset_beats.max(0.0),
        })
    }

    pub fn points(&self) -> &[GesturePoint] {
        &self.points
    }

    pub fn start_offset_beats(&self) -> f64 {
        self.start_offset_beats
    }

    pub fn duration_beats(&self) -> f64 {
        match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) if last.t - first.t > MIN_GESTURE_DURATION_BEATS => {
                last.t - first.t
            }
            _ => DEFAULT_GESTURE_DURATION_BEATS,
        }
    }

    /// Coordinate at `beats_since_start`, looping forever with linear
    /// interpolation between the two bracketing points.
    pub fn coordinate_at(&self, beats_since_start: f64) -> Option<Coord> {
        if beats_since_start < 0.0 || !beats_since_start.is_finite() {
            return None;
        }
        let first = *self.points.first()?;
        let last = *self.points.last()?;
        let local = beats_since_start.rem_euclid(self.duration_beats());

        let (mut prev, mut next) = (first, last);
        for pair in self.points.windows(2) {
            if pair[1].t >= local {
                prev = pair[0];
                next = pair[1];
                break;
            }
        }

        let range = next.t - prev.t;
        let progress = if range > 0.0 {
            ((local - prev.t) / range).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Some(prev.c.lerp(next.c, progress as f32))
    }
}

/// Accumulates pointer samples while an Instrument unit is capturing.
#[derive(Debug)]
pub struct GestureSampler {
    capture_start_beats: f64,
    points: Vec<GesturePoint>,
}

impl GestureSampler {
    pub fn new(capture_start_beats: f64) -> Self {
        Self {
            capture_start_beats,
            points: Vec::new(),
        }
    }

    /// Records a sample if the pointer is active. Returns whether a point was taken.
    pub fn sample(&mut self, t_beats: f64, pointer: Option<Coord>) -> bool {
        match pointer {
            Some(c) => {
                self.points.push(GesturePoint {
                    t: t_beats,
                    c: Coord::new(c.x, c.y),
                });
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn finish(self) -> Option<Gesture> {
        let first_t = self.points.first()?.t;
        Gesture::from_points(self.points, first_t - self.capture_start_beats)
    }
}

// --- Preset gestures ---

pub const PRESET_NAMES: [&str; 3] = ["single_note", "quick_rise", "long_sweep"];

fn points(raw: &[(f64, f32, f32)]) -> Vec<GesturePoint> {
    raw.iter()
        .map(|&(t, x, y)| GesturePoint {
            t,
            c: Coord::new(x, y),
        })
        .collect()
}

pub fn preset(name: &str) -> Option<Gesture> {
    let raw = match name {
        "single_note" => points(&[(0.0, 0.5, 0.8), (1.0, 0.5, 0.8)]),
        "quick_rise" => points(&[(0.0, 0.1, 0.9), (0.5, 0.9, 0.9)]),
        "long_sweep" => points(&[
            (0.0, 0.1, 0.2),
            (1.0, 0.3, 0.8),
            (2.0, 0.6, 0.4),
            (3.0, 0.8, 0.9),
            (4.0, 1.0, 0.5),
        ]),
        _ => return None,
    };
    Gesture::from_points(raw, 0.0)
}
