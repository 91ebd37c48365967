// src/track.rs

use crate::error::{LoopError, Result};
use crate::filter::{FILTER_OPEN_HZ, MIN_CUTOFF_HZ};
use crate::gesture::Gesture;
use crate::latency::PhaseCorrection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub const MIN_VOLUME_DB: f32 = -60.0;
pub const MAX_VOLUME_DB: f32 = 12.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Instrument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    Empty,
    Armed,
    Capturing,
    HasContent,
}

impl TrackState {
    pub fn is_busy(self) -> bool {
        matches!(self, TrackState::Armed | TrackState::Capturing)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixParams {
    pub volume_db: f32,
    pub pan: f32,
    pub muted: bool,
    /// Low-pass cutoff; `FILTER_OPEN_HZ` leaves the unit unfiltered.
    pub filter_cutoff_hz: f32,
}

impl Default for MixParams {
    fn default() -> Self {
        Self {
            volume_db: 0.0,
            pan: 0.0,
            muted: false,
            filter_cutoff_hz: FILTER_OPEN_HZ,
        }
    }
}

/// A finished audio recording. Samples are mono at `sample_rate`.
#[derive(Clone, Debug)]
pub struct AudioClip {
    pub samples: Arc<Vec<f32>>,
    pub sample_rate: u32,
    pub correction: PhaseCorrection,
}

impl AudioClip {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Clone, Debug)]
pub enum TrackContent {
    Audio(AudioClip),
    Gesture(Gesture),
}

/// Content that can be replayed against the transport.
pub trait Playable {
    /// Length of one repetition in seconds at the given tempo.
    fn duration_secs(&self, seconds_per_beat: f64) -> f64;
    fn is_empty(&self) -> bool;
}

impl Playable for AudioClip {
    fn duration_secs(&self, _seconds_per_beat: f64) -> f64 {
        AudioClip::duration_secs(self)
    }

    fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

impl Playable for Gesture {
    fn duration_secs(&self, seconds_per_beat: f64) -> f64 {
        self.duration_beats() * seconds_per_beat
    }

    fn is_empty(&self) -> bool {
        self.points().is_empty()
    }
}

impl Playable for TrackContent {
    fn duration_secs(&self, seconds_per_beat: f64) -> f64 {
        match self {
            TrackContent::Audio(clip) => Playable::duration_secs(clip, seconds_per_beat),
            TrackContent::Gesture(gesture) => gesture.duration_secs(seconds_per_beat),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            TrackContent::Audio(clip) => Playable::is_empty(clip),
            TrackContent::Gesture(gesture) => Playable::is_empty(gesture),
        }
    }
}

/// Gain, pan, mute and filter, independent of capture state.
pub trait Mixable {
    fn mix(&self) -> &MixParams;
    fn mix_mut(&mut self) -> &mut MixParams;

    fn set_volume_db(&mut self, db: f32) {
        self.mix_mut().volume_db = db.clamp(MIN_VOLUME_DB, MAX_VOLUME_DB);
    }

    fn set_pan(&mut self, pan: f32) {
        self.mix_mut().pan = pan.clamp(-1.0, 1.0);
    }

    fn set_muted(&mut self, muted: bool) {
        self.mix_mut().muted = muted;
    }

    fn set_filter_cutoff_hz(&mut self, hz: f32) {
        self.mix_mut().filter_cutoff_hz = hz.clamp(MIN_CUTOFF_HZ, FILTER_OPEN_HZ);
    }

    fn linear_gain(&self) -> f32 {
        db_to_gain(self.mix().volume_db)
    }

    /// Equal-power pan gains, (left, right).
    fn pan_gains(&self) -> (f32, f32) {
        let angle = (self.mix().pan + 1.0) * std::f32::consts::FRAC_PI_4;
        (angle.cos(), angle.sin())
    }
}

/// A unit that can be armed for loop capture.
pub trait Recordable {
    fn kind(&self) -> TrackKind;
    fn ensure_recordable(&self) -> Result<()>;
}

pub fn db_to_gain(db: f32) -> f32 {
    if db <= MIN_VOLUME_DB {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

#[derive(Clone, Debug)]
pub struct Track {
    pub id: UnitId,
    pub kind: TrackKind,
    pub name: String,
    state: TrackState,
    content: Option<TrackContent>,
    mix: MixParams,
}

impl Track {
    pub fn new(id: UnitId, kind: TrackKind) -> Self {
        let name = match kind {
            TrackKind::Audio => format!("Loop #{}", id.0 + 1),
            TrackKind::Instrument => format!("Instrument #{}", id.0 + 1),
        };
        Self {
            id,
            kind,
            name,
            state: TrackState::Empty,
            content: None,
            mix: MixParams::default(),
        }
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TrackState) {
        self.state = state;
    }

    pub fn content(&self) -> Option<&TrackContent> {
        self.content.as_ref()
    }

    pub fn content_mut(&mut self) -> Option<&mut TrackContent> {
        self.content.as_mut()
    }

    pub(crate) fn set_content(&mut self, content: TrackContent) {
        self.content = Some(content);
        self.state = TrackState::HasContent;
    }

    /// Drops the content and returns the unit to `Empty`.
    pub(crate) fn clear(&mut self) -> Option<TrackContent> {
        self.state = TrackState::Empty;
        self.content.take()
    }
}

impl Mixable for Track {
    fn mix(&self) -> &MixParams {
        &self.mix
    }

    fn mix_mut(&mut self) -> &mut MixParams {
        &mut self.mix
    }
}

impl Recordable for Track {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ensure_recordable(&self) -> Result<()> {
        match self.state {
            TrackState::Empty => Ok(()),
            TrackState::HasContent => Err(LoopError::NotEmpty(self.id)),
            TrackState::Armed | TrackState::Capturing => Err(LoopError::AlreadyCapturing),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_new_track_is_empty() {
        let track = Track::new(UnitId(0), TrackKind::Audio);
        assert_eq!(track.state(), TrackState::Empty);
        assert!(track.content().is_none());
        assert_eq!(track.name, "Loop #1");
        assert!(track.ensure_recordable().is_ok());
    }

    #[test]
    fn test_mix_params_are_clamped() {
        let mut track = Track::new(UnitId(1), TrackKind::Instrument);
        track.set_pan(3.0);
        track.set_volume_db(40.0);
        track.set_filter_cutoff_hz(5.0);
        assert_eq!(track.mix().pan, 1.0);
        assert_eq!(track.mix().volume_db, MAX_VOLUME_DB);
        assert_eq!(track.mix().filter_cutoff_hz, MIN_CUTOFF_HZ);
        track.set_filter_cutoff_hz(96_000.0);
        assert_eq!(track.mix().filter_cutoff_hz, FILTER_OPEN_HZ);
    }

    #[test]
    fn test_playable_content() {
        let gesture = crate::gesture::preset("long_sweep").unwrap();
        let content = TrackContent::Gesture(gesture.clone());
        assert!(!Playable::is_empty(&content));
        assert_relative_eq!(content.duration_secs(0.5), gesture.duration_beats() * 0.5);

        let silent = TrackContent::Audio(AudioClip {
            samples: Arc::new(Vec::new()),
            sample_rate: 1000,
            correction: PhaseCorrection::default(),
        });
        assert!(Playable::is_empty(&silent));
        assert_eq!(silent.duration_secs(0.5), 0.0);
    }

    #[test]
    fn test_center_pan_is_equal_power() {
        let track = Track::new(UnitId(2), TrackKind::Audio);
        let (l, r) = track.pan_gains();
        assert_relative_eq!(l, r, epsilon = 1e-6);
        assert_relative_eq!(l * l + r * r, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_db_to_gain() {
        assert_relative_eq!(db_to_gain(0.0), 1.0);
        assert_relative_eq!(db_to_gain(-6.0), 0.501, epsilon = 1e-3);
        assert_eq!(db_to_gain(MIN_VOLUME_DB), 0.0);
    }

    #[test]
    fn test_clip_duration() {
        let clip = AudioClip {
            samples: Arc::new(vec![0.0; 24_000]),
            sample_rate: 48_000,
            correction: PhaseCorrection::default(),
        };
        assert_relative_eq!(clip.duration_secs(), 0.5);
    }

    #[test]
    fn test_track_with_content_is_not_recordable() {
        let mut track = Track::new(UnitId(3), TrackKind::Audio);
        track.set_content(TrackContent::Audio(AudioClip {
            samples: Arc::new(vec![0.1; 4]),
            sample_rate: 4,
            correction: PhaseCorrection::default(),
        }));
        assert_eq!(track.state(), TrackState::HasContent);
        assert_eq!(track.ensure_recordable(), Err(LoopError::NotEmpty(UnitId(3))));
        assert!(track.clear().is_some());
        assert_eq!(track.state(), TrackState::Empty);
    }
}
