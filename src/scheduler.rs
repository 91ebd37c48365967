// src/scheduler.rs

//! Keeps finished units playing in phase with the transport.
//!
//! A binding holds timing only. Content is looked up in the registry at
//! render time, so deleting a unit releases its content even if the binding
//! lingers for a tick. There is at most one binding per unit; binding again
//! replaces the previous one.
//!
//! Each unit runs through its own low-pass filter and peak meter. A preview
//! voice sounds the pointer's note while it is held down.

use crate::filter::LowPass;
use crate::gesture::Coord;
use crate::latency::{LatencyCompensator, PhaseCorrection};
use crate::notation::{self, Note, Voice};
use crate::registry::TrackRegistry;
use crate::track::{Mixable, TrackContent, TrackKind, UnitId};
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Binding {
    pub unit: UnitId,
    pub kind: TrackKind,
    pub generation: u64,
    pub correction: PhaseCorrection,
    /// Loop-relative beat at which a gesture's first point plays.
    pub gesture_start_beats: f64,
}

/// Transport snapshot at the first frame of a render block.
#[derive(Clone, Copy, Debug)]
pub struct RenderClock {
    pub loop_beats: f64,
    pub loop_length_beats: f64,
    pub absolute_beats: f64,
    pub beats_per_measure: u32,
    pub seconds_per_beat: f64,
    pub running: bool,
}

pub struct PlaybackScheduler {
    bindings: BTreeMap<UnitId, Binding>,
    voices: HashMap<UnitId, Voice>,
    coordinates: HashMap<UnitId, Coord>,
    filters: HashMap<UnitId, LowPass>,
    /// Peak of each unit's output over the last rendered block, 0..=1.
    levels: HashMap<UnitId, f32>,
    preview: Voice,
    preview_note: Option<Note>,
    next_generation: u64,
    sample_rate: u32,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            bindings: BTreeMap::new(),
            voices: HashMap::new(),
            coordinates: HashMap::new(),
            filters: HashMap::new(),
            levels: HashMap::new(),
            preview: Voice::new(sample_rate.max(1) as f32),
            preview_note: None,
            next_generation: 0,
            sample_rate: sample_rate.max(1),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Binds `content` for looped playback, replacing any existing binding
    /// for the unit.
    pub fn bind(&mut self, unit: UnitId, content: &TrackContent) -> Binding {
        let generation = self.next_generation;
        self.next_generation += 1;
        let binding = match content {
            TrackContent::Audio(clip) => Binding {
                unit,
                kind: TrackKind::Audio,
                generation,
                correction: clip.correction,
                gesture_start_beats: 0.0,
            },
            TrackContent::Gesture(gesture) => {
                self.voices
                    .entry(unit)
                    .or_insert_with(|| Voice::new(self.sample_rate as f32));
                Binding {
                    unit,
                    kind: TrackKind::Instrument,
                    generation,
                    correction: PhaseCorrection::default(),
                    gesture_start_beats: gesture.start_offset_beats(),
                }
            }
        };
        if self.bindings.insert(unit, binding).is_some() {
            tracing::debug!(unit = %unit, generation, "rebound");
        } else {
            tracing::debug!(unit = %unit, generation, "bound");
        }
        binding
    }

    pub fn unbind(&mut self, unit: UnitId) -> bool {
        self.voices.remove(&unit);
        self.coordinates.remove(&unit);
        self.filters.remove(&unit);
        self.levels.remove(&unit);
        self.bindings.remove(&unit).is_some()
    }

    pub fn unbind_all(&mut self) {
        self.bindings.clear();
        self.voices.clear();
        self.coordinates.clear();
        self.filters.clear();
        self.levels.clear();
    }

    /// Output peak of a unit over the last rendered block. Unbound and
    /// muted units read 0.
    pub fn level(&self, unit: UnitId) -> f32 {
        self.levels.get(&unit).copied().unwrap_or(0.0)
    }

    /// Sounds the note under the pointer, or releases it when the pointer
    /// lifts.
    pub fn set_preview(&mut self, pointer: Option<Coord>) {
        match pointer {
            Some(c) => {
                let note = notation::note_for(c);
                if self.preview_note.is_none() {
                    tracing::debug!(note = %notation::note_name(note.midi), "preview on");
                }
                self.preview.play(note);
                self.preview_note = Some(note);
            }
            None => {
                self.preview.release();
                self.preview_note = None;
            }
        }
    }

    pub fn preview_note(&self) -> Option<Note> {
        self.preview_note
    }

    pub fn binding(&self, unit: UnitId) -> Option<&Binding> {
        self.bindings.get(&unit)
    }

    pub fn is_bound(&self, unit: UnitId) -> bool {
        self.bindings.contains_key(&unit)
    }

    /// Number of live playback instances.
    pub fn active_count(&self) -> usize {
        self.bindings.len()
    }

    /// Recomputes every audio correction against the current loop length
    /// and rebinds all units. Returns how many were rebound.
    pub fn rebind_all(&mut self, registry: &mut TrackRegistry, loop_duration_secs: f64) -> usize {
        let units: Vec<UnitId> = self.bindings.keys().copied().collect();
        let mut rebound = 0;
        for unit in units {
            let Ok(track) = registry.get_mut(unit) else {
                self.unbind(unit);
                continue;
            };
            let Some(content) = track.content_mut() else {
                self.unbind(unit);
                continue;
            };
            if let TrackContent::Audio(clip) = content {
                clip.correction = LatencyCompensator::recompute(loop_duration_secs, clip.duration_secs());
            }
            self.bind(unit, content);
            rebound += 1;
        }
        rebound
    }

    /// Sample index an audio unit reads at `loop_secs` into the loop, or
    /// `None` while it is silent (before its start offset or past its end).
    pub fn read_position(binding: &Binding, loop_secs: f64, sample_rate: u32, len: usize) -> Option<usize> {
        let into_content = loop_secs - binding.correction.start_offset_secs;
        if into_content < 0.0 {
            return None;
        }
        let idx = (into_content * sample_rate as f64) as usize
            + LatencyCompensator::preroll_samples(&binding.correction, sample_rate);
        (idx < len).then_some(idx)
    }

    /// Latest replayed coordinate of an instrument unit.
    pub fn current_coordinate(&self, unit: UnitId) -> Option<Coord> {
        self.coordinates.get(&unit).copied()
    }

    /// Advances gesture replay to `loop_beats` and retunes instrument voices.
    pub fn update_gestures(&mut self, registry: &TrackRegistry, loop_beats: f64, running: bool) {
        for binding in self.bindings.values() {
            if binding.kind != TrackKind::Instrument {
                continue;
            }
            let gesture = match registry.get(binding.unit).and_then(|t| t.content()) {
                Some(TrackContent::Gesture(g)) => g,
                _ => continue,
            };
            let coord = if running {
                gesture.coordinate_at(loop_beats - binding.gesture_start_beats)
            } else {
                None
            };
            let voice = self
                .voices
                .entry(binding.unit)
                .or_insert_with(|| Voice::new(self.sample_rate as f32));
            match coord {
                Some(c) => {
                    self.coordinates.insert(binding.unit, c);
                    voice.play(notation::note_for(c));
                }
                None => {
                    self.coordinates.remove(&binding.unit);
                    voice.release();
                }
            }
        }
    }

    /// Mixes every bound unit and the preview voice into `left`/`right`
    /// (added, not overwritten).
    pub fn render(
        &mut self,
        registry: &TrackRegistry,
        clock: RenderClock,
        left: &mut [f32],
        right: &mut [f32],
    ) {
        let frames = left.len().min(right.len());
        let secs_per_frame = 1.0 / self.sample_rate as f64;
        let beats_per_frame = secs_per_frame / clock.seconds_per_beat;
        let loop_len = clock.loop_length_beats.max(f64::EPSILON);
        let sample_rate = self.sample_rate as f32;

        for binding in self.bindings.values() {
            let Some(track) = registry.get(binding.unit) else {
                continue;
            };
            let muted = track.mix().muted;
            let gain = track.linear_gain();
            let cutoff = track.mix().filter_cutoff_hz;
            let (pan_l, pan_r) = track.pan_gains();
            let filter = self
                .filters
                .entry(binding.unit)
                .or_insert_with(|| LowPass::new(sample_rate));
            let mut peak = 0.0f32;

            match track.content() {
                Some(TrackContent::Audio(clip)) => {
                    if !muted && clock.running {
                        for i in 0..frames {
                            let beats = (clock.loop_beats + i as f64 * beats_per_frame).rem_euclid(loop_len);
                            let loop_secs = beats * clock.seconds_per_beat;
                            let dry = Self::read_position(binding, loop_secs, clip.sample_rate, clip.samples.len())
                                .map_or(0.0, |idx| clip.samples[idx]);
                            let s = filter.process(dry, cutoff) * gain;
                            peak = peak.max(s.abs());
                            left[i] += s * pan_l;
                            right[i] += s * pan_r;
                        }
                    }
                }
                Some(TrackContent::Gesture(_)) => {
                    // Voices keep running while muted so unmuting is in phase.
                    if let Some(voice) = self.voices.get_mut(&binding.unit) {
                        for i in 0..frames {
                            let s = filter.process(voice.process(), cutoff) * gain;
                            if !muted {
                                peak = peak.max(s.abs());
                                left[i] += s * pan_l;
                                right[i] += s * pan_r;
                            }
                        }
                    }
                }
                None => {}
            }
            self.levels.insert(binding.unit, peak.clamp(0.0, 1.0));
        }

        let center = std::f32::consts::FRAC_1_SQRT_2;
        for i in 0..frames {
            let s = self.preview.process() * center;
            left[i] += s;
            right[i] += s;
        }
    }
}
