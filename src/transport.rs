// src/transport.rs

//! The shared master loop clock.
//!
//! `ClockSource` is the contract the recording core consumes; `Transport` is
//! the process-wide implementation. Musical time is counted in beats, so a
//! tempo change re-times everything that is keyed to transport position.

use crate::error::{LoopError, Result};
use crate::recorder::SessionId;
use std::cmp::Ordering;

pub const DEFAULT_TEMPO_BPM: f64 = 120.0;
pub const DEFAULT_BEATS_PER_MEASURE: u32 = 4;
pub const DEFAULT_LOOP_MEASURES: u32 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Stopped,
    Running,
}

/// Position inside the current loop cycle, bars:beats.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopPosition {
    pub bar: u32,
    /// Beat within the bar, fractional.
    pub beat: f64,
}

impl PartialOrd for LoopPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match self.bar.cmp(&other.bar) {
            Ordering::Equal => self.beat.partial_cmp(&other.beat),
            ord => Some(ord),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(pub u64);

/// What a scheduled clock event asks the recorder to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockAction {
    BeginCapture(SessionId),
    EndCapture(SessionId),
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trigger {
    At(f64),
    NextLoopStart,
}

#[derive(Clone, Copy, Debug)]
struct ScheduledEvent {
    id: EventId,
    trigger: Trigger,
    action: ClockAction,
}

/// A scheduled event that became due, with the absolute beat it fired at.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FiredEvent {
    pub id: EventId,
    pub action: ClockAction,
    pub at_beats: f64,
}

pub trait ClockSource {
    fn position(&self) -> LoopPosition;
    /// Beats elapsed since the transport last started from zero.
    fn absolute_beats(&self) -> f64;
    /// Beats elapsed inside the current loop cycle.
    fn loop_beats(&self) -> f64;
    fn loops_completed(&self) -> u64;
    fn loop_length(&self) -> u32;
    fn set_loop_length(&mut self, beats: u32) -> Result<()>;
    fn beats_per_measure(&self) -> u32;
    fn tempo(&self) -> f64;
    fn set_tempo(&mut self, bpm: f64) -> Result<()>;
    fn schedule_at(&mut self, beats: f64, action: ClockAction) -> EventId;
    fn schedule_at_next_loop_start(&mut self, action: ClockAction) -> EventId;
    fn cancel(&mut self, id: EventId) -> bool;
    fn is_running(&self) -> bool;

    fn seconds_per_beat(&self) -> f64 {
        60.0 / self.tempo()
    }

    fn loop_duration_secs(&self) -> f64 {
        self.loop_length() as f64 * self.seconds_per_beat()
    }
}

pub struct Transport {
    tempo_bpm: f64,
    beats_per_measure: u32,
    loop_length_beats: u32,
    state: TransportState,
    loop_position: f64,
    absolute_beats: f64,
    loops_completed: u64,
    pending: Vec<ScheduledEvent>,
    next_event_id: u64,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(
            DEFAULT_TEMPO_BPM,
            DEFAULT_BEATS_PER_MEASURE,
            DEFAULT_LOOP_MEASURES * DEFAULT_BEATS_PER_MEASURE,
        )
    }
}

impl Transport {
    pub fn new(tempo_bpm: f64, beats_per_measure: u32, loop_length_beats: u32) -> Self {
        let beats_per_measure = beats_per_measure.max(1);
        let loop_length_beats = if loop_length_beats == 0 || loop_length_beats % beats_per_measure != 0
        {
            DEFAULT_LOOP_MEASURES * beats_per_measure
        } else {
            loop_length_beats
        };
        Self {
            tempo_bpm: if tempo_bpm.is_finite() && tempo_bpm > 0.0 {
                tempo_bpm
            } else {
                DEFAULT_TEMPO_BPM
            },
            beats_per_measure,
            loop_length_beats,
            state: TransportState::Stopped,
            loop_position: 0.0,
            absolute_beats: 0.0,
            loops_completed: 0,
            pending: Vec::new(),
            next_event_id: 0,
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    /// Starts the transport. Starting from a rewound position is itself a
    /// loop start, so pending loop-start events fire immediately.
    pub fn start(&mut self) -> Vec<FiredEvent> {
        if self.state == TransportState::Running {
            return Vec::new();
        }
        self.state = TransportState::Running;
        tracing::info!(tempo = self.tempo_bpm, loop_beats = self.loop_length_beats, "transport started");
        if self.loop_position == 0.0 {
            self.take_loop_start_events()
        } else {
            Vec::new()
        }
    }

    /// Stops and rewinds to the top of the loop.
    pub fn stop(&mut self) {
        self.state = TransportState::Stopped;
        self.loop_position = 0.0;
        self.absolute_beats = 0.0;
        self.loops_completed = 0;
        tracing::info!("transport stopped");
    }

    /// Moves time forward and returns the events that became due, oldest first.
    pub fn advance(&mut self, seconds: f64) -> Vec<FiredEvent> {
        let mut fired = Vec::new();
        if self.state != TransportState::Running || seconds.is_nan() || seconds <= 0.0 {
            return fired;
        }
        let mut remaining = seconds * self.tempo_bpm / 60.0;
        let loop_len = self.loop_length_beats as f64;

        loop {
            let to_wrap = (loop_len - self.loop_position).max(0.0);
            if remaining >= to_wrap {
                let wrap_at = self.absolute_beats + to_wrap;
                self.take_due_events(wrap_at, &mut fired);
                self.absolute_beats = wrap_at;
                self.loop_position = 0.0;
                self.loops_completed += 1;
                remaining -= to_wrap;
                fired.extend(self.take_loop_start_events());
                if remaining <= 0.0 {
                    break;
                }
            } else {
                self.absolute_beats += remaining;
                self.loop_position += remaining;
                let now = self.absolute_beats;
                self.take_due_events(now, &mut fired);
                break;
            }
        }
        fired
    }

    fn take_due_events(&mut self, up_to: f64, fired: &mut Vec<FiredEvent>) {
        let mut due: Vec<FiredEvent> = Vec::new();
        self.pending.retain(|event| match event.trigger {
            Trigger::At(at) if at <= up_to => {
                due.push(FiredEvent {
                    id: event.id,
                    action: event.action,
                    at_beats: at,
                });
                false
            }
            _ => true,
        });
        due.sort_by(|a, b| a.at_beats.total_cmp(&b.at_beats));
        fired.extend(due);
    }

    fn take_loop_start_events(&mut self) -> Vec<FiredEvent> {
        let at_beats = self.absolute_beats;
        let mut due = Vec::new();
        self.pending.retain(|event| {
            if event.trigger == Trigger::NextLoopStart {
                due.push(FiredEvent {
                    id: event.id,
                    action: event.action,
                    at_beats,
                });
                false
            } else {
                true
            }
        });
        due
    }

    fn push_event(&mut self, trigger: Trigger, action: ClockAction) -> EventId {
        let id = EventId(self.next_event_id);
        self.next_event_id += 1;
        self.pending.push(ScheduledEvent {
            id,
            trigger,
            action,
        });
        id
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    /// Changes the meter and loop length together, used when restoring a session.
    pub fn set_meter(&mut self, beats_per_measure: u32, loop_length_beats: u32) -> Result<()> {
        if beats_per_measure == 0 || loop_length_beats == 0 || loop_length_beats % beats_per_measure != 0 {
            return Err(LoopError::InvalidLoopLength {
                beats: loop_length_beats,
                beats_per_measure,
            });
        }
        self.beats_per_measure = beats_per_measure;
        self.loop_length_beats = loop_length_beats;
        Ok(())
    }
}

impl ClockSource for Transport {
    fn position(&self) -> LoopPosition {
        let bpm = self.beats_per_measure as f64;
        let bar = (self.loop_position / bpm).floor();
        LoopPosition {
            bar: bar as u32,
            beat: self.loop_position - bar * bpm,
        }
    }

    fn absolute_beats(&self) -> f64 {
        self.absolute_beats
    }

    fn loop_beats(&self) -> f64 {
        self.loop_position
    }

    fn loops_completed(&self) -> u64 {
        self.loops_completed
    }

    fn loop_length(&self) -> u32 {
        self.loop_length_beats
    }

    fn set_loop_length(&mut self, beats: u32) -> Result<()> {
        if beats == 0 || beats % self.beats_per_measure != 0 {
            return Err(LoopError::InvalidLoopLength {
                beats,
                beats_per_measure: self.beats_per_measure,
            });
        }
        self.loop_length_beats = beats;
        tracing::info!(loop_beats = beats, "loop length changed");
        Ok(())
    }

    fn beats_per_measure(&self) -> u32 {
        self.beats_per_measure
    }

    fn tempo(&self) -> f64 {
        self.tempo_bpm
    }

    fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        if !bpm.is_finite() || bpm <= 0.0 {
            return Err(LoopError::InvalidTempo(bpm));
        }
        self.tempo_bpm = bpm;
        tracing::info!(tempo = bpm, "tempo changed");
        Ok(())
    }

    fn schedule_at(&mut self, beats: f64, action: ClockAction) -> EventId {
        self.push_event(Trigger::At(beats), action)
    }

    fn schedule_at_next_loop_start(&mut self, action: ClockAction) -> EventId {
        self.push_event(Trigger::NextLoopStart, action)
    }

    fn cancel(&mut self, id: EventId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|event| event.id != id);
        self.pending.len() != before
    }

    fn is_running(&self) -> bool {
        self.state == TransportState::Running
    }
}
