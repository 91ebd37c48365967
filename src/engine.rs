// src/engine.rs

//! The loop engine: one cooperative loop that owns the transport, the units
//! and the capture device.
//!
//! Everything runs on the engine's thread. Other threads talk to it through
//! an `EngineCommand` ring buffer that is drained at the top of every tick.

use crate::capture::CaptureDevice;
use crate::error::{LoopError, Result};
use crate::gesture::{self, Coord, Gesture};
use crate::latency::{LatencyCompensator, PhaseCorrection};
use crate::metronome::{Metronome, DEFAULT_METRONOME_VOLUME_DB};
use crate::recorder::{
    CaptureOutcome, CaptureTicket, CapturedContent, EndDetection, FinishedCapture, LoopRecorder,
    RecorderEvent, RecorderState,
};
use crate::registry::{StateObserver, TrackRegistry};
use crate::scheduler::{PlaybackScheduler, RenderClock};
use crate::session::{self, ContentData, Session, SessionData, TrackData};
use crate::settings::AppSettings;
use crate::notation::Note;
use crate::track::{
    db_to_gain, AudioClip, Mixable, Playable, Track, TrackContent, TrackKind, TrackState, UnitId,
};
use crate::transport::{
    ClockSource, FiredEvent, Transport, DEFAULT_BEATS_PER_MEASURE, DEFAULT_LOOP_MEASURES,
    DEFAULT_TEMPO_BPM,
};
use chrono::Local;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug)]
pub enum EngineCommand {
    CreateUnit(TrackKind),
    ArmUnit(UnitId),
    DeleteUnit(UnitId),
    ClearUnit(UnitId),
    SetMute { unit: UnitId, muted: bool },
    ToggleMute(UnitId),
    SetVolume { unit: UnitId, db: f32 },
    SetPan { unit: UnitId, pan: f32 },
    SetFilterCutoff { unit: UnitId, hz: f32 },
    TogglePlayback,
    SetTempo(f64),
    SetLoopLength(u32),
    SetPointer(Option<Coord>),
    ToggleMetronome,
    SetMetronomeVolume(f32),
    SetMasterVolume(f32),
    LoadPresetGesture { unit: UnitId, name: String },
    SaveSession { parent: PathBuf, name: Option<String> },
    LoadSession { path: PathBuf },
    LogStatus,
}

pub fn command_queue(capacity: usize) -> (HeapProducer<EngineCommand>, HeapConsumer<EngineCommand>) {
    HeapRb::<EngineCommand>::new(capacity.max(1)).split()
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub tempo_bpm: f64,
    pub beats_per_measure: u32,
    pub loop_length_beats: u32,
    pub sample_rate: u32,
    pub end_detection: EndDetection,
    pub metronome_enabled: bool,
    pub metronome_volume_db: f32,
    pub master_volume_db: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tempo_bpm: DEFAULT_TEMPO_BPM,
            beats_per_measure: DEFAULT_BEATS_PER_MEASURE,
            loop_length_beats: DEFAULT_LOOP_MEASURES * DEFAULT_BEATS_PER_MEASURE,
            sample_rate: 48_000,
            end_detection: EndDetection::Polling,
            metronome_enabled: false,
            metronome_volume_db: DEFAULT_METRONOME_VOLUME_DB,
            master_volume_db: 0.0,
        }
    }
}

impl From<&AppSettings> for EngineConfig {
    fn from(settings: &AppSettings) -> Self {
        Self {
            tempo_bpm: settings.tempo_bpm,
            beats_per_measure: settings.beats_per_measure,
            loop_length_beats: settings.loop_length_beats(),
            sample_rate: settings.sample_rate_or_default(),
            end_detection: settings.end_detection,
            metronome_enabled: settings.metronome_enabled,
            metronome_volume_db: settings.metronome_volume_db,
            master_volume_db: settings.master_volume_db,
        }
    }
}

pub struct LoopEngine {
    transport: Transport,
    registry: TrackRegistry,
    recorder: LoopRecorder,
    scheduler: PlaybackScheduler,
    device: Box<dyn CaptureDevice>,
    metronome: Metronome,
    master_volume_db: f32,
    pointer: Option<Coord>,
    sample_rate: u32,
    command_consumer: Option<HeapConsumer<EngineCommand>>,
}

impl LoopEngine {
    pub fn new(config: EngineConfig, device: Box<dyn CaptureDevice>) -> Self {
        let sample_rate = config.sample_rate.max(1);
        let mut metronome = Metronome::new(sample_rate as f32);
        metronome.set_enabled(config.metronome_enabled);
        metronome.set_volume_db(config.metronome_volume_db);
        Self {
            transport: Transport::new(config.tempo_bpm, config.beats_per_measure, config.loop_length_beats),
            registry: TrackRegistry::new(),
            recorder: LoopRecorder::new(config.end_detection),
            scheduler: PlaybackScheduler::new(sample_rate),
            device,
            metronome,
            master_volume_db: config.master_volume_db,
            pointer: None,
            sample_rate,
            command_consumer: None,
        }
    }

    /// Attaches the consumer half of a command queue; commands are applied
    /// at the start of each tick.
    pub fn with_commands(mut self, consumer: HeapConsumer<EngineCommand>) -> Self {
        self.command_consumer = Some(consumer);
        self
    }

    // --- Accessors ---

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn registry(&self) -> &TrackRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &PlaybackScheduler {
        &self.scheduler
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    pub fn unit_state(&self, id: UnitId) -> Option<TrackState> {
        self.registry.get(id).map(|t| t.state())
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn master_volume_db(&self) -> f32 {
        self.master_volume_db
    }

    pub fn metronome_enabled(&self) -> bool {
        self.metronome.is_enabled()
    }

    /// Replayed coordinate of an instrument unit, for visualisation.
    pub fn current_coordinate(&self, id: UnitId) -> Option<Coord> {
        self.scheduler.current_coordinate(id)
    }

    /// Output peak of a unit over the last rendered block, 0..=1.
    pub fn unit_level(&self, id: UnitId) -> Option<f32> {
        self.registry.get(id).map(|_| self.scheduler.level(id))
    }

    /// Note the preview voice is sounding while the pointer is down.
    pub fn preview_note(&self) -> Option<Note> {
        self.scheduler.preview_note()
    }

    pub fn subscribe(&mut self, observer: StateObserver) {
        self.registry.subscribe(observer);
    }

    // --- Unit lifecycle ---

    pub fn create_unit(&mut self, kind: TrackKind) -> UnitId {
        self.registry.create_unit(kind)
    }

    /// Arms a unit to record the next full loop. The ticket resolves once the
    /// capture is bound for playback, or with the error that ended it.
    pub fn arm_unit(&mut self, id: UnitId) -> Result<CaptureTicket> {
        let kind = self.registry.check_armable(id)?;
        let ticket = self
            .recorder
            .arm(id, kind, &mut self.transport, self.device.as_mut())?;
        self.registry.set_state(id, TrackState::Armed)?;
        Ok(ticket)
    }

    /// Removes a unit. A capture it owns is aborted first, so no clock event
    /// can reach it afterwards.
    pub fn delete_unit(&mut self, id: UnitId) -> Result<()> {
        if self.registry.get(id).is_none() {
            return Err(LoopError::UnknownUnit(id));
        }
        self.abort_capture_of(id);
        self.scheduler.unbind(id);
        self.registry.delete(id)?;
        Ok(())
    }

    pub fn clear_unit(&mut self, id: UnitId) -> Result<()> {
        if self.registry.get(id).is_none() {
            return Err(LoopError::UnknownUnit(id));
        }
        self.abort_capture_of(id);
        self.scheduler.unbind(id);
        self.registry.clear(id)?;
        Ok(())
    }

    fn abort_capture_of(&mut self, id: UnitId) {
        if self.recorder.owner() == Some(id) {
            self.recorder
                .abort(&mut self.transport, self.device.as_mut(), LoopError::CaptureAborted);
        }
    }

    pub fn set_mute(&mut self, id: UnitId, muted: bool) -> Result<()> {
        self.registry.set_muted(id, muted)
    }

    pub fn toggle_mute(&mut self, id: UnitId) -> Result<bool> {
        let muted = !self
            .registry
            .get(id)
            .ok_or(LoopError::UnknownUnit(id))?
            .mix()
            .muted;
        self.registry.set_muted(id, muted)?;
        Ok(muted)
    }

    pub fn set_volume(&mut self, id: UnitId, db: f32) -> Result<()> {
        self.registry.set_volume_db(id, db)
    }

    pub fn set_pan(&mut self, id: UnitId, pan: f32) -> Result<()> {
        self.registry.set_pan(id, pan)
    }

    pub fn set_filter_cutoff(&mut self, id: UnitId, hz: f32) -> Result<()> {
        self.registry.set_filter_cutoff_hz(id, hz)
    }

    /// Puts a preset gesture into an instrument unit, replacing its content.
    pub fn load_preset_gesture(&mut self, id: UnitId, name: &str) -> Result<()> {
        let track = self.registry.get(id).ok_or(LoopError::UnknownUnit(id))?;
        if track.kind != TrackKind::Instrument {
            return Err(LoopError::NotInstrument(id));
        }
        if track.state().is_busy() {
            return Err(LoopError::AlreadyCapturing);
        }
        let gesture = gesture::preset(name).ok_or_else(|| LoopError::UnknownPreset(name.to_string()))?;
        let content = TrackContent::Gesture(gesture);
        self.scheduler.bind(id, &content);
        self.registry.set_content(id, content)?;
        tracing::info!(unit = %id, preset = name, "preset gesture loaded");
        Ok(())
    }

    // --- Transport ---

    /// Starts or stops the transport. Stopping rewinds and aborts any capture.
    /// Returns whether the transport is now running.
    pub fn toggle_playback(&mut self) -> bool {
        if self.transport.is_running() {
            if let Some(unit) = self.recorder.abort(
                &mut self.transport,
                self.device.as_mut(),
                LoopError::CaptureAborted,
            ) {
                self.reset_unit(unit);
            }
            self.transport.stop();
            self.metronome.reset();
            self.scheduler.update_gestures(&self.registry, 0.0, false);
            false
        } else {
            let fired = self.transport.start();
            self.route_clock_events(fired);
            true
        }
    }

    pub fn set_tempo(&mut self, bpm: f64) -> Result<()> {
        self.transport.set_tempo(bpm)?;
        self.rebind_all();
        Ok(())
    }

    /// Changes the loop length. A capture in flight keeps the nominal length
    /// it started with.
    pub fn set_loop_length(&mut self, beats: u32) -> Result<()> {
        self.transport.set_loop_length(beats)?;
        self.rebind_all();
        Ok(())
    }

    fn rebind_all(&mut self) {
        let loop_secs = self.transport.loop_duration_secs();
        let rebound = self.scheduler.rebind_all(&mut self.registry, loop_secs);
        tracing::debug!(rebound, loop_secs, "units rebound");
    }

    /// Moves the pointer. While it is down the note under it is previewed,
    /// and an instrument capture in flight samples it on the next tick.
    pub fn set_pointer(&mut self, pointer: Option<Coord>) {
        self.pointer = pointer;
        self.scheduler.set_preview(pointer);
    }

    pub fn toggle_metronome(&mut self) -> bool {
        let enabled = !self.metronome.is_enabled();
        self.metronome.set_enabled(enabled);
        enabled
    }

    pub fn set_metronome_volume(&mut self, db: f32) {
        self.metronome.set_volume_db(db);
    }

    pub fn set_master_volume(&mut self, db: f32) {
        self.master_volume_db = db;
    }

    // --- Tick ---

    /// One cooperative scheduler tick.
    pub fn tick(&mut self, dt_secs: f64) {
        self.handle_commands();

        let fired = self.transport.advance(dt_secs);
        self.route_clock_events(fired);

        if let Some(event) = self
            .recorder
            .poll(&mut self.transport, self.device.as_mut(), self.pointer)
        {
            self.on_recorder_event(event);
        }
        self.device.drain_idle();

        let loop_beats = self.transport.loop_beats();
        let running = self.transport.is_running();
        self.scheduler.update_gestures(&self.registry, loop_beats, running);
    }

    fn route_clock_events(&mut self, fired: Vec<FiredEvent>) {
        for event in fired {
            match self
                .recorder
                .handle_clock_event(&event, &mut self.transport, self.device.as_mut())
            {
                Ok(Some(recorder_event)) => self.on_recorder_event(recorder_event),
                Ok(None) => {}
                Err(LoopError::SchedulingRace { session }) => {
                    tracing::debug!(session, "dropping stale clock event");
                }
                Err(e) => tracing::warn!(error = %e, "clock event failed"),
            }
        }
    }

    fn on_recorder_event(&mut self, event: RecorderEvent) {
        match event {
            RecorderEvent::Started { unit, .. } => {
                if let Err(e) = self.registry.set_state(unit, TrackState::Capturing) {
                    tracing::warn!(unit = %unit, error = %e, "capture started for a missing unit");
                }
            }
            RecorderEvent::Finished(capture) => self.finalize(capture),
            RecorderEvent::Failed { unit, error, .. } => {
                tracing::warn!(unit = %unit, %error, "unit returned to empty");
                self.reset_unit(unit);
            }
        }
    }

    fn reset_unit(&mut self, unit: UnitId) {
        if self.registry.get(unit).is_none() {
            return;
        }
        if let Err(e) = self.registry.set_state(unit, TrackState::Empty) {
            tracing::warn!(unit = %unit, error = %e, "could not reset unit");
        }
    }

    /// Compensate, bind for playback, then publish `HasContent`.
    fn finalize(&mut self, capture: FinishedCapture) {
        let unit = capture.unit;
        let capture_start_beats = capture.capture_start_beats;
        let nominal_secs = capture.nominal_secs;
        let actual_secs = capture.actual_secs;
        let (captured, completion) = capture.into_parts();

        if self.registry.get(unit).is_none() {
            completion.resolve(Err(LoopError::CaptureAborted));
            return;
        }

        let loop_secs = self.transport.loop_duration_secs();
        let correction = if (loop_secs - nominal_secs).abs() < 1e-9 {
            LatencyCompensator::compensate(nominal_secs, actual_secs)
        } else {
            // The loop was resized mid-capture; line up with the loop as it is now.
            tracing::info!(unit = %unit, nominal_secs, loop_secs, "loop length changed during capture");
            LatencyCompensator::recompute(loop_secs, actual_secs)
        };
        let (kind, content) = match captured {
            CapturedContent::Audio(raw) => (
                TrackKind::Audio,
                TrackContent::Audio(AudioClip {
                    samples: Arc::new(raw.samples),
                    sample_rate: raw.sample_rate,
                    correction,
                }),
            ),
            CapturedContent::Gesture(gesture) => (TrackKind::Instrument, TrackContent::Gesture(gesture)),
        };

        self.scheduler.bind(unit, &content);
        if let Err(e) = self.registry.set_content(unit, content) {
            self.scheduler.unbind(unit);
            completion.resolve(Err(e));
            return;
        }
        tracing::info!(
            unit = %unit,
            correction = correction.correction_secs,
            preroll = correction.preroll_secs,
            "loop bound for playback"
        );
        completion.resolve(Ok(CaptureOutcome {
            unit,
            kind,
            capture_start_beats,
            nominal_secs,
            actual_secs,
            correction,
        }));
    }

    // --- Rendering ---

    fn render_clock(&self) -> RenderClock {
        RenderClock {
            loop_beats: self.transport.loop_beats(),
            loop_length_beats: self.transport.loop_length() as f64,
            absolute_beats: self.transport.absolute_beats(),
            beats_per_measure: self.transport.beats_per_measure(),
            seconds_per_beat: self.transport.seconds_per_beat(),
            running: self.transport.is_running(),
        }
    }

    /// Renders one stereo block at the current transport position.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        left.fill(0.0);
        right.fill(0.0);
        let clock = self.render_clock();
        self.scheduler.render(&self.registry, clock, left, right);

        let frames = left.len().min(right.len());
        if clock.running {
            let beats_per_frame = 1.0 / self.sample_rate as f64 / clock.seconds_per_beat;
            for i in 0..frames {
                let click = self
                    .metronome
                    .process_at(clock.absolute_beats + i as f64 * beats_per_frame, clock.beats_per_measure);
                left[i] += click;
                right[i] += click;
            }
        }

        let master = db_to_gain(self.master_volume_db);
        for i in 0..frames {
            left[i] *= master;
            right[i] *= master;
        }
    }

    // --- Sessions ---

    /// Captures every unit holding content, plus the global transport state.
    pub fn snapshot(&self, name: Option<String>) -> Session {
        let mut audio = BTreeMap::new();
        let mut tracks = Vec::new();
        for track in self.registry.iter() {
            let content = match track.content() {
                Some(TrackContent::Audio(clip)) => {
                    audio.insert(track.id, clip.samples.clone());
                    ContentData::Audio {
                        file: session::audio_file_name(track.id),
                        sample_rate: clip.sample_rate,
                        captured_secs: clip.duration_secs(),
                        correction: clip.correction,
                    }
                }
                Some(TrackContent::Gesture(g)) => ContentData::Gesture {
                    points: g.points().to_vec(),
                    start_offset_beats: g.start_offset_beats(),
                },
                None => continue,
            };
            tracks.push(TrackData {
                id: track.id,
                kind: track.kind,
                name: track.name.clone(),
                volume_db: track.mix().volume_db,
                pan: track.mix().pan,
                muted: track.mix().muted,
                filter_cutoff_hz: track.mix().filter_cutoff_hz,
                content,
            });
        }
        Session {
            data: SessionData {
                name: name.unwrap_or_else(session::default_session_name),
                saved_at: Local::now().to_rfc3339(),
                tempo_bpm: self.transport.tempo(),
                loop_length_beats: self.transport.loop_length(),
                beats_per_measure: self.transport.beats_per_measure(),
                master_volume_db: self.master_volume_db,
                tracks,
            },
            audio,
        }
    }

    /// Replaces every unit with the session's. Units get fresh ids and their
    /// phase correction is recomputed against the restored loop.
    pub fn restore(&mut self, session: &Session) -> Result<Vec<UnitId>> {
        let data = &session.data;
        if let Some(unit) = self.recorder.abort(
            &mut self.transport,
            self.device.as_mut(),
            LoopError::CaptureAborted,
        ) {
            self.reset_unit(unit);
        }
        self.transport
            .set_meter(data.beats_per_measure, data.loop_length_beats)?;
        self.transport.set_tempo(data.tempo_bpm)?;
        self.scheduler.unbind_all();
        self.registry.remove_all();
        self.master_volume_db = data.master_volume_db;

        let loop_secs = self.transport.loop_duration_secs();
        let mut ids = Vec::with_capacity(data.tracks.len());
        for track_data in &data.tracks {
            let content = match &track_data.content {
                ContentData::Audio { sample_rate, .. } => {
                    let Some(samples) = session.audio.get(&track_data.id) else {
                        tracing::warn!(unit = %track_data.id, "session audio missing, unit skipped");
                        continue;
                    };
                    let mut clip = AudioClip {
                        samples: samples.clone(),
                        sample_rate: *sample_rate,
                        correction: PhaseCorrection::default(),
                    };
                    clip.correction = LatencyCompensator::recompute(loop_secs, clip.duration_secs());
                    TrackContent::Audio(clip)
                }
                ContentData::Gesture {
                    points,
                    start_offset_beats,
                } => match Gesture::from_points(points.clone(), *start_offset_beats) {
                    Some(g) => TrackContent::Gesture(g),
                    None => {
                        tracing::warn!(unit = %track_data.id, "empty gesture in session, unit skipped");
                        continue;
                    }
                },
            };

            if Playable::is_empty(&content) {
                tracing::warn!(unit = %track_data.id, "empty content in session, unit skipped");
                continue;
            }

            let mut track = Track::new(track_data.id, track_data.kind);
            track.name = track_data.name.clone();
            track.set_volume_db(track_data.volume_db);
            track.set_pan(track_data.pan);
            track.set_muted(track_data.muted);
            track.set_filter_cutoff_hz(track_data.filter_cutoff_hz);
            track.set_content(content);
            let id = self.registry.restore_unit(track);
            if let Some(content) = self.registry.get(id).and_then(|t| t.content()) {
                self.scheduler.bind(id, content);
            }
            ids.push(id);
        }
        tracing::info!(name = %data.name, units = ids.len(), "session restored");
        Ok(ids)
    }

    // --- Commands ---

    pub fn handle_commands(&mut self) {
        let Some(mut consumer) = self.command_consumer.take() else {
            return;
        };
        while let Some(command) = consumer.pop() {
            if let Err(e) = self.apply(command) {
                tracing::warn!("Command failed: {:#}", e);
            }
        }
        self.command_consumer = Some(consumer);
    }

    fn apply(&mut self, command: EngineCommand) -> anyhow::Result<()> {
        match command {
            EngineCommand::CreateUnit(kind) => {
                self.create_unit(kind);
            }
            EngineCommand::ArmUnit(id) => {
                // Nobody awaits this ticket; the outcome shows up in the unit's state.
                self.arm_unit(id)?;
            }
            EngineCommand::DeleteUnit(id) => self.delete_unit(id)?,
            EngineCommand::ClearUnit(id) => self.clear_unit(id)?,
            EngineCommand::SetMute { unit, muted } => self.set_mute(unit, muted)?,
            EngineCommand::ToggleMute(id) => {
                self.toggle_mute(id)?;
            }
            EngineCommand::SetVolume { unit, db } => self.set_volume(unit, db)?,
            EngineCommand::SetPan { unit, pan } => self.set_pan(unit, pan)?,
            EngineCommand::SetFilterCutoff { unit, hz } => self.set_filter_cutoff(unit, hz)?,
            EngineCommand::TogglePlayback => {
                self.toggle_playback();
            }
            EngineCommand::SetTempo(bpm) => self.set_tempo(bpm)?,
            EngineCommand::SetLoopLength(beats) => self.set_loop_length(beats)?,
            EngineCommand::SetPointer(pointer) => self.set_pointer(pointer),
            EngineCommand::ToggleMetronome => {
                self.toggle_metronome();
            }
            EngineCommand::SetMetronomeVolume(db) => self.set_metronome_volume(db),
            EngineCommand::SetMasterVolume(db) => self.set_master_volume(db),
            EngineCommand::LoadPresetGesture { unit, name } => self.load_preset_gesture(unit, &name)?,
            EngineCommand::SaveSession { parent, name } => {
                session::save_session(&parent, &self.snapshot(name))?;
            }
            EngineCommand::LoadSession { path } => {
                let loaded = session::load_session(&path, self.sample_rate)?;
                self.restore(&loaded)?;
            }
            EngineCommand::LogStatus => self.log_status(),
        }
        Ok(())
    }

    fn log_status(&self) {
        tracing::info!(
            running = self.transport.is_running(),
            tempo = self.transport.tempo(),
            loop_beats = self.transport.loop_length(),
            position = ?self.transport.position(),
            recorder = ?self.recorder.state(),
            "transport"
        );
        let spb = self.transport.seconds_per_beat();
        for track in self.registry.iter() {
            tracing::info!(
                unit = %track.id,
                name = %track.name,
                state = ?track.state(),
                length_secs = track.content().map_or(0.0, |c| c.duration_secs(spb)),
                volume_db = track.mix().volume_db,
                pan = track.mix().pan,
                muted = track.mix().muted,
                filter_hz = track.mix().filter_cutoff_hz,
                level = self.scheduler.level(track.id),
                "unit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RingBufferInput;
    use std::sync::Mutex;

    fn engine() -> LoopEngine {
        let config = EngineConfig {
            sample_rate: 1000,
            ..EngineConfig::default()
        };
        let (_producer, input) = RingBufferInput::with_capacity(1 << 14, 1000, 0.0);
        LoopEngine::new(config, Box::new(input))
    }

    #[test]
    fn test_commands_are_applied_on_tick() {
        let (mut producer, consumer) = command_queue(16);
        let mut engine = engine().with_commands(consumer);
        producer.push(EngineCommand::CreateUnit(TrackKind::Instrument)).unwrap();
        producer.push(EngineCommand::SetVolume { unit: UnitId(0), db: -6.0 }).unwrap();
        producer.push(EngineCommand::TogglePlayback).unwrap();
        engine.tick(0.01);
        assert_eq!(engine.registry().len(), 1);
        assert_eq!(engine.registry().get(UnitId(0)).unwrap().mix().volume_db, -6.0);
        assert!(engine.transport().is_running());
    }

    #[test]
    fn test_failed_command_does_not_stop_the_queue() {
        let (mut producer, consumer) = command_queue(16);
        let mut engine = engine().with_commands(consumer);
        producer.push(EngineCommand::ArmUnit(UnitId(7))).unwrap();
        producer.push(EngineCommand::CreateUnit(TrackKind::Audio)).unwrap();
        engine.tick(0.01);
        assert_eq!(engine.registry().len(), 1);
    }

    #[test]
    fn test_preset_loads_into_instrument_only() {
        let mut engine = engine();
        let audio = engine.create_unit(TrackKind::Audio);
        let inst = engine.create_unit(TrackKind::Instrument);
        assert_eq!(
            engine.load_preset_gesture(audio, "quick_rise"),
            Err(LoopError::NotInstrument(audio))
        );
        assert_eq!(
            engine.load_preset_gesture(inst, "nope"),
            Err(LoopError::UnknownPreset("nope".to_string()))
        );
        engine.load_preset_gesture(inst, "long_sweep").unwrap();
        assert_eq!(engine.unit_state(inst), Some(TrackState::HasContent));
        assert!(engine.scheduler().is_bound(inst));

        engine.toggle_playback();
        engine.tick(0.25); // half a beat
        assert!(engine.current_coordinate(inst).is_some());
    }

    #[test]
    fn test_stop_aborts_capture() {
        let mut engine = engine();
        let id = engine.create_unit(TrackKind::Instrument);
        engine.toggle_playback();
        let mut ticket = engine.arm_unit(id).unwrap();
        assert_eq!(engine.unit_state(id), Some(TrackState::Armed));
        engine.toggle_playback();
        assert_eq!(engine.unit_state(id), Some(TrackState::Empty));
        assert_eq!(engine.recorder_state(), RecorderState::Idle);
        assert_eq!(ticket.try_outcome(), Some(Err(LoopError::CaptureAborted)));
    }

    #[test]
    fn test_observer_sees_arm_and_clear() {
        let mut engine = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.subscribe(Box::new(move |id, state| sink.lock().unwrap().push((id, state))));
        let id = engine.create_unit(TrackKind::Instrument);
        engine.arm_unit(id).unwrap();
        engine.clear_unit(id).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (id, TrackState::Empty),
                (id, TrackState::Armed),
                (id, TrackState::Empty)
            ]
        );
    }

    fn recording_observer(engine: &mut LoopEngine) -> Arc<Mutex<Vec<(UnitId, TrackState)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        engine.subscribe(Box::new(move |id, state| sink.lock().unwrap().push((id, state))));
        seen
    }

    #[test]
    fn test_deleting_an_armed_unit_reports_empty() {
        let mut engine = engine();
        let id = engine.create_unit(TrackKind::Instrument);
        let seen = recording_observer(&mut engine);
        engine.toggle_playback();
        let mut ticket = engine.arm_unit(id).unwrap();
        engine.delete_unit(id).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(id, TrackState::Armed), (id, TrackState::Empty)]
        );
        assert_eq!(ticket.try_outcome(), Some(Err(LoopError::CaptureAborted)));
        assert_eq!(engine.unit_state(id), None);
    }

    #[test]
    fn test_restore_reports_replaced_units_empty() {
        let mut engine = engine();
        let old = engine.create_unit(TrackKind::Instrument);
        engine.load_preset_gesture(old, "single_note").unwrap();
        let saved = engine.snapshot(Some("one".to_string()));
        let seen = recording_observer(&mut engine);
        let ids = engine.restore(&saved).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(old, TrackState::Empty), (ids[0], TrackState::HasContent)]
        );
    }

    #[test]
    fn test_unit_level_and_filter() {
        let mut engine = engine();
        let id = engine.create_unit(TrackKind::Instrument);
        engine.load_preset_gesture(id, "single_note").unwrap();
        assert_eq!(engine.unit_level(id), Some(0.0));
        assert_eq!(engine.unit_level(UnitId(99)), None);
        engine.toggle_playback();
        engine.tick(0.1);
        let (mut l, mut r) = (vec![0.0; 256], vec![0.0; 256]);
        engine.render(&mut l, &mut r);
        assert!(engine.unit_level(id).unwrap() > 0.0);

        engine.set_filter_cutoff(id, 400.0).unwrap();
        let mix = *engine.registry().get(id).unwrap().mix();
        assert_eq!(mix.filter_cutoff_hz, 400.0);
        let saved = engine.snapshot(None);
        assert_eq!(saved.data.tracks[0].filter_cutoff_hz, 400.0);
        assert_eq!(
            engine.set_filter_cutoff(UnitId(99), 400.0),
            Err(LoopError::UnknownUnit(UnitId(99)))
        );
    }

    #[test]
    fn test_pointer_previews_its_note() {
        let mut engine = engine();
        assert!(engine.preview_note().is_none());
        let (mut l, mut r) = (vec![0.0; 256], vec![0.0; 256]);
        engine.render(&mut l, &mut r);
        assert!(l.iter().all(|s| *s == 0.0));

        let c = Coord::new(0.5, 0.8);
        engine.set_pointer(Some(c));
        assert_eq!(engine.preview_note(), Some(crate::notation::note_for(c)));
        engine.render(&mut l, &mut r);
        assert!(l.iter().any(|s| *s != 0.0));

        engine.set_pointer(None);
        assert!(engine.preview_note().is_none());
    }

    #[test]
    fn test_master_volume_scales_output() {
        let mut engine = engine();
        let id = engine.create_unit(TrackKind::Instrument);
        engine.load_preset_gesture(id, "single_note").unwrap();
        engine.toggle_playback();
        engine.tick(0.1);
        let (mut l, mut r) = (vec![0.0; 256], vec![0.0; 256]);
        engine.render(&mut l, &mut r);
        assert!(l.iter().any(|s| *s != 0.0));

        engine.set_master_volume(-100.0);
        engine.render(&mut l, &mut r);
        assert!(l.iter().all(|s| *s == 0.0));
    }
}
