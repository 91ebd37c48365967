// src/recorder.rs

//! Loop-synchronised capture.
//!
//! `Idle -> Armed -> Capturing -> Idle`, or `Armed -> Idle` on abort. Arming
//! schedules a one-shot at the next loop boundary; capture then runs for one
//! loop and ends when the transport wraps. Every clock event carries the
//! session id it was scheduled for, and anything addressed to a superseded
//! session is rejected with `SchedulingRace` instead of touching state.

use crate::capture::{CaptureDevice, RawAudio, SinkToken};
use crate::error::{LoopError, Result};
use crate::gesture::{Coord, Gesture, GestureSampler};
use crate::latency::PhaseCorrection;
use crate::track::{TrackKind, UnitId};
use crate::transport::{ClockAction, ClockSource, EventId, FiredEvent, LoopPosition};
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Armed,
    Capturing,
}

/// How the end of a capture is found.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndDetection {
    /// Watch the transport position every tick and stop when it wraps.
    /// Follows loop-length edits made while capturing.
    #[default]
    Polling,
    /// Schedule a stop one loop (as long as it was at capture start) after the start.
    Scheduled,
}

/// Detects a loop wrap by sampling the transport position.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoopWatcher {
    previous: Option<(LoopPosition, u64)>,
}

impl LoopWatcher {
    pub fn primed(position: LoopPosition, loops_completed: u64) -> Self {
        Self {
            previous: Some((position, loops_completed)),
        }
    }

    /// Returns true when the position went backwards (or a whole cycle was
    /// skipped) since the previous observation.
    pub fn observe(&mut self, position: LoopPosition, loops_completed: u64) -> bool {
        let wrapped = match self.previous {
            Some((prev, prev_loops)) => position < prev || loops_completed > prev_loops,
            None => false,
        };
        self.previous = Some((position, loops_completed));
        wrapped
    }
}

/// Result of a finished capture, handed to whoever awaited the arm.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureOutcome {
    pub unit: UnitId,
    pub kind: TrackKind,
    pub capture_start_beats: f64,
    pub nominal_secs: f64,
    pub actual_secs: f64,
    pub correction: PhaseCorrection,
}

type Completion = oneshot::Sender<Result<CaptureOutcome>>;

/// Deferred completion of an arm: resolves when the capture finalises,
/// fails or is aborted.
pub struct CaptureTicket {
    pub unit: UnitId,
    pub session: SessionId,
    receiver: oneshot::Receiver<Result<CaptureOutcome>>,
}

impl CaptureTicket {
    /// Non-blocking check. `None` while the capture is still in flight.
    pub fn try_outcome(&mut self) -> Option<Result<CaptureOutcome>> {
        match self.receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Some(Err(LoopError::CaptureAborted)),
        }
    }
}

impl Future for CaptureTicket {
    type Output = Result<CaptureOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(LoopError::CaptureAborted)))
    }
}

#[derive(Debug)]
pub enum CapturedContent {
    Audio(RawAudio),
    Gesture(Gesture),
}

/// Raw result of a capture, before latency compensation and binding.
#[derive(Debug)]
pub struct FinishedCapture {
    pub unit: UnitId,
    pub session: SessionId,
    pub capture_start_beats: f64,
    pub nominal_secs: f64,
    pub actual_secs: f64,
    pub content: CapturedContent,
    completion: Option<Completion>,
}

impl FinishedCapture {
    /// Splits off the content and the handle that resolves the arm ticket.
    pub fn into_parts(self) -> (CapturedContent, CaptureCompletion) {
        (self.content, CaptureCompletion(self.completion))
    }
}

/// Resolves the ticket handed out by `arm`. Dropping it unresolved makes the
/// ticket report `CaptureAborted`.
#[derive(Debug)]
pub struct CaptureCompletion(Option<Completion>);

impl CaptureCompletion {
    pub fn resolve(mut self, outcome: Result<CaptureOutcome>) {
        if let Some(tx) = self.0.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[derive(Debug)]
pub enum RecorderEvent {
    Started {
        unit: UnitId,
        session: SessionId,
        at_beats: f64,
    },
    Finished(FinishedCapture),
    Failed {
        unit: UnitId,
        session: SessionId,
        error: LoopError,
    },
}

#[derive(Debug)]
enum Sink {
    Audio(SinkToken),
    Gesture(GestureSampler),
}

#[derive(Debug)]
enum Phase {
    Armed,
    Capturing {
        start_beats: f64,
        nominal_secs: f64,
        last_beats: f64,
        elapsed_secs: f64,
        sink: Sink,
        watcher: LoopWatcher,
    },
}

#[derive(Debug)]
struct CaptureSession {
    id: SessionId,
    owner: UnitId,
    kind: TrackKind,
    phase: Phase,
    pending_events: Vec<EventId>,
    completion: Option<Completion>,
}

pub struct LoopRecorder {
    session: Option<CaptureSession>,
    next_session: u64,
    end_detection: EndDetection,
}

impl LoopRecorder {
    pub fn new(end_detection: EndDetection) -> Self {
        Self {
            session: None,
            next_session: 0,
            end_detection,
        }
    }

    pub fn end_detection(&self) -> EndDetection {
        self.end_detection
    }

    pub fn state(&self) -> RecorderState {
        match self.session.as_ref().map(|s| &s.phase) {
            None => RecorderState::Idle,
            Some(Phase::Armed) => RecorderState::Armed,
            Some(Phase::Capturing { .. }) => RecorderState::Capturing,
        }
    }

    /// Unit that owns the live session, if any.
    pub fn owner(&self) -> Option<UnitId> {
        self.session.as_ref().map(|s| s.owner)
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Arms `unit` to capture from the next loop boundary. Audio units open
    /// the device here so an unavailable device fails fast.
    pub fn arm<C: ClockSource + ?Sized>(
        &mut self,
        unit: UnitId,
        kind: TrackKind,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
    ) -> Result<CaptureTicket> {
        if self.session.is_some() {
            return Err(LoopError::AlreadyCapturing);
        }
        if kind == TrackKind::Audio {
            device.open()?;
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;
        let start_event = clock.schedule_at_next_loop_start(ClockAction::BeginCapture(id));
        let (tx, rx) = oneshot::channel();

        self.session = Some(CaptureSession {
            id,
            owner: unit,
            kind,
            phase: Phase::Armed,
            pending_events: vec![start_event],
            completion: Some(tx),
        });
        tracing::info!(unit = %unit, session = id.0, ?kind, "armed, waiting for loop start");

        Ok(CaptureTicket {
            unit,
            session: id,
            receiver: rx,
        })
    }

    /// Handles a clock event scheduled by this recorder.
    pub fn handle_clock_event<C: ClockSource + ?Sized>(
        &mut self,
        event: &FiredEvent,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
    ) -> Result<Option<RecorderEvent>> {
        match event.action {
            ClockAction::BeginCapture(sid) => self.begin(sid, event, clock, device),
            ClockAction::EndCapture(sid) => {
                match self.session.as_ref() {
                    Some(s) if s.id == sid && matches!(s.phase, Phase::Capturing { .. }) => {}
                    _ => return Err(LoopError::SchedulingRace { session: sid.0 }),
                }
                Ok(self.finish(clock, device))
            }
        }
    }

    fn begin<C: ClockSource + ?Sized>(
        &mut self,
        sid: SessionId,
        event: &FiredEvent,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
    ) -> Result<Option<RecorderEvent>> {
        let end_detection = self.end_detection;
        let session = match self.session.as_mut() {
            Some(s) if s.id == sid && matches!(s.phase, Phase::Armed) => s,
            _ => return Err(LoopError::SchedulingRace { session: sid.0 }),
        };
        session.pending_events.retain(|id| *id != event.id);

        let sink = match session.kind {
            TrackKind::Audio => match device.start_capture() {
                Ok(token) => Sink::Audio(token),
                Err(error) => return Ok(self.fail(clock, device, error)),
            },
            TrackKind::Instrument => Sink::Gesture(GestureSampler::new(event.at_beats)),
        };

        // Nominal length is fixed to the loop in effect right now.
        let nominal_secs = clock.loop_duration_secs();
        let now = clock.absolute_beats();
        if end_detection == EndDetection::Scheduled {
            let end_at = event.at_beats + clock.loop_length() as f64;
            let end_event = clock.schedule_at(end_at, ClockAction::EndCapture(sid));
            session.pending_events.push(end_event);
        }
        session.phase = Phase::Capturing {
            start_beats: event.at_beats,
            nominal_secs,
            last_beats: now,
            elapsed_secs: (now - event.at_beats).max(0.0) * clock.seconds_per_beat(),
            sink,
            watcher: LoopWatcher::primed(clock.position(), clock.loops_completed()),
        };
        tracing::info!(unit = %session.owner, session = sid.0, at_beats = event.at_beats, "capture started");

        Ok(Some(RecorderEvent::Started {
            unit: session.owner,
            session: sid,
            at_beats: event.at_beats,
        }))
    }

    /// One cooperative tick while capturing: feed the sink and watch for the
    /// loop wrap that ends the capture.
    pub fn poll<C: ClockSource + ?Sized>(
        &mut self,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
        pointer: Option<Coord>,
    ) -> Option<RecorderEvent> {
        let polling = self.end_detection == EndDetection::Polling;
        let session = self.session.as_mut()?;
        let Phase::Capturing {
            last_beats,
            elapsed_secs,
            sink,
            watcher,
            ..
        } = &mut session.phase
        else {
            return None;
        };

        let now = clock.absolute_beats();
        *elapsed_secs += (now - *last_beats).max(0.0) * clock.seconds_per_beat();
        *last_beats = now;

        let wrapped = watcher.observe(clock.position(), clock.loops_completed());

        let pulled = match sink {
            Sink::Audio(token) => device.pull(*token).map(|_| ()),
            Sink::Gesture(sampler) => {
                if !wrapped {
                    sampler.sample(now, pointer);
                }
                Ok(())
            }
        };
        if let Err(error) = pulled {
            return self.fail(clock, device, error);
        }

        if polling && wrapped {
            return self.finish(clock, device);
        }
        None
    }

    fn finish<C: ClockSource + ?Sized>(
        &mut self,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
    ) -> Option<RecorderEvent> {
        let mut session = self.session.take()?;
        for id in session.pending_events.drain(..) {
            clock.cancel(id);
        }
        let Phase::Capturing {
            start_beats,
            nominal_secs,
            elapsed_secs,
            sink,
            ..
        } = session.phase
        else {
            // Finishing an armed session means nothing was captured.
            let error = LoopError::NothingCaptured(session.owner);
            return Some(Self::resolve_failure(session.owner, session.id, session.completion, error));
        };

        let captured = match sink {
            Sink::Audio(token) => match device.stop_capture(token) {
                Ok(raw) if !raw.samples.is_empty() => {
                    let actual = raw.duration_secs();
                    Ok((CapturedContent::Audio(raw), actual))
                }
                Ok(_) => Err(LoopError::NothingCaptured(session.owner)),
                Err(error) => {
                    device.discard(token);
                    Err(error)
                }
            },
            Sink::Gesture(sampler) => match sampler.finish() {
                Some(gesture) => Ok((CapturedContent::Gesture(gesture), elapsed_secs)),
                None => Err(LoopError::NothingCaptured(session.owner)),
            },
        };

        match captured {
            Ok((content, actual_secs)) => {
                tracing::info!(
                    unit = %session.owner,
                    session = session.id.0,
                    nominal = nominal_secs,
                    actual = actual_secs,
                    "capture finished"
                );
                Some(RecorderEvent::Finished(FinishedCapture {
                    unit: session.owner,
                    session: session.id,
                    capture_start_beats: start_beats,
                    nominal_secs,
                    actual_secs,
                    content,
                    completion: session.completion,
                }))
            }
            Err(error) => Some(Self::resolve_failure(
                session.owner,
                session.id,
                session.completion,
                error,
            )),
        }
    }

    fn fail<C: ClockSource + ?Sized>(
        &mut self,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
        error: LoopError,
    ) -> Option<RecorderEvent> {
        let session = self.session.take()?;
        Self::release(session.pending_events.iter().copied(), &session.phase, clock, device);
        Some(Self::resolve_failure(session.owner, session.id, session.completion, error))
    }

    fn resolve_failure(
        unit: UnitId,
        session: SessionId,
        completion: Option<Completion>,
        error: LoopError,
    ) -> RecorderEvent {
        tracing::warn!(unit = %unit, session = session.0, %error, "capture failed");
        if let Some(tx) = completion {
            let _ = tx.send(Err(error.clone()));
        }
        RecorderEvent::Failed {
            unit,
            session,
            error,
        }
    }

    fn release<C: ClockSource + ?Sized>(
        pending: impl Iterator<Item = EventId>,
        phase: &Phase,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
    ) {
        for id in pending {
            clock.cancel(id);
        }
        if let Phase::Capturing {
            sink: Sink::Audio(token),
            ..
        } = phase
        {
            device.discard(*token);
        }
    }

    /// Cancels the live session, if any. Pending clock events are removed,
    /// the sink is dropped and the ticket resolves with `reason`.
    pub fn abort<C: ClockSource + ?Sized>(
        &mut self,
        clock: &mut C,
        device: &mut dyn CaptureDevice,
        reason: LoopError,
    ) -> Option<UnitId> {
        let mut session = self.session.take()?;
        Self::release(session.pending_events.iter().copied(), &session.phase, clock, device);
        tracing::info!(unit = %session.owner, session = session.id.0, "capture aborted");
        if let Some(tx) = session.completion.take() {
            let _ = tx.send(Err(reason));
        }
        Some(session.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::RingBufferInput;
    use crate::transport::Transport;
    use approx::assert_relative_eq;
    use ringbuf::HeapProducer;

    const SR: u32 = 1000;

    fn setup(end_detection: EndDetection) -> (Transport, HeapProducer<f32>, RingBufferInput, LoopRecorder) {
        let mut clock = Transport::new(120.0, 4, 16);
        clock.start();
        let (producer, input) = RingBufferInput::with_capacity(1 << 16, SR, 0.0);
        (clock, producer, input, LoopRecorder::new(end_detection))
    }

    /// Advances in 10 ms steps, feeding input and routing events, until the
    /// recorder reports something or `secs` elapse.
    fn run(
        secs: f64,
        clock: &mut Transport,
        producer: &mut HeapProducer<f32>,
        input: &mut RingBufferInput,
        recorder: &mut LoopRecorder,
        pointer: Option<Coord>,
    ) -> Vec<RecorderEvent> {
        let mut events = Vec::new();
        let steps = (secs / 0.01).round() as usize;
        for _ in 0..steps {
            producer.push_slice(&[0.5; 10]);
            for fired in clock.advance(0.01) {
                if let Ok(Some(ev)) = recorder.handle_clock_event(&fired, clock, input) {
                    events.push(ev);
                }
            }
            if let Some(ev) = recorder.poll(clock, input, pointer) {
                events.push(ev);
            }
        }
        events
    }

    #[test]
    fn test_watcher_detects_wrap() {
        let mut w = LoopWatcher::default();
        assert!(!w.observe(LoopPosition { bar: 3, beat: 3.5 }, 0));
        assert!(!w.observe(LoopPosition { bar: 3, beat: 3.9 }, 0));
        assert!(w.observe(LoopPosition { bar: 0, beat: 0.1 }, 1));
        // A skipped full cycle still counts.
        assert!(w.observe(LoopPosition { bar: 1, beat: 0.0 }, 2));
    }

    #[test]
    fn test_arm_waits_for_boundary_then_captures_one_loop() {
        let (mut clock, mut producer, mut input, mut recorder) = setup(EndDetection::Polling);
        clock.advance(6.0); // beat 12
        let mut ticket = recorder
            .arm(UnitId(0), TrackKind::Audio, &mut clock, &mut input)
            .unwrap();
        assert_eq!(recorder.state(), RecorderState::Armed);

        let started = run(2.5, &mut clock, &mut producer, &mut input, &mut recorder, None);
        assert!(matches!(
            started.as_slice(),
            [RecorderEvent::Started { at_beats, .. }] if (*at_beats - 16.0).abs() < 1e-9
        ));
        assert_eq!(recorder.state(), RecorderState::Capturing);

        let finished = run(8.0, &mut clock, &mut producer, &mut input, &mut recorder, None);
        let capture = match finished.into_iter().next() {
            Some(RecorderEvent::Finished(capture)) => capture,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_relative_eq!(capture.capture_start_beats, 16.0);
        assert_relative_eq!(capture.nominal_secs, 8.0);
        assert_relative_eq!(capture.actual_secs, 8.0, epsilon = 0.05);
        assert!(ticket.try_outcome().is_none());
        let (_, completion) = capture.into_parts();
        completion.resolve(Err(LoopError::CaptureAborted));
        assert_eq!(ticket.try_outcome(), Some(Err(LoopError::CaptureAborted)));
    }

    #[test]
    fn test_second_arm_is_rejected() {
        let (mut clock, _producer, mut input, mut recorder) = setup(EndDetection::Polling);
        recorder
            .arm(UnitId(0), TrackKind::Audio, &mut clock, &mut input)
            .unwrap();
        let second = recorder.arm(UnitId(1), TrackKind::Instrument, &mut clock, &mut input);
        assert!(matches!(second, Err(LoopError::AlreadyCapturing)));
        assert_eq!(recorder.owner(), Some(UnitId(0)));
    }

    #[test]
    fn test_unavailable_device_fails_fast() {
        let mut clock = Transport::default();
        let mut input = RingBufferInput::disconnected(SR);
        let mut recorder = LoopRecorder::new(EndDetection::Polling);
        let armed = recorder.arm(UnitId(0), TrackKind::Audio, &mut clock, &mut input);
        assert!(matches!(armed, Err(LoopError::DeviceUnavailable(_))));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert_eq!(clock.pending_events(), 0);
    }

    #[test]
    fn test_abort_cancels_pending_start() {
        let (mut clock, _producer, mut input, mut recorder) = setup(EndDetection::Polling);
        let mut ticket = recorder
            .arm(UnitId(4), TrackKind::Audio, &mut clock, &mut input)
            .unwrap();
        assert_eq!(clock.pending_events(), 1);
        let owner = recorder.abort(&mut clock, &mut input, LoopError::CaptureAborted);
        assert_eq!(owner, Some(UnitId(4)));
        assert_eq!(clock.pending_events(), 0);
        assert_eq!(ticket.try_outcome(), Some(Err(LoopError::CaptureAborted)));
    }

    #[test]
    fn test_stale_event_is_a_scheduling_race() {
        let (mut clock, _producer, mut input, mut recorder) = setup(EndDetection::Polling);
        let ticket = recorder
            .arm(UnitId(0), TrackKind::Audio, &mut clock, &mut input)
            .unwrap();
        recorder.abort(&mut clock, &mut input, LoopError::CaptureAborted);
        let stale = FiredEvent {
            id: EventId(99),
            action: ClockAction::BeginCapture(ticket.session),
            at_beats: 16.0,
        };
        let result = recorder.handle_clock_event(&stale, &mut clock, &mut input);
        assert!(matches!(result, Err(LoopError::SchedulingRace { .. })));
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn test_gesture_capture_collects_points() {
        let (mut clock, mut producer, mut input, mut recorder) = setup(EndDetection::Polling);
        recorder
            .arm(UnitId(1), TrackKind::Instrument, &mut clock, &mut input)
            .unwrap();
        // Start fires at beat 16 (8 s), then one full loop of pointer input.
        let pointer = Some(Coord::new(0.25, 0.75));
        let mut events = run(8.5, &mut clock, &mut producer, &mut input, &mut recorder, pointer);
        events.extend(run(8.0, &mut clock, &mut producer, &mut input, &mut recorder, pointer));
        let capture = events
            .into_iter()
            .find_map(|ev| match ev {
                RecorderEvent::Finished(c) => Some(c),
                _ => None,
            })
            .expect("capture should finish");
        match capture.content {
            CapturedContent::Gesture(g) => {
                assert!(g.points().len() > 100);
                assert!(g.duration_beats() <= 16.0);
                assert_eq!(g.points()[0].c, Coord::new(0.25, 0.75));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_relative_eq!(capture.actual_secs, 8.0, epsilon = 0.05);
    }

    #[test]
    fn test_scheduled_end_detection() {
        let (mut clock, mut producer, mut input, mut recorder) = setup(EndDetection::Scheduled);
        recorder
            .arm(UnitId(0), TrackKind::Audio, &mut clock, &mut input)
            .unwrap();
        let mut events = run(8.5, &mut clock, &mut producer, &mut input, &mut recorder, None);
        events.extend(run(8.0, &mut clock, &mut producer, &mut input, &mut recorder, None));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RecorderEvent::Finished(c) if (c.nominal_secs - 8.0).abs() < 1e-9)));
        assert_eq!(clock.pending_events(), 0);
    }

    #[test]
    fn test_empty_gesture_is_nothing_captured() {
        let (mut clock, mut producer, mut input, mut recorder) = setup(EndDetection::Polling);
        let mut ticket = recorder
            .arm(UnitId(2), TrackKind::Instrument, &mut clock, &mut input)
            .unwrap();
        let mut events = run(8.5, &mut clock, &mut producer, &mut input, &mut recorder, None);
        events.extend(run(8.0, &mut clock, &mut producer, &mut input, &mut recorder, None));
        assert!(events.iter().any(|ev| matches!(
            ev,
            RecorderEvent::Failed { error: LoopError::NothingCaptured(UnitId(2)), .. }
        )));
        assert_eq!(
            ticket.try_outcome(),
            Some(Err(LoopError::NothingCaptured(UnitId(2))))
        );
    }
}
