// src/registry.rs

//! Owns every recording unit and its lifecycle state.
//!
//! At most one unit is `Armed` or `Capturing` at any moment. Observers are
//! told about every state transition synchronously, in order. A unit that
//! is removed while not `Empty` reports `Empty` on its way out.

use crate::error::{LoopError, Result};
use crate::track::{Mixable, Recordable, Track, TrackContent, TrackKind, TrackState, UnitId};
use std::collections::BTreeMap;

pub type StateObserver = Box<dyn FnMut(UnitId, TrackState) + Send>;

#[derive(Default)]
pub struct TrackRegistry {
    tracks: BTreeMap<UnitId, Track>,
    next_id: u32,
    observers: Vec<StateObserver>,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an `Empty` unit. Ids are never reused.
    pub fn create_unit(&mut self, kind: TrackKind) -> UnitId {
        let id = UnitId(self.next_id);
        self.next_id += 1;
        self.tracks.insert(id, Track::new(id, kind));
        tracing::info!(unit = %id, ?kind, "unit created");
        self.notify(id, TrackState::Empty);
        id
    }

    pub fn subscribe(&mut self, observer: StateObserver) {
        self.observers.push(observer);
    }

    pub fn get(&self, id: UnitId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: UnitId) -> Result<&mut Track> {
        self.tracks.get_mut(&id).ok_or(LoopError::UnknownUnit(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// The unit currently `Armed` or `Capturing`, if any.
    pub fn busy_unit(&self) -> Option<UnitId> {
        self.tracks
            .values()
            .find(|t| t.state().is_busy())
            .map(|t| t.id)
    }

    /// Checks that `id` may be armed now, without changing anything.
    pub fn check_armable(&self, id: UnitId) -> Result<TrackKind> {
        let track = self.tracks.get(&id).ok_or(LoopError::UnknownUnit(id))?;
        if self.busy_unit().is_some() {
            return Err(LoopError::AlreadyCapturing);
        }
        track.ensure_recordable()?;
        Ok(track.kind())
    }

    pub fn set_state(&mut self, id: UnitId, state: TrackState) -> Result<()> {
        let track = self.get_mut(id)?;
        if track.state() == state {
            return Ok(());
        }
        tracing::debug!(unit = %id, from = ?track.state(), to = ?state, "state transition");
        track.set_state(state);
        self.notify(id, state);
        Ok(())
    }

    /// Stores finished content and moves the unit to `HasContent`.
    pub fn set_content(&mut self, id: UnitId, content: TrackContent) -> Result<()> {
        self.get_mut(id)?.set_content(content);
        self.notify(id, TrackState::HasContent);
        Ok(())
    }

    /// Drops the unit's content and returns it to `Empty`.
    pub fn clear(&mut self, id: UnitId) -> Result<Option<TrackContent>> {
        let track = self.get_mut(id)?;
        let was = track.state();
        let content = track.clear();
        if was != TrackState::Empty {
            self.notify(id, TrackState::Empty);
        }
        Ok(content)
    }

    pub fn delete(&mut self, id: UnitId) -> Result<Track> {
        let track = self.tracks.remove(&id).ok_or(LoopError::UnknownUnit(id))?;
        if track.state() != TrackState::Empty {
            self.notify(id, TrackState::Empty);
        }
        tracing::info!(unit = %id, "unit deleted");
        Ok(track)
    }

    pub fn set_volume_db(&mut self, id: UnitId, db: f32) -> Result<()> {
        self.get_mut(id)?.set_volume_db(db);
        Ok(())
    }

    pub fn set_pan(&mut self, id: UnitId, pan: f32) -> Result<()> {
        self.get_mut(id)?.set_pan(pan);
        Ok(())
    }

    pub fn set_muted(&mut self, id: UnitId, muted: bool) -> Result<()> {
        self.get_mut(id)?.set_muted(muted);
        Ok(())
    }

    pub fn set_filter_cutoff_hz(&mut self, id: UnitId, hz: f32) -> Result<()> {
        self.get_mut(id)?.set_filter_cutoff_hz(hz);
        Ok(())
    }

    /// Re-inserts a unit under a fresh id, used when restoring a session.
    pub fn restore_unit(&mut self, mut track: Track) -> UnitId {
        let id = UnitId(self.next_id);
        self.next_id += 1;
        track.id = id;
        let state = track.state();
        self.tracks.insert(id, track);
        self.notify(id, state);
        id
    }

    /// Removes every unit. Ids keep counting up.
    pub fn remove_all(&mut self) -> Vec<Track> {
        let tracks: Vec<Track> = std::mem::take(&mut self.tracks).into_values().collect();
        for track in tracks.iter().filter(|t| t.state() != TrackState::Empty) {
            self.notify(track.id, TrackState::Empty);
        }
        tracks
    }

    fn notify(&mut self, id: UnitId, state: TrackState) {
        for observer in self.observers.iter_mut() {
            observer(id, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gesture;
    use std::sync::{Arc, Mutex};

    fn arm(r: &mut TrackRegistry, id: UnitId) -> Result<TrackKind> {
        let kind = r.check_armable(id)?;
        r.set_state(id, TrackState::Armed)?;
        Ok(kind)
    }

    fn recording_observer(registry: &mut TrackRegistry) -> Arc<Mutex<Vec<(UnitId, TrackState)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe(Box::new(move |id, state| {
            sink.lock().unwrap().push((id, state));
        }));
        seen
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let mut r = TrackRegistry::new();
        let a = r.create_unit(TrackKind::Audio);
        let b = r.create_unit(TrackKind::Instrument);
        r.delete(a).unwrap();
        let c = r.create_unit(TrackKind::Audio);
        assert!(a < b && b < c);
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_only_one_unit_can_be_armed() {
        let mut r = TrackRegistry::new();
        let a = r.create_unit(TrackKind::Audio);
        let b = r.create_unit(TrackKind::Audio);
        arm(&mut r, a).unwrap();
        assert_eq!(arm(&mut r, b), Err(LoopError::AlreadyCapturing));
        assert_eq!(r.get(b).unwrap().state(), TrackState::Empty);
        assert_eq!(r.busy_unit(), Some(a));
    }

    #[test]
    fn test_arm_rejects_unknown_and_full_units() {
        let mut r = TrackRegistry::new();
        assert_eq!(arm(&mut r, UnitId(9)), Err(LoopError::UnknownUnit(UnitId(9))));
        let a = r.create_unit(TrackKind::Instrument);
        let g = gesture::preset("single_note").unwrap();
        r.set_content(a, TrackContent::Gesture(g)).unwrap();
        assert_eq!(arm(&mut r, a), Err(LoopError::NotEmpty(a)));
        r.clear(a).unwrap();
        assert_eq!(arm(&mut r, a), Ok(TrackKind::Instrument));
    }

    #[test]
    fn test_observers_see_transitions_in_order() {
        let mut r = TrackRegistry::new();
        let seen = recording_observer(&mut r);
        let a = r.create_unit(TrackKind::Instrument);
        arm(&mut r, a).unwrap();
        r.set_state(a, TrackState::Capturing).unwrap();
        let g = gesture::preset("quick_rise").unwrap();
        r.set_content(a, TrackContent::Gesture(g)).unwrap();
        r.clear(a).unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (a, TrackState::Empty),
                (a, TrackState::Armed),
                (a, TrackState::Capturing),
                (a, TrackState::HasContent),
                (a, TrackState::Empty),
            ]
        );
    }

    #[test]
    fn test_repeated_state_is_not_renotified() {
        let mut r = TrackRegistry::new();
        let a = r.create_unit(TrackKind::Audio);
        let seen = recording_observer(&mut r);
        r.set_state(a, TrackState::Empty).unwrap();
        r.clear(a).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_removing_a_busy_unit_reports_empty() {
        let mut r = TrackRegistry::new();
        let a = r.create_unit(TrackKind::Instrument);
        let b = r.create_unit(TrackKind::Instrument);
        let c = r.create_unit(TrackKind::Audio);
        let seen = recording_observer(&mut r);
        arm(&mut r, a).unwrap();
        r.delete(a).unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&(a, TrackState::Empty)));

        // Empty units leave silently.
        seen.lock().unwrap().clear();
        r.delete(c).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        let g = gesture::preset("single_note").unwrap();
        r.set_content(b, TrackContent::Gesture(g)).unwrap();
        seen.lock().unwrap().clear();
        assert_eq!(r.remove_all().len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![(b, TrackState::Empty)]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_mix_setters_require_known_unit() {
        let mut r = TrackRegistry::new();
        let a = r.create_unit(TrackKind::Audio);
        r.set_volume_db(a, -6.0).unwrap();
        r.set_muted(a, true).unwrap();
        r.set_filter_cutoff_hz(a, 800.0).unwrap();
        assert!(r.get(a).unwrap().mix().muted);
        assert_eq!(r.get(a).unwrap().mix().filter_cutoff_hz, 800.0);
        assert_eq!(r.set_pan(UnitId(42), 0.5), Err(LoopError::UnknownUnit(UnitId(42))));
    }
}
