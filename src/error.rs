// src/error.rs

//! Error types for the loop engine.

use crate::track::UnitId;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoopError {
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Another unit is already armed or capturing")]
    AlreadyCapturing,

    #[error("Unknown unit: {0}")]
    UnknownUnit(UnitId),

    #[error("Unit {0} already holds a loop; clear it before recording again")]
    NotEmpty(UnitId),

    #[error("Capture was aborted before it finished")]
    CaptureAborted,

    #[error("Capture failed: {0}")]
    CaptureFailed(String),

    #[error("Capture on unit {0} ended without any content")]
    NothingCaptured(UnitId),

    #[error("Stale clock callback for session {session}")]
    SchedulingRace { session: u64 },

    #[error("Unit {0} is not an instrument unit")]
    NotInstrument(UnitId),

    #[error("Unknown gesture preset: {0}")]
    UnknownPreset(String),

    #[error("Invalid tempo: {0}. Must be a positive number of BPM")]
    InvalidTempo(f64),

    #[error("Invalid loop length: {beats} beats. Must be a positive multiple of {beats_per_measure}")]
    InvalidLoopLength { beats: u32, beats_per_measure: u32 },
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, LoopError>;
