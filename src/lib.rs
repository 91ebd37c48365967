// src/lib.rs

//! Loop station engine: arm a unit, capture exactly one loop of audio or
//! pointer gesture at the next loop boundary, compensate the capture latency
//! and keep the result playing in phase with a shared transport.

pub mod capture;
pub mod engine;
pub mod error;
pub mod filter;
pub mod gesture;
pub mod latency;
pub mod metronome;
pub mod notation;
pub mod recorder;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod track;
pub mod transport;

#[cfg(feature = "device")]
pub mod audio_io;

pub use engine::{EngineCommand, EngineConfig, LoopEngine};
pub use error::{LoopError, Result};
pub use track::{TrackKind, TrackState, UnitId};
