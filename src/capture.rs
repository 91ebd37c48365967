// src/capture.rs

//! The capture device the recorder writes through.
//!
//! The device is a single shared resource: it is opened once and reused, and
//! only one sink may be active at a time. Exclusion is enforced by the track
//! registry, the device only refuses a second sink as a last resort.

use crate::error::{LoopError, Result};
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const PULL_CHUNK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkToken(pub u64);

/// Mono samples captured for one loop.
#[derive(Clone, Debug, Default)]
pub struct RawAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl RawAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub trait CaptureDevice: Send {
    fn open(&mut self) -> Result<()>;
    fn is_open(&self) -> bool;
    fn sample_rate(&self) -> u32;
    fn start_capture(&mut self) -> Result<SinkToken>;
    /// Moves pending input into the active sink. Returns the number of samples moved.
    fn pull(&mut self, token: SinkToken) -> Result<usize>;
    fn stop_capture(&mut self, token: SinkToken) -> Result<RawAudio>;
    /// Drops an active sink without producing content.
    fn discard(&mut self, token: SinkToken);
    /// Keeps the input queue from growing while nothing is capturing.
    fn drain_idle(&mut self) {}
}

/// Input fed through a lock-free ring buffer by the audio callback.
pub struct RingBufferInput {
    consumer: Option<HeapConsumer<f32>>,
    sample_rate: u32,
    latency_window: usize,
    stream_error: Arc<AtomicBool>,
    opened: bool,
    active: Option<(SinkToken, Vec<f32>)>,
    next_token: u64,
    scratch: Vec<f32>,
}

impl RingBufferInput {
    pub fn new(consumer: HeapConsumer<f32>, sample_rate: u32, latency_ms: f32) -> Self {
        Self {
            consumer: Some(consumer),
            sample_rate,
            latency_window: latency_window_samples(latency_ms, sample_rate),
            stream_error: Arc::new(AtomicBool::new(false)),
            opened: false,
            active: None,
            next_token: 0,
            scratch: vec![0.0; PULL_CHUNK],
        }
    }

    /// An input with no stream behind it. `open` always fails.
    pub fn disconnected(sample_rate: u32) -> Self {
        Self {
            consumer: None,
            sample_rate,
            latency_window: 0,
            stream_error: Arc::new(AtomicBool::new(false)),
            opened: false,
            active: None,
            next_token: 0,
            scratch: vec![0.0; PULL_CHUNK],
        }
    }

    /// Creates the ring buffer and returns the producer half for the audio callback.
    pub fn with_capacity(
        capacity: usize,
        sample_rate: u32,
        latency_ms: f32,
    ) -> (HeapProducer<f32>, Self) {
        let rb = HeapRb::<f32>::new(capacity.max(1));
        let (producer, consumer) = rb.split();
        (producer, Self::new(consumer, sample_rate, latency_ms))
    }

    /// Flag the stream error callback raises; a raised flag fails the next pull.
    pub fn error_flag(&self) -> Arc<AtomicBool> {
        self.stream_error.clone()
    }

    /// Shares a flag raised by the device's error callback.
    pub fn set_error_flag(&mut self, flag: Arc<AtomicBool>) {
        self.stream_error = flag;
    }

    fn trim_backlog(&mut self) {
        if let Some(consumer) = self.consumer.as_mut() {
            // Only keep the configured safety window of queued input.
            if consumer.len() > self.latency_window {
                let excess = consumer.len() - self.latency_window;
                consumer.skip(excess);
            }
        }
    }
}

fn latency_window_samples(latency_ms: f32, sample_rate: u32) -> usize {
    (latency_ms.max(0.0) / 1000.0 * sample_rate as f32).round() as usize
}

impl CaptureDevice for RingBufferInput {
    fn open(&mut self) -> Result<()> {
        if self.opened {
            return Ok(());
        }
        if self.consumer.is_none() {
            return Err(LoopError::DeviceUnavailable(
                "no input stream connected".to_string(),
            ));
        }
        if self.stream_error.load(Ordering::Relaxed) {
            return Err(LoopError::DeviceUnavailable(
                "input stream reported an error".to_string(),
            ));
        }
        self.opened = true;
        tracing::info!(sample_rate = self.sample_rate, "capture device opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn start_capture(&mut self) -> Result<SinkToken> {
        if !self.opened {
            return Err(LoopError::DeviceUnavailable("device not opened".to_string()));
        }
        if self.active.is_some() {
            return Err(LoopError::AlreadyCapturing);
        }
        self.trim_backlog();
        let token = SinkToken(self.next_token);
        self.next_token += 1;
        self.active = Some((token, Vec::new()));
        Ok(token)
    }

    fn pull(&mut self, token: SinkToken) -> Result<usize> {
        if self.stream_error.load(Ordering::Relaxed) {
            return Err(LoopError::CaptureFailed(
                "input stream reported an error".to_string(),
            ));
        }
        let (active, sink) = match self.active.as_mut() {
            Some((active, sink)) => (*active, sink),
            None => return Err(LoopError::CaptureFailed("no active sink".to_string())),
        };
        if active != token {
            return Err(LoopError::CaptureFailed("stale sink token".to_string()));
        }
        let consumer = match self.consumer.as_mut() {
            Some(consumer) => consumer,
            None => return Ok(0),
        };
        let mut moved = 0;
        loop {
            let n = consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            sink.extend_from_slice(&self.scratch[..n]);
            moved += n;
        }
        Ok(moved)
    }

    fn stop_capture(&mut self, token: SinkToken) -> Result<RawAudio> {
        self.pull(token)?;
        let (_, samples) = self
            .active
            .take()
            .ok_or_else(|| LoopError::CaptureFailed("no active sink".to_string()))?;
        Ok(RawAudio {
            samples,
            sample_rate: self.sample_rate,
        })
    }

    fn discard(&mut self, token: SinkToken) {
        if matches!(self.active, Some((active, _)) if active == token) {
            self.active = None;
        }
    }

    fn drain_idle(&mut self) {
        if self.active.is_none() {
            self.trim_backlog();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_device_is_unavailable() {
        let mut input = RingBufferInput::disconnected(48_000);
        assert!(matches!(input.open(), Err(LoopError::DeviceUnavailable(_))));
        assert!(!input.is_open());
    }

    #[test]
    fn test_captures_pushed_samples() {
        let (mut producer, mut input) = RingBufferInput::with_capacity(4096, 1000, 0.0);
        input.open().unwrap();
        let token = input.start_capture().unwrap();
        producer.push_slice(&[0.5; 300]);
        assert_eq!(input.pull(token).unwrap(), 300);
        producer.push_slice(&[0.25; 200]);
        let raw = input.stop_capture(token).unwrap();
        assert_eq!(raw.samples.len(), 500);
        assert_eq!(raw.sample_rate, 1000);
        assert_eq!(raw.duration_secs(), 0.5);
    }

    #[test]
    fn test_backlog_beyond_latency_window_is_dropped() {
        // 10 ms window at 1 kHz keeps 10 queued samples.
        let (mut producer, mut input) = RingBufferInput::with_capacity(4096, 1000, 10.0);
        input.open().unwrap();
        producer.push_slice(&[0.1; 100]);
        let token = input.start_capture().unwrap();
        let raw = input.stop_capture(token).unwrap();
        assert_eq!(raw.samples.len(), 10);
    }

    #[test]
    fn test_stream_error_fails_pull() {
        let (_producer, mut input) = RingBufferInput::with_capacity(64, 1000, 0.0);
        input.open().unwrap();
        let token = input.start_capture().unwrap();
        input.error_flag().store(true, Ordering::Relaxed);
        assert!(matches!(input.pull(token), Err(LoopError::CaptureFailed(_))));
    }

    #[test]
    fn test_only_one_sink_at_a_time() {
        let (_producer, mut input) = RingBufferInput::with_capacity(64, 1000, 0.0);
        input.open().unwrap();
        let token = input.start_capture().unwrap();
        assert_eq!(input.start_capture(), Err(LoopError::AlreadyCapturing));
        input.discard(token);
        assert!(input.start_capture().is_ok());
    }
}
