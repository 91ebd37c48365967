// src/audio_io.rs

//! Live device streams (feature `device`).
//!
//! The input callback downmixes to mono and pushes into the capture ring
//! buffer. The output callback plays interleaved stereo frames rendered by
//! the engine thread. The two devices may run at different rates; each
//! rate is reported so captures are labelled with the input's own rate.

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, FromSample, Sample, SampleFormat, Stream, StreamConfig};
use ringbuf::{HeapConsumer, HeapProducer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct ActiveStreams {
    pub input: Stream,
    pub output: Stream,
    /// Rate of the capture stream; recorded audio is labelled with it.
    pub input_sample_rate: u32,
    /// Rate the engine renders at.
    pub output_sample_rate: u32,
    pub buffer_size: u32,
}

/// Applies a requested rate and buffer size. Without a request the device
/// keeps its default.
fn apply_request(config: &mut StreamConfig, sample_rate: Option<u32>, buffer_size: Option<u32>) {
    if let Some(sr) = sample_rate {
        config.sample_rate = cpal::SampleRate(sr);
    }
    if let Some(bs) = buffer_size {
        config.buffer_size = BufferSize::Fixed(bs);
    }
}

fn find_device(name: Option<&str>, input: bool) -> Result<Device> {
    let host = cpal::default_host();
    match (name, input) {
        (Some(name), true) => host
            .input_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Input device not found: {}", name)),
        (Some(name), false) => host
            .output_devices()?
            .find(|d| d.name().ok().as_deref() == Some(name))
            .ok_or_else(|| anyhow::anyhow!("Output device not found: {}", name)),
        (None, true) => host
            .default_input_device()
            .ok_or_else(|| anyhow::anyhow!("No default input device")),
        (None, false) => host
            .default_output_device()
            .ok_or_else(|| anyhow::anyhow!("No default output device")),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn init_and_run_streams(
    input_device_name: Option<&str>,
    output_device_name: Option<&str>,
    requested_sample_rate: Option<u32>,
    requested_buffer_size: Option<u32>,
    input_producer: HeapProducer<f32>,
    output_consumer: HeapConsumer<f32>,
    stream_error: Arc<AtomicBool>,
    xrun_count: Arc<AtomicUsize>,
) -> Result<ActiveStreams> {
    let input_device = find_device(input_device_name, true)?;
    let output_device = find_device(output_device_name, false)?;
    tracing::info!("Using input device: {}", input_device.name()?);
    tracing::info!("Using output device: {}", output_device.name()?);

    let input_format = input_device.default_input_config()?.sample_format();
    let sample_format = output_device.default_output_config()?.sample_format();
    let mut input_config: StreamConfig = input_device.default_input_config()?.into();
    let mut output_config: StreamConfig = output_device.default_output_config()?.into();
    apply_request(&mut input_config, requested_sample_rate, requested_buffer_size);
    apply_request(&mut output_config, requested_sample_rate, requested_buffer_size);
    if input_config.sample_rate != output_config.sample_rate {
        tracing::warn!(
            input = input_config.sample_rate.0,
            output = output_config.sample_rate.0,
            "input and output run at different sample rates"
        );
    }

    let input = match input_format {
        SampleFormat::F32 => build_input_stream::<f32>(&input_device, &input_config, input_producer, stream_error, xrun_count.clone())?,
        SampleFormat::I16 => build_input_stream::<i16>(&input_device, &input_config, input_producer, stream_error, xrun_count.clone())?,
        SampleFormat::U16 => build_input_stream::<u16>(&input_device, &input_config, input_producer, stream_error, xrun_count.clone())?,
        format => return Err(anyhow::anyhow!("Unsupported input sample format {}", format)),
    };
    let output = match sample_format {
        SampleFormat::F32 => build_output_stream::<f32>(&output_device, &output_config, output_consumer, xrun_count)?,
        SampleFormat::I16 => build_output_stream::<i16>(&output_device, &output_config, output_consumer, xrun_count)?,
        SampleFormat::U16 => build_output_stream::<u16>(&output_device, &output_config, output_consumer, xrun_count)?,
        format => return Err(anyhow::anyhow!("Unsupported sample format {}", format)),
    };
    input.play()?;
    output.play()?;

    let input_sample_rate = input_config.sample_rate.0;
    let output_sample_rate = output_config.sample_rate.0;
    let buffer_size = match output_config.buffer_size {
        BufferSize::Fixed(size) => size,
        BufferSize::Default => 512,
    };
    tracing::info!(
        "Successfully started streams with Sample Rate: {} Hz in, {} Hz out, Buffer Size: {} Samples",
        input_sample_rate,
        output_sample_rate,
        buffer_size
    );
    Ok(ActiveStreams {
        input,
        output,
        input_sample_rate,
        output_sample_rate,
        buffer_size,
    })
}

fn build_input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProducer<f32>,
    stream_error: Arc<AtomicBool>,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample,
    f32: FromSample<T>,
{
    let err_fn = move |err| {
        tracing::error!("an error occurred on input stream: {}", err);
        xrun_count.fetch_add(1, Ordering::Relaxed);
        stream_error.store(true, Ordering::Relaxed);
    };
    let channels = config.channels as usize;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            for frame in data.chunks(channels) {
                let mono_sample =
                    frame.iter().map(|s| f32::from_sample(*s)).sum::<f32>() / (channels as f32);
                // Buffer full: drop the sample.
                let _ = producer.push(mono_sample);
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

fn build_output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut consumer: HeapConsumer<f32>,
    xrun_count: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: Sample + cpal::SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let err_fn = move |err| {
        tracing::error!("an error occurred on output stream: {}", err);
        xrun_count.fetch_add(1, Ordering::Relaxed);
    };

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let left = consumer.pop().unwrap_or(0.0);
                let right = consumer.pop().unwrap_or(left);
                for (ch, sample) in frame.iter_mut().enumerate() {
                    let value = if ch % 2 == 0 { left } else { right };
                    *sample = T::from_sample(value);
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}
