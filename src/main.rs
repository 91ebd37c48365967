// src/main.rs

use anyhow::Result;
use loopstation::capture::RingBufferInput;
use loopstation::engine::command_queue;
use loopstation::gesture::{self, Coord};
use loopstation::settings::{self, AppSettings};
use loopstation::{session, EngineCommand, EngineConfig, LoopEngine, TrackKind, UnitId};
use ringbuf::{HeapProducer, HeapRb};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const COMMAND_QUEUE_CAPACITY: usize = 256;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = settings::load_settings();
    let sessions_dir = settings::sessions_dir().unwrap_or_else(|| PathBuf::from("Sessions"));
    let running = Arc::new(AtomicBool::new(true));

    let requested_sr = settings.sample_rate_or_default();
    let input_rb = HeapRb::<f32>::new((requested_sr * 4) as usize);
    let (input_producer, input_consumer) = input_rb.split();
    let output_rb = HeapRb::<f32>::new((requested_sr * 2) as usize);
    let (output_producer, output_consumer) = output_rb.split();
    let stream_error = Arc::new(AtomicBool::new(false));

    #[cfg(feature = "device")]
    let (_streams, input_sample_rate, sample_rate) = {
        let streams = loopstation::audio_io::init_and_run_streams(
            settings.input_device.as_deref(),
            settings.output_device.as_deref(),
            settings.sample_rate,
            settings.buffer_size,
            input_producer,
            output_consumer,
            stream_error.clone(),
            Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        )?;
        let (input_sr, output_sr) = (streams.input_sample_rate, streams.output_sample_rate);
        (streams, input_sr, output_sr)
    };

    #[cfg(not(feature = "device"))]
    let (input_sample_rate, sample_rate) = {
        tracing::info!("Built without the `device` feature, recording a synthetic test tone");
        drop(output_consumer);
        spawn_test_tone(input_producer, requested_sr, running.clone());
        (requested_sr, requested_sr)
    };

    let mut input = RingBufferInput::new(input_consumer, input_sample_rate, settings.input_latency_compensation_ms);
    input.set_error_flag(stream_error);

    let (mut command_producer, command_consumer) = command_queue(COMMAND_QUEUE_CAPACITY);
    let config = EngineConfig {
        sample_rate,
        ..EngineConfig::from(&settings)
    };
    let mut engine = LoopEngine::new(config, Box::new(input)).with_commands(command_consumer);
    engine.subscribe(Box::new(|id, state| {
        tracing::info!(unit = %id, ?state, "unit state");
    }));

    let engine_thread = spawn_engine(engine, output_producer, &settings, running.clone());

    println!("loopstation ready. Type `help` for commands.");
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_command(line, &sessions_dir) {
            Ok(Parsed::Command(command)) => {
                if command_producer.push(command).is_err() {
                    tracing::warn!("Command ringbuffer full. Command dropped.");
                }
            }
            Ok(Parsed::ListSessions) => match session::list_sessions(&sessions_dir) {
                Ok(names) if names.is_empty() => println!("No saved sessions."),
                Ok(names) => names.iter().for_each(|n| println!("{}", n)),
                Err(e) => tracing::warn!("Failed to list sessions: {}", e),
            },
            Ok(Parsed::Help) => print_help(),
            Ok(Parsed::Quit) => break,
            Err(e) => println!("{}", e),
        }
    }

    running.store(false, Ordering::Relaxed);
    if engine_thread.join().is_err() {
        tracing::error!("Engine thread panicked");
    }
    settings::save_settings(&settings);
    Ok(())
}

fn spawn_engine(
    mut engine: LoopEngine,
    mut output: HeapProducer<f32>,
    settings: &AppSettings,
    running: Arc<AtomicBool>,
) -> thread::JoinHandle<()> {
    let tick = Duration::from_secs_f64(1.0 / settings.tick_rate_hz.max(1) as f64);
    thread::spawn(move || {
        let sample_rate = engine.sample_rate() as f64;
        let mut left = Vec::new();
        let mut right = Vec::new();
        let mut interleaved = Vec::new();
        let mut last = Instant::now();
        let mut frame_debt = 0.0;
        while running.load(Ordering::Relaxed) {
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;
            engine.tick(dt);

            frame_debt += dt * sample_rate;
            let frames = frame_debt.floor() as usize;
            frame_debt -= frames as f64;
            left.resize(frames, 0.0);
            right.resize(frames, 0.0);
            engine.render(&mut left, &mut right);
            interleaved.clear();
            for (l, r) in left.iter().zip(right.iter()) {
                interleaved.push(*l);
                interleaved.push(*r);
            }
            output.push_slice(&interleaved);

            thread::sleep(tick.saturating_sub(now.elapsed()));
        }
    })
}

#[cfg(not(feature = "device"))]
fn spawn_test_tone(mut producer: HeapProducer<f32>, sample_rate: u32, running: Arc<AtomicBool>) {
    thread::spawn(move || {
        let chunk = (sample_rate / 100).max(1) as usize;
        let mut phase = 0.0f32;
        let mut buffer = vec![0.0f32; chunk];
        while running.load(Ordering::Relaxed) {
            for s in buffer.iter_mut() {
                phase = (phase + 220.0 / sample_rate as f32) % 1.0;
                *s = (phase * std::f32::consts::TAU).sin() * 0.25;
            }
            producer.push_slice(&buffer);
            thread::sleep(Duration::from_millis(10));
        }
    });
}

#[derive(Debug)]
enum Parsed {
    Command(EngineCommand),
    ListSessions,
    Help,
    Quit,
}

fn arg<T: std::str::FromStr>(parts: &[&str], index: usize, what: &str) -> Result<T> {
    parts
        .get(index)
        .ok_or_else(|| anyhow::anyhow!("Missing {}", what))?
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid {}: {}", what, parts[index]))
}

fn unit(parts: &[&str]) -> Result<UnitId> {
    Ok(UnitId(arg(parts, 1, "unit id")?))
}

fn parse_command(line: &str, sessions_dir: &std::path::Path) -> Result<Parsed> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let command = match parts.first().copied().unwrap_or_default() {
        "new" => match parts.get(1).copied() {
            Some("audio") => EngineCommand::CreateUnit(TrackKind::Audio),
            Some("instrument") => EngineCommand::CreateUnit(TrackKind::Instrument),
            _ => return Err(anyhow::anyhow!("Usage: new audio|instrument")),
        },
        "arm" => EngineCommand::ArmUnit(unit(&parts)?),
        "clear" => EngineCommand::ClearUnit(unit(&parts)?),
        "del" => EngineCommand::DeleteUnit(unit(&parts)?),
        "mute" => EngineCommand::ToggleMute(unit(&parts)?),
        "vol" => EngineCommand::SetVolume {
            unit: unit(&parts)?,
            db: arg(&parts, 2, "volume")?,
        },
        "pan" => EngineCommand::SetPan {
            unit: unit(&parts)?,
            pan: arg(&parts, 2, "pan")?,
        },
        "filter" => EngineCommand::SetFilterCutoff {
            unit: unit(&parts)?,
            hz: arg(&parts, 2, "cutoff")?,
        },
        "preset" => {
            let name: String = arg(&parts, 2, "preset name")?;
            if gesture::preset(&name).is_none() {
                return Err(anyhow::anyhow!(
                    "Unknown preset {}. Available: {}",
                    name,
                    gesture::PRESET_NAMES.join(", ")
                ));
            }
            EngineCommand::LoadPresetGesture {
                unit: unit(&parts)?,
                name,
            }
        }
        "play" => EngineCommand::TogglePlayback,
        "tempo" => EngineCommand::SetTempo(arg(&parts, 1, "tempo")?),
        "len" => EngineCommand::SetLoopLength(arg(&parts, 1, "loop length")?),
        "point" => EngineCommand::SetPointer(Some(Coord::new(
            arg(&parts, 1, "x")?,
            arg(&parts, 2, "y")?,
        ))),
        "release" => EngineCommand::SetPointer(None),
        "metronome" => EngineCommand::ToggleMetronome,
        "master" => EngineCommand::SetMasterVolume(arg(&parts, 1, "volume")?),
        "status" => EngineCommand::LogStatus,
        "save" => EngineCommand::SaveSession {
            parent: sessions_dir.to_path_buf(),
            name: parts.get(1).map(|s| s.to_string()),
        },
        "load" => {
            let name: String = arg(&parts, 1, "session name")?;
            EngineCommand::LoadSession {
                path: sessions_dir.join(name),
            }
        }
        "sessions" => return Ok(Parsed::ListSessions),
        "help" => return Ok(Parsed::Help),
        "quit" | "exit" => return Ok(Parsed::Quit),
        other => return Err(anyhow::anyhow!("Unknown command: {}", other)),
    };
    Ok(Parsed::Command(command))
}

fn print_help() {
    println!(
        "new audio|instrument    create a unit
arm <id>                record the next loop into a unit
clear <id> | del <id>   drop a unit's loop / remove the unit
mute <id>               toggle mute
vol <id> <db>           set volume
pan <id> <-1..1>        set pan
filter <id> <hz>        set low-pass cutoff (20000 = open)
preset <id> <name>      load a preset gesture ({})
play                    start/stop the transport
tempo <bpm>             set tempo
len <beats>             set loop length
point <x> <y>           move the pointer (0..1), release to lift it
metronome               toggle the click
master <db>             set master volume
status                  log transport and units
save [name] | load <name> | sessions
quit",
        gesture::PRESET_NAMES.join(", ")
    );
}
