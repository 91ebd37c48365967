// src/session.rs

//! Persisted sessions: one directory per session holding `session.json`
//! and a mono WAV file per audio unit.

use crate::filter::FILTER_OPEN_HZ;
use crate::gesture::GesturePoint;
use crate::latency::PhaseCorrection;
use crate::track::{TrackKind, UnitId};
use anyhow::Result;
use chrono::Local;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SESSION_FILE: &str = "session.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionData {
    pub name: String,
    pub saved_at: String,
    pub tempo_bpm: f64,
    pub loop_length_beats: u32,
    pub beats_per_measure: u32,
    #[serde(default)]
    pub master_volume_db: f32,
    pub tracks: Vec<TrackData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TrackData {
    pub id: UnitId,
    pub kind: TrackKind,
    pub name: String,
    pub volume_db: f32,
    pub pan: f32,
    pub muted: bool,
    #[serde(default = "open_filter")]
    pub filter_cutoff_hz: f32,
    pub content: ContentData,
}

fn open_filter() -> f32 {
    FILTER_OPEN_HZ
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentData {
    Audio {
        file: String,
        sample_rate: u32,
        captured_secs: f64,
        correction: PhaseCorrection,
    },
    Gesture {
        points: Vec<GesturePoint>,
        start_offset_beats: f64,
    },
}

/// Session metadata plus the audio each audio unit references.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub data: SessionData,
    pub audio: BTreeMap<UnitId, Arc<Vec<f32>>>,
}

impl Default for SessionData {
    fn default() -> Self {
        Self {
            name: default_session_name(),
            saved_at: Local::now().to_rfc3339(),
            tempo_bpm: crate::transport::DEFAULT_TEMPO_BPM,
            loop_length_beats: crate::transport::DEFAULT_LOOP_MEASURES
                * crate::transport::DEFAULT_BEATS_PER_MEASURE,
            beats_per_measure: crate::transport::DEFAULT_BEATS_PER_MEASURE,
            master_volume_db: 0.0,
            tracks: Vec::new(),
        }
    }
}

pub fn default_session_name() -> String {
    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    format!("Session_{}", timestamp)
}

pub fn audio_file_name(id: UnitId) -> String {
    format!("track_{}.wav", id.0)
}

/// Writes `session` into `parent/<name>/` and returns that directory.
pub fn save_session(parent: &Path, session: &Session) -> Result<PathBuf> {
    let session_dir = parent.join(&session.data.name);
    fs::create_dir_all(&session_dir)?;

    for track in &session.data.tracks {
        if let ContentData::Audio {
            file, sample_rate, ..
        } = &track.content
        {
            let samples = session
                .audio
                .get(&track.id)
                .ok_or_else(|| anyhow::anyhow!("No audio for unit {}", track.id))?;
            write_mono_wav(&session_dir.join(file), samples, *sample_rate)?;
        }
    }

    let json_string = serde_json::to_string_pretty(&session.data)?;
    fs::write(session_dir.join(SESSION_FILE), json_string)?;
    tracing::info!(path = %session_dir.display(), tracks = session.data.tracks.len(), "session saved");
    Ok(session_dir)
}

/// Reads a session directory. Audio is resampled to `target_sr` when it was
/// saved at another rate.
pub fn load_session(session_dir: &Path, target_sr: u32) -> Result<Session> {
    let json_path = session_dir.join(SESSION_FILE);
    let json_string = fs::read_to_string(&json_path)
        .map_err(|e| anyhow::anyhow!("Failed to read session file {}: {}", json_path.display(), e))?;
    let mut data: SessionData = serde_json::from_str(&json_string)
        .map_err(|e| anyhow::anyhow!("Failed to parse session file {}: {}", json_path.display(), e))?;

    let mut audio = BTreeMap::new();
    for track in data.tracks.iter_mut() {
        if let ContentData::Audio {
            file, sample_rate, ..
        } = &mut track.content
        {
            let path = session_dir.join(&*file);
            let (samples, file_sr) = read_mono_wav(&path)?;
            if file_sr != *sample_rate {
                tracing::warn!(
                    file = %path.display(),
                    file_sr,
                    listed_sr = *sample_rate,
                    "sample rate in session file disagrees with the WAV header, using the header"
                );
            }
            let samples = resample(samples, file_sr as f32, target_sr as f32)?;
            *sample_rate = target_sr;
            audio.insert(track.id, Arc::new(samples));
        }
    }
    tracing::info!(path = %session_dir.display(), tracks = data.tracks.len(), "session loaded");
    Ok(Session { data, audio })
}

/// Session directories under `parent`, sorted by name.
pub fn list_sessions(parent: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    if !parent.exists() {
        return Ok(names);
    }
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if entry.path().join(SESSION_FILE).is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn write_mono_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        let amplitude = i16::MAX as f32;
        writer.write_sample((sample.clamp(-1.0, 1.0) * amplitude) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Decodes a mono WAV file of any integer depth or 32-bit float. Returns
/// the samples and the rate in the file's header.
fn read_mono_wav(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = BufReader::new(File::open(path)?);
    let reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    if spec.channels != 1 {
        return Err(anyhow::anyhow!("Expected mono WAV file for session loop"));
    }

    let mono_samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let full_scale = (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / full_scale))
                .collect::<std::result::Result<Vec<f32>, _>>()
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<Vec<f32>, _>>(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to decode {}: {}", path.display(), e))?;

    if mono_samples.is_empty() {
        return Err(anyhow::anyhow!("Session loop {} holds no audio", path.display()));
    }
    Ok((mono_samples, spec.sample_rate))
}

fn resample(mono_samples: Vec<f32>, source_sr: f32, target_sr: f32) -> Result<Vec<f32>> {
    if (source_sr - target_sr).abs() <= 1e-3 || mono_samples.is_empty() {
        return Ok(mono_samples);
    }

    tracing::info!("Resampling session loop from {} Hz to {} Hz", source_sr, target_sr);
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        target_sr as f64 / source_sr as f64,
        2.0,
        params,
        mono_samples.len(),
        1,
    )?;
    let waves_in = vec![mono_samples];
    let waves_out = resampler.process(&waves_in, None)?;
    Ok(waves_out.into_iter().next().unwrap_or_default())
}
