// src/settings.rs

use crate::metronome::DEFAULT_METRONOME_VOLUME_DB;
use crate::recorder::EndDetection;
use crate::transport::{DEFAULT_BEATS_PER_MEASURE, DEFAULT_LOOP_MEASURES, DEFAULT_TEMPO_BPM};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub sample_rate: Option<u32>,
    pub buffer_size: Option<u32>,
    pub input_latency_compensation_ms: f32,
    pub tempo_bpm: f64,
    pub beats_per_measure: u32,
    pub loop_measures: u32,
    pub end_detection: EndDetection,
    pub tick_rate_hz: u32,
    pub metronome_enabled: bool,
    pub metronome_volume_db: f32,
    pub master_volume_db: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: None,
            buffer_size: None,
            input_latency_compensation_ms: 5.0, // Default to 5ms safety buffer
            tempo_bpm: DEFAULT_TEMPO_BPM,
            beats_per_measure: DEFAULT_BEATS_PER_MEASURE,
            loop_measures: DEFAULT_LOOP_MEASURES,
            end_detection: EndDetection::Polling,
            tick_rate_hz: 60,
            metronome_enabled: false,
            metronome_volume_db: DEFAULT_METRONOME_VOLUME_DB,
            master_volume_db: 0.0,
        }
    }
}

impl AppSettings {
    pub fn loop_length_beats(&self) -> u32 {
        self.loop_measures.max(1) * self.beats_per_measure.max(1)
    }

    pub fn sample_rate_or_default(&self) -> u32 {
        self.sample_rate.unwrap_or(48_000)
    }
}

fn fallback_dir() -> Option<PathBuf> {
    let exe_path = env::current_exe().ok()?;
    Some(exe_path.parent()?.join("AppSettings"))
}

/// Resolves (and creates) the config directory with its `Sessions` subdirectory.
pub fn get_config_dir() -> Option<PathBuf> {
    let app_settings_dir = ProjectDirs::from("", "", "loopstation")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .or_else(fallback_dir);
    let Some(app_settings_dir) = app_settings_dir else {
        tracing::warn!("Could not determine a config directory.");
        return None;
    };

    for dir in [&app_settings_dir, &app_settings_dir.join("Sessions")] {
        if !dir.exists() {
            if let Err(e) = fs::create_dir_all(dir) {
                tracing::warn!("Failed to create directory at {}: {}", dir.display(), e);
                return None;
            }
        }
    }
    Some(app_settings_dir)
}

pub fn sessions_dir() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("Sessions"))
}

pub fn save_settings(settings: &AppSettings) {
    if let Some(dir) = get_config_dir() {
        save_settings_to(&dir.join(SETTINGS_FILE), settings);
    }
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) {
    match serde_json::to_string_pretty(settings) {
        Ok(json_string) => {
            if let Err(e) = fs::write(path, json_string) {
                tracing::warn!("Failed to write settings to {}: {}", path.display(), e);
            }
        }
        Err(e) => {
            tracing::warn!("Failed to serialize settings: {}", e);
        }
    }
}

pub fn load_settings() -> AppSettings {
    match get_config_dir() {
        Some(dir) => load_settings_from(&dir.join(SETTINGS_FILE)),
        None => AppSettings::default(),
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    if !path.exists() {
        return AppSettings::default();
    }
    match fs::read_to_string(path) {
        Ok(json_string) => match serde_json::from_str(&json_string) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Failed to parse settings file, using defaults. Error: {}", e);
                AppSettings::default()
            }
        },
        Err(e) => {
            tracing::warn!("Failed to read settings file, using defaults. Error: {}", e);
            AppSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        let settings = AppSettings {
            tempo_bpm: 96.0,
            loop_measures: 2,
            end_detection: EndDetection::Scheduled,
            ..AppSettings::default()
        };
        save_settings_to(&path, &settings);
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, r#"{ "tempo_bpm": 90.0, "end_detection": "scheduled" }"#).unwrap();
        let settings = load_settings_from(&path);
        assert_eq!(settings.tempo_bpm, 90.0);
        assert_eq!(settings.end_detection, EndDetection::Scheduled);
        assert_eq!(settings.loop_length_beats(), 16);
    }

    #[test]
    fn test_garbage_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, "not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
        assert_eq!(load_settings_from(&dir.path().join("missing.json")), AppSettings::default());
    }
}
