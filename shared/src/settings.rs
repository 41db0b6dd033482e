//! Typed settings persisted between runs.
//!
//! One JSON file holds every mutable knob of the guider, the camera and the
//! last known mount state snapshot. Missing keys fall back to the defaults
//! below, so a partially written or older file still loads.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed settings file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// PID gains for one axis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PidGains {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self {
            p: 2.0,
            i: 0.5,
            d: 0.5,
        }
    }
}

/// Guide-output strategy selector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuideMethodSetting {
    Pulse,
    Speed,
    #[default]
    Pid,
}

/// Everything persisted to `settings.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    // Guider.
    pub max_drift: f64,
    pub star_size: f64,
    pub gray_threshold: u8,
    pub rotation_angle: f64,
    pub pixel_scale: f64,
    pub guide_interval: f64,
    pub guide_pulse: f64,
    pub max_distance: f64,
    pub guide_method: GuideMethodSetting,
    pub dec_guiding: bool,
    pub pid_ra: PidGains,
    pub pid_dec: PidGains,

    // Camera.
    pub integrate_frames: u32,
    pub r_channel: f64,
    pub g_channel: f64,
    pub b_channel: f64,
    pub cam_fps: f64,
    pub width: u32,
    pub height: u32,
    pub cam_mode: String,
    pub camera_color: bool,
    /// V4L2 control name → value, applied at startup.
    pub camera_controls: Vec<(String, i64)>,

    // Mount snapshot from the last shutdown (pier, PEC position, tracking).
    pub scope_info: Value,

    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_drift: 10.0,
            star_size: 100.0,
            gray_threshold: 150,
            rotation_angle: 0.0,
            pixel_scale: 3.6,
            guide_interval: 1.0,
            guide_pulse: 0.4,
            max_distance: 10.0,
            guide_method: GuideMethodSetting::Pid,
            dec_guiding: false,
            pid_ra: PidGains::default(),
            pid_dec: PidGains::default(),
            integrate_frames: 5,
            r_channel: 1.0,
            g_channel: 1.0,
            b_channel: 1.0,
            cam_fps: 5.0,
            width: 1280,
            height: 720,
            cam_mode: "MJPG".to_string(),
            camera_color: true,
            camera_controls: Vec::new(),
            scope_info: Value::Null,
            output_dir: PathBuf::from("."),
        }
    }
}

/// Loads and saves [`Settings`] at a fixed path.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when the file is missing.
    /// A malformed file is reported but also falls back, so a corrupt
    /// settings file never prevents startup.
    pub fn load(&self) -> Settings {
        if !self.path.exists() {
            info!("settings file {} not found, using defaults", self.path.display());
            return Settings::default();
        }
        match std::fs::read_to_string(&self.path)
            .map_err(SettingsError::from)
            .and_then(|s| serde_json::from_str(&s).map_err(SettingsError::from))
        {
            Ok(settings) => {
                info!("loaded settings from {}", self.path.display());
                settings
            }
            Err(e) => {
                warn!("failed to load {}: {}, using defaults", self.path.display(), e);
                Settings::default()
            }
        }
    }

    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(settings)?)?;
        info!("saved settings to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.gray_threshold, 150);
        assert_eq!(s.guide_method, GuideMethodSetting::Pid);
        assert!(!s.dec_guiding);
        assert_eq!(s.integrate_frames, 5);
        assert_eq!(s.cam_mode, "MJPG");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        let mut settings = Settings::default();
        settings.rotation_angle = -26.565;
        settings.guide_method = GuideMethodSetting::Pulse;
        settings.camera_controls = vec![("gain".to_string(), 42)];

        store.save(&settings).unwrap();
        assert_eq!(store.load(), settings);
    }

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"gray_threshold": 99}"#).unwrap();

        let loaded = SettingsStore::new(path).load();
        assert_eq!(loaded.gray_threshold, 99);
        assert_eq!(loaded.pixel_scale, 3.6);
        assert_eq!(loaded.pid_ra, PidGains::default());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{").unwrap();
        assert_eq!(SettingsStore::new(path).load(), Settings::default());
    }

    #[test]
    fn guide_method_serializes_uppercase() {
        let json = serde_json::to_string(&GuideMethodSetting::Pulse).unwrap();
        assert_eq!(json, r#""PULSE""#);
    }
}
