//! Guiding configuration, the rotation model and the correction record.

use serde::{Deserialize, Serialize};

use crate::{GuideError, GuideResult};

/// Guide-output strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum GuideMethod {
    /// Threshold at `max_drift`, correct with timed move/stop pulses.
    Pulse,
    /// Proportional speed command each iteration.
    Speed,
    /// PID-controlled speed command each iteration.
    #[default]
    Pid,
}

/// Mutable guiding knobs, sampled once at the top of each guide iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuideConfig {
    /// Arcsecond threshold for pulse-mode corrections, 0..=50.
    pub max_drift: f64,
    /// Minimum contour area for a detection, 1..=100.
    pub star_size: f64,
    /// Binarization cutoff, 0..=255.
    pub gray_threshold: u8,
    /// Seconds between guide iterations.
    pub guide_interval: f64,
    /// Seconds between pulse move start and stop.
    pub guide_pulse: f64,
    /// Pixel radius for re-associating a star with its hint.
    pub max_distance: f64,
    pub method: GuideMethod,
    /// DEC corrections are forced to zero when off.
    pub dec_guiding: bool,
}

impl Default for GuideConfig {
    fn default() -> Self {
        Self {
            max_drift: 10.0,
            star_size: 100.0,
            gray_threshold: 150,
            guide_interval: 1.0,
            guide_pulse: 0.4,
            max_distance: 10.0,
            method: GuideMethod::Pid,
            dec_guiding: false,
        }
    }
}

impl GuideConfig {
    pub fn validate_max_drift(value: f64) -> GuideResult<f64> {
        if (0.0..=50.0).contains(&value) {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("max_drift", value, "0..=50"))
        }
    }

    pub fn validate_star_size(value: f64) -> GuideResult<f64> {
        if (1.0..=100.0).contains(&value) {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("star_size", value, "1..=100"))
        }
    }

    pub fn validate_guide_interval(value: f64) -> GuideResult<f64> {
        if value > 0.0 && value <= 60.0 {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("guide_interval", value, "0..=60"))
        }
    }

    pub fn validate_guide_pulse(value: f64) -> GuideResult<f64> {
        if value > 0.0 && value <= 10.0 {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("guide_pulse", value, "0..=10"))
        }
    }

    pub fn validate_max_distance(value: f64) -> GuideResult<f64> {
        if value > 0.0 && value <= 500.0 {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("max_distance", value, "0..=500"))
        }
    }
}

/// Field-to-mount rotation and plate-scale model, set by calibration or
/// loaded from settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationModel {
    /// Field rotation in degrees, -180..=180.
    pub rotation_angle: f64,
    /// Arcseconds per pixel at the equator, 0.1..=10.
    pub pixel_scale: f64,
    /// Whole arcseconds of backlash compensation per axis.
    pub backlash_ra: u16,
    pub backlash_dec: u16,
}

impl Default for RotationModel {
    fn default() -> Self {
        Self {
            rotation_angle: 0.0,
            pixel_scale: 3.6,
            backlash_ra: 0,
            backlash_dec: 0,
        }
    }
}

impl RotationModel {
    pub fn validate_rotation_angle(value: f64) -> GuideResult<f64> {
        if (-180.0..=180.0).contains(&value) {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("rotation_angle", value, "-180..=180"))
        }
    }

    pub fn validate_pixel_scale(value: f64) -> GuideResult<f64> {
        if (0.1..=10.0).contains(&value) {
            Ok(value)
        } else {
            Err(GuideError::OutOfRange("pixel_scale", value, "0.1..=10"))
        }
    }
}

/// Result of one guide iteration, immutable once published.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Correction {
    /// Drift in rotated (mount-frame) pixel axes.
    pub ra_px: f64,
    pub dec_px: f64,
    /// Drift in arcseconds.
    pub ra_arcsec: f64,
    pub dec_arcsec: f64,
    /// Chosen pulse direction per axis, -1 | 0 | +1.
    pub ra: i8,
    pub dec: i8,
    /// Chosen speed per axis, arcsec per 10 s.
    pub ra_speed: i32,
    pub dec_speed: i32,
}

impl Correction {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_accepts_bounds_and_rejects_beyond() {
        assert!(GuideConfig::validate_max_drift(0.0).is_ok());
        assert!(GuideConfig::validate_max_drift(50.0).is_ok());
        assert!(GuideConfig::validate_max_drift(50.1).is_err());
        assert!(GuideConfig::validate_star_size(0.5).is_err());
        assert!(RotationModel::validate_rotation_angle(-180.0).is_ok());
        assert!(RotationModel::validate_rotation_angle(180.1).is_err());
        assert!(RotationModel::validate_pixel_scale(0.05).is_err());
    }

    #[test]
    fn zero_correction_is_zero() {
        assert!(Correction::zero().is_zero());
        let c = Correction {
            ra_arcsec: 1.0,
            ..Correction::zero()
        };
        assert!(!c.is_zero());
    }

    #[test]
    fn guide_method_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&GuideMethod::Speed).unwrap(),
            r#""SPEED""#
        );
    }
}
