//! Guiding core for the PipiTrek autoguider.
//!
//! Owns the tracked-star set, the star analyzer, the drift computation,
//! the guide-output strategies and the calibration procedure. The mount
//! and the camera are reached through the [`MountCommander`] and
//! [`FrameSource`] traits so the composition root decides what actually
//! sits behind them (and tests substitute recorders).

pub mod analyzer;
pub mod calibration;
pub mod config;
pub mod drift;
pub mod guider;
pub mod pid;
pub mod pulse;

use std::sync::Arc;

use thiserror::Error;

pub use config::{Correction, GuideConfig, GuideMethod, RotationModel};
pub use guider::{Guider, GuiderSnapshot};
pub use pid::PidController;

/// Pulse directions in the mount frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulseDirection {
    North,
    South,
    East,
    West,
}

#[derive(Error, Debug)]
pub enum GuideError {
    #[error("no star detected")]
    NoStar,
    #[error("star already tracked at ({0:.1}, {1:.1})")]
    AlreadyTracked(f64, f64),
    #[error("no tracked star near ({0:.1}, {1:.1})")]
    NotTracked(f64, f64),
    #[error("calibration requires a tracked star")]
    NoTrackedStar,
    #[error("calibration failed: {0}")]
    CalibrationFailed(String),
    #[error("no frame available")]
    NoFrame,
    #[error("{0} {1} out of range {2}")]
    OutOfRange(&'static str, f64, &'static str),
    #[error("mount command failed: {0}")]
    Mount(String),
}

pub type GuideResult<T> = Result<T, GuideError>;

/// Mount operations the guider needs. Implemented by the composition root
/// over the real serial link, and by recorders in tests.
pub trait MountCommander: Send + Sync {
    /// Move in `direction`, hold for `seconds`, then stop that direction.
    /// Blocks for the pulse duration.
    fn correction_pulse(&self, direction: PulseDirection, seconds: f64) -> Result<(), String>;

    /// Start combined movement at per-axis speeds in arcsec per 10 s.
    fn start_movement(&self, ra_speed: i32, dec_speed: i32) -> Result<(), String>;

    /// Stop all mount motion.
    fn stop_all(&self) -> Result<(), String>;

    /// Select the slowest (guide) slew rate.
    fn set_guide_rate(&self) -> Result<(), String>;

    /// Write per-axis backlash compensation in whole arcseconds.
    fn set_backlash(&self, ra_arcsec: u16, dec_arcsec: u16) -> Result<(), String>;

    /// Quiet mode suppresses bridge telemetry polling during calibration.
    fn set_quiet(&self, quiet: bool);
    fn quiet(&self) -> bool;

    /// Current declination in degrees, for the RA plate-scale correction.
    fn declination_deg(&self) -> f64;
}

/// Source of integrated frames. Implemented over the camera capture loop.
pub trait FrameSource: Send + Sync {
    fn current_frame(&self) -> Option<Arc<shared::Frame>>;
}
