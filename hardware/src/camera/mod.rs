//! Guide camera source.
//!
//! A background capture loop reads raw V4L2 frames, integrates N of them
//! pixel-wise, applies the channel gains and the hot-pixel mask, and
//! publishes the result as the current frame. Reconfiguration (mode,
//! geometry, fps, integration count) is requested through the handle and
//! applied between integration rounds.

pub mod capture;
pub mod dark;
pub mod integrator;
pub mod v4l2;

use thiserror::Error;

pub use capture::{CameraSource, CameraStatus};
pub use integrator::FrameAccumulator;
pub use v4l2::{CameraConfig, PixelMode};

/// Errors from the camera source.
///
/// `ReadFailed` is transient and counted toward recovery; `Unresponsive`
/// means recovery attempts are exhausted and the capture loop has stopped.
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame read failed")]
    ReadFailed,
    #[error("camera stopped responding after {attempts} recovery attempts")]
    Unresponsive { attempts: u32 },
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("capture loop is not running")]
    NotRunning,
    #[error("invalid camera configuration: {0}")]
    InvalidConfig(String),
}

pub type CameraResult<T> = Result<T, CameraError>;
