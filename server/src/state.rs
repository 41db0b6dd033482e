//! Shared application state and the trait adapters wiring the guider to
//! the real hardware.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use guider::{FrameSource, Guider, MountCommander, PulseDirection};
use hardware::camera::CameraSource;
use hardware::mount::{Direction, MountLink, SlewRate};
use shared::{SettingsStore, StatusLog};

use crate::mjpeg::MjpegBroadcaster;

/// A GOTO/sync request decoded from the Stellarium protocol, forwarded to
/// the telescope WebSocket.
#[derive(Debug, Clone)]
pub struct SlewRequest {
    pub ra: String,
    pub dec: String,
}

/// Everything the request handlers need.
pub struct AppState {
    pub guider: Arc<Guider>,
    pub camera: Option<Arc<CameraSource>>,
    pub mount: Option<Arc<MountLink>>,
    pub settings_store: SettingsStore,
    pub status_log: Arc<StatusLog>,
    pub data_dir: PathBuf,
    pub video_feed: MjpegBroadcaster,
    pub thresh_feed: MjpegBroadcaster,
    pub slew_requests: broadcast::Sender<SlewRequest>,
    pub flasher: String,
    pub flasher_args: Vec<String>,
    pub shutdown: tokio::sync::Notify,
}

/// Adapts the serial mount link to the guider's command surface.
pub struct MountAdapter(pub Arc<MountLink>);

impl MountAdapter {
    fn direction(direction: PulseDirection) -> Direction {
        match direction {
            PulseDirection::North => Direction::North,
            PulseDirection::South => Direction::South,
            PulseDirection::East => Direction::East,
            PulseDirection::West => Direction::West,
        }
    }
}

impl MountCommander for MountAdapter {
    fn correction_pulse(&self, direction: PulseDirection, seconds: f64) -> Result<(), String> {
        self.0
            .send_correction(Self::direction(direction), seconds)
            .map_err(|e| e.to_string())
    }

    fn start_movement(&self, ra_speed: i32, dec_speed: i32) -> Result<(), String> {
        self.0
            .send_start_movement_speed(ra_speed, dec_speed)
            .map_err(|e| e.to_string())
    }

    fn stop_all(&self) -> Result<(), String> {
        self.0.send_stop(None).map_err(|e| e.to_string())
    }

    fn set_guide_rate(&self) -> Result<(), String> {
        self.0.send_rate(SlewRate::Guide).map_err(|e| e.to_string())
    }

    fn set_backlash(&self, ra_arcsec: u16, dec_arcsec: u16) -> Result<(), String> {
        self.0
            .set_backlash_ra(ra_arcsec)
            .and_then(|_| self.0.set_backlash_dec(dec_arcsec))
            .map_err(|e| e.to_string())
    }

    fn set_quiet(&self, quiet: bool) {
        self.0.set_quiet(quiet);
    }

    fn quiet(&self) -> bool {
        self.0.quiet()
    }

    fn declination_deg(&self) -> f64 {
        self.0.dec_deg()
    }
}

/// Stand-in mount when the server runs without a serial link; corrections
/// are logged and dropped.
pub struct NullMount;

impl MountCommander for NullMount {
    fn correction_pulse(&self, direction: PulseDirection, seconds: f64) -> Result<(), String> {
        debug!("no mount: dropping pulse {direction:?} for {seconds} s");
        Ok(())
    }

    fn start_movement(&self, ra_speed: i32, dec_speed: i32) -> Result<(), String> {
        debug!("no mount: dropping movement ({ra_speed}, {dec_speed})");
        Ok(())
    }

    fn stop_all(&self) -> Result<(), String> {
        Ok(())
    }

    fn set_guide_rate(&self) -> Result<(), String> {
        Ok(())
    }

    fn set_backlash(&self, _: u16, _: u16) -> Result<(), String> {
        Ok(())
    }

    fn set_quiet(&self, _: bool) {}

    fn quiet(&self) -> bool {
        false
    }

    fn declination_deg(&self) -> f64 {
        0.0
    }
}

/// Adapts the camera capture loop to the guider's frame supply.
pub struct CameraFrames(pub Arc<CameraSource>);

impl FrameSource for CameraFrames {
    fn current_frame(&self) -> Option<Arc<shared::Frame>> {
        self.0.current_frame()
    }
}

/// Frame supply that never produces a frame (camera-less runs).
pub struct NoFrames;

impl FrameSource for NoFrames {
    fn current_frame(&self) -> Option<Arc<shared::Frame>> {
        None
    }
}
