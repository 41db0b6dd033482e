//! Shared types and persistence for the PipiTrek autoguider.
//!
//! Everything here is consumed by at least two of the `hardware`, `guider`
//! and `server` crates: the published frame type, coordinate and angle
//! conversions, the hot-pixel map, the settings file and the per-day
//! status log.

pub mod conversions;
pub mod frame;
pub mod hot_pixel_map;
pub mod settings;
pub mod status_log;

pub use frame::Frame;
pub use hot_pixel_map::HotPixelMap;
pub use settings::{Settings, SettingsStore};
pub use status_log::StatusLog;
