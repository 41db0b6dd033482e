//! Telescope mount link.
//!
//! The mount speaks two command families over one 9600-8-N-1 serial line:
//! the LX200 ASCII dialect (`:GR#`, `:Mw#`, ...) and vendor extensions
//! whose replies end with the `!\n` sentinel (`!IN#`, `!S+05-02#`, ...).
//! [`link::MountLink`] owns the port and the command/response discipline;
//! [`bridge::MountBridge`] multiplexes the line with Bluetooth and TCP
//! side channels and keeps telemetry fresh.

pub mod bridge;
pub mod command;
pub mod link;
pub mod tcp_serial;

#[cfg(feature = "bluetooth")]
pub mod bt_serial;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use bridge::{MountBridge, SidePort};
pub use command::{Command, ResponseKind};
pub use link::MountLink;
pub use tcp_serial::TcpSerialServer;

/// Errors from the mount link.
///
/// `Io` is transient (a reopen/rebind is attempted before it is surfaced);
/// `ConnectionFailed` means recovery is exhausted and the link is down.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("serial io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("mount connection failed: {0}")]
    ConnectionFailed(String),
    #[error("timeout waiting for mount reply")]
    Timeout,
    #[error("malformed mount reply: {0}")]
    Parse(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("slew refused by mount: {0}")]
    SlewRefused(String),
}

pub type MountResult<T> = Result<T, MountError>;

/// Cardinal slew direction as used by `:M<dir>#` / `:Q<dir>#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    North,
    South,
    East,
    West,
}

impl Direction {
    pub fn as_char(self) -> char {
        match self {
            Direction::North => 'n',
            Direction::South => 's',
            Direction::East => 'e',
            Direction::West => 'w',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'n' => Some(Direction::North),
            's' => Some(Direction::South),
            'e' => Some(Direction::East),
            'w' => Some(Direction::West),
            _ => None,
        }
    }
}

/// LX200 slew rate selector for `:R<rate>#`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlewRate {
    /// `G` - slowest, used while guiding and calibrating.
    Guide,
    /// `C` - centering.
    Center,
    /// `M` - find.
    Move,
    /// `S` - fastest.
    Slew,
}

impl SlewRate {
    pub fn as_char(self) -> char {
        match self {
            SlewRate::Guide => 'G',
            SlewRate::Center => 'C',
            SlewRate::Move => 'M',
            SlewRate::Slew => 'S',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'G' => Some(SlewRate::Guide),
            'C' => Some(SlewRate::Center),
            'M' => Some(SlewRate::Move),
            'S' => Some(SlewRate::Slew),
            _ => None,
        }
    }
}

/// Which side of the pier the tube is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pier {
    East,
    West,
}

impl Pier {
    pub fn as_char(self) -> char {
        match self {
            Pier::East => 'E',
            Pier::West => 'W',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'E' => Some(Pier::East),
            'W' => Some(Pier::West),
            _ => None,
        }
    }
}

/// Mount-side intervalometer state reported by `!IN#`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraTimerState {
    pub active: bool,
    pub exposure_s: u32,
    pub shots: u32,
}

/// PEC state reported by `!IN#`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PecState {
    /// Worm position index, 0..=99.
    pub progress: u8,
}

/// Telemetry snapshot of the mount, refreshed by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeInfo {
    pub software: String,
    pub free_memory: u32,
    pub uptime_s: u64,
    pub looptime_us: u32,
    pub tracktime_s: u64,
    /// RA as an LX200 `HH:MM:SS` string.
    pub ra: String,
    /// DEC as an LX200 `±DD*MM:SS` string.
    pub dec: String,
    pub pier: Option<Pier>,
    pub pec: PecState,
    pub backlash_ra: u16,
    pub backlash_dec: u16,
    pub camera: CameraTimerState,
    pub tracking: bool,
}

impl ScopeInfo {
    /// Declination in degrees from the cached `dec` string, 0.0 when the
    /// cache is empty or unparseable.
    pub fn dec_deg(&self) -> f64 {
        shared::conversions::lx200_dec_to_deg(&self.dec).unwrap_or(0.0)
    }
}
