//! Hardware drivers for the PipiTrek autoguider.
//!
//! Two device families live here: the telescope mount behind a single
//! serial port (LX200-compatible plus vendor-extended commands, multiplexed
//! to Bluetooth and TCP side channels by a background bridge), and the
//! guide camera behind V4L2 (background capture loop producing integrated,
//! hot-pixel-corrected frames).

pub mod camera;
pub mod mount;
