//! V4L2 device access and raw-payload decoding.
//!
//! The device is opened and configured here (pixel format, geometry, frame
//! rate, driver controls by name); the raw buffers it produces are decoded
//! into grayscale or BGR `ndarray` planes depending on the configured
//! color mode.

use ndarray::{Array2, Array3};
use tracing::{debug, info, warn};
use v4l::buffer::Type;
use v4l::control::Value as ControlValue;
use v4l::io::mmap::Stream as MmapStream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{CameraError, CameraResult};

/// Camera pixel formats the capture loop understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelMode {
    Mjpg,
    Yuyv,
    Grey,
}

impl PixelMode {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelMode::Mjpg => FourCC::new(b"MJPG"),
            PixelMode::Yuyv => FourCC::new(b"YUYV"),
            PixelMode::Grey => FourCC::new(b"GREY"),
        }
    }

    pub fn from_name(name: &str) -> CameraResult<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MJPG" => Ok(PixelMode::Mjpg),
            "YUYV" => Ok(PixelMode::Yuyv),
            "GREY" => Ok(PixelMode::Grey),
            other => Err(CameraError::InvalidConfig(format!(
                "unsupported pixel mode {other}"
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PixelMode::Mjpg => "MJPG",
            PixelMode::Yuyv => "YUYV",
            PixelMode::Grey => "GREY",
        }
    }
}

/// Capture configuration applied to the device.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub device_path: String,
    pub mode: PixelMode,
    pub width: u32,
    pub height: u32,
    /// 0 leaves the driver's default rate in place.
    pub fps: f64,
    pub color: bool,
    /// Driver controls applied by name at open (gain, exposure, ...).
    pub controls: Vec<(String, i64)>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_path: "/dev/video0".to_string(),
            mode: PixelMode::Mjpg,
            width: 1280,
            height: 720,
            fps: 5.0,
            color: true,
            controls: Vec::new(),
        }
    }
}

/// Open and configure the device; returns the device and the geometry the
/// driver actually granted.
pub fn open_device(config: &CameraConfig) -> CameraResult<(Device, u32, u32)> {
    let device = Device::with_path(&config.device_path)?;

    let mut format = device.format()?;
    format.width = config.width;
    format.height = config.height;
    format.fourcc = config.mode.fourcc();
    let granted = device.set_format(&format)?;
    if granted.fourcc != config.mode.fourcc() {
        return Err(CameraError::InvalidConfig(format!(
            "driver refused pixel mode {}, offered {}",
            config.mode.name(),
            granted.fourcc
        )));
    }
    info!(
        "camera format {} {}x{} (requested {}x{})",
        granted.fourcc, granted.width, granted.height, config.width, config.height
    );

    if config.fps > 0.0 {
        let mut params = device.params()?;
        params.interval = v4l::Fraction::new(1, config.fps.round() as u32);
        let actual = device.set_params(&params)?;
        info!("camera frame interval {:?}", actual.interval);
    }

    // Manual exposure and white balance keep star photometry stable.
    apply_control_by_name(&device, "auto_exposure", 1).ok();
    apply_control_by_name(&device, "white_balance_automatic", 0).ok();
    for (name, value) in &config.controls {
        if let Err(e) = apply_control_by_name(&device, name, *value) {
            warn!("failed to set control {name}={value}: {e}");
        }
    }

    Ok((device, granted.width, granted.height))
}

/// Set a driver control by its descriptor name (case-insensitive,
/// spaces/underscores interchangeable).
pub fn apply_control_by_name(device: &Device, name: &str, value: i64) -> CameraResult<()> {
    let wanted = name.to_ascii_lowercase().replace(' ', "_");
    let controls = device.query_controls()?;
    for desc in controls {
        let desc_name = desc.name.to_ascii_lowercase().replace(' ', "_");
        if desc_name == wanted {
            device.set_control(v4l::Control {
                id: desc.id,
                value: ControlValue::Integer(value),
            })?;
            debug!("set camera control {name} = {value}");
            return Ok(());
        }
    }
    Err(CameraError::InvalidConfig(format!(
        "no such camera control: {name}"
    )))
}

/// Read one raw buffer and decode it per the configured mode.
pub fn read_decoded(
    stream: &mut MmapStream,
    mode: PixelMode,
    width: u32,
    height: u32,
    color: bool,
) -> CameraResult<DecodedFrame> {
    let (buf, _meta) = stream.next().map_err(|_| CameraError::ReadFailed)?;
    decode_frame(buf, mode, width as usize, height as usize, color)
}

/// One decoded raw frame, before integration.
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Gray(Array2<u8>),
    Color(Array3<u8>),
}

/// Decode a raw V4L2 payload into pixel planes (BGR when color).
pub fn decode_frame(
    payload: &[u8],
    mode: PixelMode,
    width: usize,
    height: usize,
    color: bool,
) -> CameraResult<DecodedFrame> {
    match mode {
        PixelMode::Mjpg => decode_mjpg(payload, color),
        PixelMode::Yuyv => decode_yuyv(payload, width, height, color),
        PixelMode::Grey => decode_grey(payload, width, height),
    }
}

fn decode_mjpg(payload: &[u8], color: bool) -> CameraResult<DecodedFrame> {
    let image = image::load_from_memory_with_format(payload, image::ImageFormat::Jpeg)
        .map_err(|e| CameraError::Decode(e.to_string()))?;
    if color {
        let rgb = image.to_rgb8();
        let (w, h) = (rgb.width() as usize, rgb.height() as usize);
        let mut bgr = Array3::<u8>::zeros((h, w, 3));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            bgr[[y, x, 0]] = pixel[2];
            bgr[[y, x, 1]] = pixel[1];
            bgr[[y, x, 2]] = pixel[0];
        }
        Ok(DecodedFrame::Color(bgr))
    } else {
        let gray = image.to_luma8();
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let data = Array2::from_shape_vec((h, w), gray.into_raw())
            .map_err(|e| CameraError::Decode(e.to_string()))?;
        Ok(DecodedFrame::Gray(data))
    }
}

fn decode_yuyv(
    payload: &[u8],
    width: usize,
    height: usize,
    color: bool,
) -> CameraResult<DecodedFrame> {
    if payload.len() < width * height * 2 {
        return Err(CameraError::Decode(format!(
            "YUYV payload {} bytes, expected {}",
            payload.len(),
            width * height * 2
        )));
    }
    if !color {
        // Luma bytes are every other byte.
        let mut data = Array2::<u8>::zeros((height, width));
        for y in 0..height {
            for x in 0..width {
                data[[y, x]] = payload[(y * width + x) * 2];
            }
        }
        return Ok(DecodedFrame::Gray(data));
    }

    let mut bgr = Array3::<u8>::zeros((height, width, 3));
    for y in 0..height {
        for pair in 0..width / 2 {
            let base = (y * width + pair * 2) * 2;
            let y0 = payload[base] as f32;
            let u = payload[base + 1] as f32 - 128.0;
            let y1 = payload[base + 2] as f32;
            let v = payload[base + 3] as f32 - 128.0;
            for (i, luma) in [(0usize, y0), (1usize, y1)] {
                let x = pair * 2 + i;
                let r = luma + 1.402 * v;
                let g = luma - 0.344 * u - 0.714 * v;
                let b = luma + 1.772 * u;
                bgr[[y, x, 0]] = b.clamp(0.0, 255.0) as u8;
                bgr[[y, x, 1]] = g.clamp(0.0, 255.0) as u8;
                bgr[[y, x, 2]] = r.clamp(0.0, 255.0) as u8;
            }
        }
    }
    Ok(DecodedFrame::Color(bgr))
}

fn decode_grey(payload: &[u8], width: usize, height: usize) -> CameraResult<DecodedFrame> {
    if payload.len() < width * height {
        return Err(CameraError::Decode(format!(
            "GREY payload {} bytes, expected {}",
            payload.len(),
            width * height
        )));
    }
    let data = Array2::from_shape_vec((height, width), payload[..width * height].to_vec())
        .map_err(|e| CameraError::Decode(e.to_string()))?;
    Ok(DecodedFrame::Gray(data))
}

/// Open a fresh MJPG->gray capture session for dark-frame acquisition.
pub fn mmap_stream(device: &Device) -> CameraResult<MmapStream<'_>> {
    MmapStream::new(device, Type::VideoCapture).map_err(CameraError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_mode_from_name() {
        assert_eq!(PixelMode::from_name("mjpg").unwrap(), PixelMode::Mjpg);
        assert_eq!(PixelMode::from_name("YUYV").unwrap(), PixelMode::Yuyv);
        assert!(PixelMode::from_name("NV12").is_err());
    }

    #[test]
    fn yuyv_gray_extracts_luma() {
        // 2x1 frame: Y0=10 U=128 Y1=200 V=128
        let payload = [10u8, 128, 200, 128];
        let decoded = decode_yuyv(&payload, 2, 1, false).unwrap();
        match decoded {
            DecodedFrame::Gray(a) => {
                assert_eq!(a[[0, 0]], 10);
                assert_eq!(a[[0, 1]], 200);
            }
            _ => panic!("expected gray"),
        }
    }

    #[test]
    fn yuyv_color_neutral_chroma_is_gray() {
        let payload = [100u8, 128, 100, 128];
        let decoded = decode_yuyv(&payload, 2, 1, true).unwrap();
        match decoded {
            DecodedFrame::Color(a) => {
                for c in 0..3 {
                    assert_eq!(a[[0, 0, c]], 100);
                }
            }
            _ => panic!("expected color"),
        }
    }

    #[test]
    fn short_payload_is_a_decode_error() {
        assert!(decode_yuyv(&[0u8; 4], 4, 4, false).is_err());
        assert!(decode_grey(&[0u8; 4], 4, 4).is_err());
    }

    #[test]
    fn grey_payload_maps_directly() {
        let decoded = decode_grey(&[1, 2, 3, 4], 2, 2).unwrap();
        match decoded {
            DecodedFrame::Gray(a) => {
                assert_eq!(a[[0, 0]], 1);
                assert_eq!(a[[1, 1]], 4);
            }
            _ => panic!("expected gray"),
        }
    }
}
