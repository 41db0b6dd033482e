//! Integrated camera frames as published to the rest of the system.
//!
//! A frame is produced once by the capture loop and never mutated
//! afterwards; consumers hold it through `Arc<Frame>` so a newly published
//! frame atomically replaces the previous one without copying.

use ndarray::{Array2, Array3};

/// Pixel data of one integrated frame.
///
/// Color frames use BGR channel order (the order the original capture
/// pipeline produced, and what the preview encoders expect).
#[derive(Debug, Clone)]
pub enum FrameData {
    Gray(Array2<u8>),
    Color(Array3<u8>),
}

/// One published frame plus its sequence number.
///
/// `seq` increases by one per published frame; the guide loop uses it to
/// tell whether a new frame arrived since the last iteration.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: FrameData,
    pub seq: u64,
}

impl Frame {
    pub fn new_gray(data: Array2<u8>, seq: u64) -> Self {
        Self {
            data: FrameData::Gray(data),
            seq,
        }
    }

    pub fn new_color(data: Array3<u8>, seq: u64) -> Self {
        Self {
            data: FrameData::Color(data),
            seq,
        }
    }

    pub fn width(&self) -> usize {
        match &self.data {
            FrameData::Gray(a) => a.ncols(),
            FrameData::Color(a) => a.dim().1,
        }
    }

    pub fn height(&self) -> usize {
        match &self.data {
            FrameData::Gray(a) => a.nrows(),
            FrameData::Color(a) => a.dim().0,
        }
    }

    pub fn channels(&self) -> usize {
        match &self.data {
            FrameData::Gray(_) => 1,
            FrameData::Color(a) => a.dim().2,
        }
    }

    /// Grayscale view of the frame, converting BGR with BT.601 luma weights
    /// when necessary.
    pub fn to_gray(&self) -> Array2<u8> {
        match &self.data {
            FrameData::Gray(a) => a.clone(),
            FrameData::Color(a) => {
                let (rows, cols, _) = a.dim();
                Array2::from_shape_fn((rows, cols), |(y, x)| {
                    let b = a[[y, x, 0]] as f32;
                    let g = a[[y, x, 1]] as f32;
                    let r = a[[y, x, 2]] as f32;
                    (0.114 * b + 0.587 * g + 0.299 * r).round().min(255.0) as u8
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn gray_frame_dimensions() {
        let frame = Frame::new_gray(Array2::zeros((480, 640)), 1);
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.channels(), 1);
    }

    #[test]
    fn color_frame_dimensions() {
        let frame = Frame::new_color(Array3::zeros((480, 640, 3)), 7);
        assert_eq!(frame.width(), 640);
        assert_eq!(frame.height(), 480);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.seq, 7);
    }

    #[test]
    fn to_gray_passes_through_gray() {
        let pixels = arr2(&[[0u8, 128], [255, 10]]);
        let frame = Frame::new_gray(pixels.clone(), 0);
        assert_eq!(frame.to_gray(), pixels);
    }

    #[test]
    fn to_gray_converts_bgr_with_luma_weights() {
        // Pure white converts to 255, pure black to 0.
        let mut data = Array3::<u8>::zeros((1, 2, 3));
        for c in 0..3 {
            data[[0, 1, c]] = 255;
        }
        let frame = Frame::new_color(data, 0);
        let gray = frame.to_gray();
        assert_eq!(gray[[0, 0]], 0);
        assert_eq!(gray[[0, 1]], 255);
    }
}
