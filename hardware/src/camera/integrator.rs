//! Frame integration and hot-pixel correction.
//!
//! N raw frames are summed pixel-wise into a 16-bit accumulator, divided
//! by the count actually accumulated (capture failures may leave it short
//! of N), scaled by the per-channel gains, clipped to 8 bits, and finally
//! hot-pixel corrected.

use ndarray::{Array2, Array3};
use shared::hot_pixel_map::HotPixelMap;

use super::v4l2::DecodedFrame;
use super::{CameraError, CameraResult};

enum AccumBuf {
    Gray(Array2<u16>),
    Color(Array3<u16>),
}

/// Pixel-wise frame accumulator.
///
/// Geometry and color mode are fixed at allocation; [`reset`] reuses the
/// buffer for the next integration round.
///
/// [`reset`]: FrameAccumulator::reset
pub struct FrameAccumulator {
    buf: AccumBuf,
    count: u32,
}

impl FrameAccumulator {
    pub fn new(width: usize, height: usize, color: bool) -> Self {
        let buf = if color {
            AccumBuf::Color(Array3::zeros((height, width, 3)))
        } else {
            AccumBuf::Gray(Array2::zeros((height, width)))
        };
        Self { buf, count: 0 }
    }

    pub fn reset(&mut self) {
        match &mut self.buf {
            AccumBuf::Gray(a) => a.fill(0),
            AccumBuf::Color(a) => a.fill(0),
        }
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Add one decoded frame. The frame must match the accumulator's
    /// geometry and color mode.
    pub fn add(&mut self, frame: &DecodedFrame) -> CameraResult<()> {
        match (&mut self.buf, frame) {
            (AccumBuf::Gray(acc), DecodedFrame::Gray(f)) => {
                if acc.dim() != f.dim() {
                    return Err(CameraError::InvalidConfig(format!(
                        "frame {:?} does not match accumulator {:?}",
                        f.dim(),
                        acc.dim()
                    )));
                }
                acc.zip_mut_with(f, |a, &p| *a += p as u16);
            }
            (AccumBuf::Color(acc), DecodedFrame::Color(f)) => {
                if acc.dim() != f.dim() {
                    return Err(CameraError::InvalidConfig(format!(
                        "frame {:?} does not match accumulator {:?}",
                        f.dim(),
                        acc.dim()
                    )));
                }
                acc.zip_mut_with(f, |a, &p| *a += p as u16);
            }
            _ => {
                return Err(CameraError::InvalidConfig(
                    "frame color mode does not match accumulator".to_string(),
                ))
            }
        }
        self.count += 1;
        Ok(())
    }

    /// Divide by the accumulated count, apply channel gains, clip to u8
    /// and run the hot-pixel correction. Returns `None` when nothing was
    /// accumulated.
    pub fn finalize(
        &self,
        gains: (f64, f64, f64),
        hot_pixels: Option<&HotPixelMap>,
    ) -> Option<DecodedFrame> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as u16;
        let mut result = match &self.buf {
            AccumBuf::Gray(acc) => DecodedFrame::Gray(acc.mapv(|v| (v / n).min(255) as u8)),
            AccumBuf::Color(acc) => {
                // BGR channel order: gains arrive as (r, g, b).
                let (r, g, b) = gains;
                let gain = [b, g, r];
                let mut out = Array3::<u8>::zeros(acc.dim());
                for ((y, x, c), &v) in acc.indexed_iter() {
                    let scaled = (v / n) as f64 * gain[c];
                    out[[y, x, c]] = scaled.clamp(0.0, 255.0) as u8;
                }
                DecodedFrame::Color(out)
            }
        };
        if let Some(map) = hot_pixels {
            apply_hot_pixel_mask(&mut result, map);
        }
        Some(result)
    }
}

/// Correct the listed hot pixels in place.
///
/// For each listed `(y, x)` and each channel: subtract `central_value ×
/// kernel` from the 3×3 neighborhood (edge-clipped), clip to [0, 255], and
/// replace the center with the median of the corrected neighborhood.
pub fn apply_hot_pixel_mask(frame: &mut DecodedFrame, map: &HotPixelMap) {
    if map.is_empty() {
        return;
    }
    match frame {
        DecodedFrame::Gray(a) => {
            let (height, width) = a.dim();
            for &(y, x) in &map.pixels {
                correct_one(a, map, y as usize, x as usize, height, width);
            }
        }
        DecodedFrame::Color(a) => {
            let (height, width, channels) = a.dim();
            for c in 0..channels {
                let mut plane = a.index_axis_mut(ndarray::Axis(2), c);
                for &(y, x) in &map.pixels {
                    correct_one_view(&mut plane, map, y as usize, x as usize, height, width);
                }
            }
        }
    }
}

fn correct_one(
    plane: &mut Array2<u8>,
    map: &HotPixelMap,
    y: usize,
    x: usize,
    height: usize,
    width: usize,
) {
    let mut view = plane.view_mut();
    correct_one_view(&mut view, map, y, x, height, width);
}

fn correct_one_view(
    plane: &mut ndarray::ArrayViewMut2<u8>,
    map: &HotPixelMap,
    y: usize,
    x: usize,
    height: usize,
    width: usize,
) {
    if y >= height || x >= width {
        return;
    }
    let y1 = y.saturating_sub(1);
    let y2 = (y + 2).min(height);
    let x1 = x.saturating_sub(1);
    let x2 = (x + 2).min(width);

    let central = plane[[y, x]] as f32;

    let mut corrected: Vec<u8> = Vec::with_capacity(9);
    for ny in y1..y2 {
        for nx in x1..x2 {
            // Kernel cell for this neighbor relative to the center.
            let ky = ny + 1 - y;
            let kx = nx + 1 - x;
            let weight = map.kernel[ky][kx];
            let value = (plane[[ny, nx]] as f32 - central * weight).clamp(0.0, 255.0) as u8;
            plane[[ny, nx]] = value;
            corrected.push(value);
        }
    }

    corrected.sort_unstable();
    let median = corrected[corrected.len() / 2];
    plane[[y, x]] = median;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    fn gray(frame: &DecodedFrame) -> &Array2<u8> {
        match frame {
            DecodedFrame::Gray(a) => a,
            _ => panic!("expected gray"),
        }
    }

    #[test]
    fn integration_divides_by_actual_count() {
        let mut acc = FrameAccumulator::new(2, 2, false);
        acc.add(&DecodedFrame::Gray(arr2(&[[10u8, 20], [30, 40]])))
            .unwrap();
        acc.add(&DecodedFrame::Gray(arr2(&[[30u8, 40], [50, 60]])))
            .unwrap();
        // A third frame was requested but never captured.
        let out = acc.finalize((1.0, 1.0, 1.0), None).unwrap();
        assert_eq!(gray(&out), arr2(&[[20u8, 30], [40, 50]]));
    }

    #[test]
    fn empty_accumulator_finalizes_to_none() {
        let acc = FrameAccumulator::new(2, 2, false);
        assert!(acc.finalize((1.0, 1.0, 1.0), None).is_none());
    }

    #[test]
    fn sum_of_saturated_frames_stays_in_range() {
        let mut acc = FrameAccumulator::new(1, 1, false);
        for _ in 0..4 {
            acc.add(&DecodedFrame::Gray(arr2(&[[255u8]]))).unwrap();
        }
        let out = acc.finalize((1.0, 1.0, 1.0), None).unwrap();
        assert_eq!(gray(&out)[[0, 0]], 255);
    }

    #[test]
    fn channel_gains_scale_and_clip() {
        let mut acc = FrameAccumulator::new(1, 1, true);
        let mut frame = Array3::<u8>::zeros((1, 1, 3));
        frame[[0, 0, 0]] = 100; // B
        frame[[0, 0, 1]] = 100; // G
        frame[[0, 0, 2]] = 100; // R
        acc.add(&DecodedFrame::Color(frame)).unwrap();

        let out = acc.finalize((0.5, 1.0, 3.0), None).unwrap();
        match out {
            DecodedFrame::Color(a) => {
                assert_eq!(a[[0, 0, 0]], 255); // b gain 3.0 clipped
                assert_eq!(a[[0, 0, 1]], 100);
                assert_eq!(a[[0, 0, 2]], 50); // r gain 0.5
            }
            _ => panic!("expected color"),
        }
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        let mut acc = FrameAccumulator::new(2, 2, false);
        let err = acc.add(&DecodedFrame::Gray(Array2::zeros((3, 3))));
        assert!(err.is_err());
        let err = acc.add(&DecodedFrame::Color(Array3::zeros((2, 2, 3))));
        assert!(err.is_err());
    }

    #[test]
    fn hot_pixel_is_replaced_by_neighborhood_median() {
        let mut frame = DecodedFrame::Gray(arr2(&[
            [10u8, 10, 10],
            [10, 250, 10],
            [10, 10, 10],
        ]));
        let map = HotPixelMap::new(vec![(1, 1)]);
        apply_hot_pixel_mask(&mut frame, &map);
        let a = gray(&frame);
        // Center must no longer be the hot value.
        assert!(a[[1, 1]] < 250);
        // Neighbors got the weighted bleed subtracted (250*0.15 = 37.5 > 10,
        // so corner neighbors clip to zero).
        assert_eq!(a[[0, 0]], 0);
    }

    #[test]
    fn correction_preserves_pixels_outside_neighborhood() {
        let mut data = Array2::<u8>::from_elem((7, 7), 50);
        data[[3, 3]] = 255;
        let before = data.clone();
        let mut frame = DecodedFrame::Gray(data);
        apply_hot_pixel_mask(&mut frame, &HotPixelMap::new(vec![(3, 3)]));
        let a = gray(&frame);
        for ((y, x), &v) in before.indexed_iter() {
            let in_neighborhood =
                (y as i32 - 3).abs() <= 1 && (x as i32 - 3).abs() <= 1;
            if !in_neighborhood {
                assert_eq!(a[[y, x]], v, "pixel ({y},{x}) changed");
            }
        }
    }

    #[test]
    fn hot_pixel_at_image_edge_clips_neighborhood() {
        let mut frame = DecodedFrame::Gray(arr2(&[[250u8, 10], [10, 10]]));
        let map = HotPixelMap::new(vec![(0, 0)]);
        apply_hot_pixel_mask(&mut frame, &map);
        // Must not panic, and the corner gets the median of its 2x2 patch.
        assert!(gray(&frame)[[0, 0]] < 250);
    }
}
