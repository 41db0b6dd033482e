//! Dark-frame averaging and hot-pixel detection.
//!
//! A pixel qualifies as hot when its dark-frame average exceeds the frame
//! median by the given threshold AND it is the maximum of its 3×3
//! neighborhood, which rejects blobs of warm pixels in favor of their
//! peaks.

use std::path::Path;

use image::GrayImage;
use ndarray::Array2;

use super::{CameraError, CameraResult};

/// Pixel-wise mean of equally sized grayscale frames. `None` when the
/// input is empty or sizes disagree.
pub fn average_frames(frames: &[Array2<u8>]) -> Option<Array2<f32>> {
    let first = frames.first()?;
    let dim = first.dim();
    if frames.iter().any(|f| f.dim() != dim) {
        return None;
    }
    let mut sum = Array2::<f32>::zeros(dim);
    for frame in frames {
        sum.zip_mut_with(frame, |s, &p| *s += p as f32);
    }
    sum.mapv_inplace(|v| v / frames.len() as f32);
    Some(sum)
}

/// Detect hot pixels in an averaged dark frame.
///
/// Returns `(y, x)` coordinates whose value exceeds `median + threshold`
/// and is the maximum of the (edge-clipped) 3×3 neighborhood.
pub fn detect_hot_pixels(avg: &Array2<f32>, threshold: f64) -> Vec<(u32, u32)> {
    let (height, width) = avg.dim();
    if height == 0 || width == 0 {
        return Vec::new();
    }

    let mut sorted: Vec<f32> = avg.iter().copied().collect();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
    let median = sorted[sorted.len() / 2];
    let cutoff = median + threshold as f32;

    let mut hot = Vec::new();
    for ((y, x), &value) in avg.indexed_iter() {
        if value <= cutoff {
            continue;
        }
        let y1 = y.saturating_sub(1);
        let y2 = (y + 2).min(height);
        let x1 = x.saturating_sub(1);
        let x2 = (x + 2).min(width);

        let mut max = f32::MIN;
        for ny in y1..y2 {
            for nx in x1..x2 {
                if avg[[ny, nx]] > max {
                    max = avg[[ny, nx]];
                }
            }
        }
        if value == max {
            hot.push((y as u32, x as u32));
        }
    }
    hot
}

/// Persist the averaged dark frame as an 8-bit PNG.
pub fn save_dark_frame(avg: &Array2<f32>, path: &Path) -> CameraResult<()> {
    let (height, width) = avg.dim();
    let pixels: Vec<u8> = avg.iter().map(|&v| v.clamp(0.0, 255.0) as u8).collect();
    let image = GrayImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| CameraError::Decode("dark frame buffer mismatch".to_string()))?;
    image
        .save(path)
        .map_err(|e| CameraError::Decode(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn average_of_two_frames() {
        let frames = vec![arr2(&[[10u8, 20]]), arr2(&[[30u8, 40]])];
        let avg = average_frames(&frames).unwrap();
        assert_eq!(avg, arr2(&[[20.0f32, 30.0]]));
    }

    #[test]
    fn average_rejects_mismatched_sizes() {
        let frames = vec![arr2(&[[10u8, 20]]), arr2(&[[30u8]])];
        assert!(average_frames(&frames).is_none());
        assert!(average_frames(&[]).is_none());
    }

    #[test]
    fn hot_pixel_must_exceed_median_plus_threshold() {
        let mut avg = Array2::<f32>::from_elem((5, 5), 10.0);
        avg[[2, 2]] = 24.0;
        // Threshold 15 puts the cutoff at 25, just above the pixel.
        assert!(detect_hot_pixels(&avg, 15.0).is_empty());
        // Threshold 10 admits it.
        assert_eq!(detect_hot_pixels(&avg, 10.0), vec![(2, 2)]);
    }

    #[test]
    fn only_local_maxima_are_hot() {
        let mut avg = Array2::<f32>::from_elem((5, 5), 10.0);
        // A warm blob: center is the peak, its neighbor is bright but not
        // a local max.
        avg[[2, 2]] = 100.0;
        avg[[2, 3]] = 90.0;
        assert_eq!(detect_hot_pixels(&avg, 15.0), vec![(2, 2)]);
    }

    #[test]
    fn hot_pixel_on_edge_is_detected() {
        let mut avg = Array2::<f32>::from_elem((4, 4), 5.0);
        avg[[0, 0]] = 200.0;
        assert_eq!(detect_hot_pixels(&avg, 15.0), vec![(0, 0)]);
    }

    #[test]
    fn dark_frame_png_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dark_frame_avg.png");
        let avg = arr2(&[[0.0f32, 127.6], [255.0, 300.0]]);
        save_dark_frame(&avg, &path).unwrap();

        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.width(), 2);
        assert_eq!(loaded.get_pixel(0, 0).0[0], 0);
        assert_eq!(loaded.get_pixel(1, 1).0[0], 255);
    }
}
