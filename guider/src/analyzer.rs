//! Star detection and sub-pixel centroiding.
//!
//! The frame is binarized at the gray threshold and segmented into
//! 8-connected components. A component is selected per search hint (or
//! the largest one when there is no hint), its raw moments give an initial
//! centroid and an adaptive crop size, and an intensity-weighted centroid
//! of the background-subtracted crop delivers sub-pixel coordinates in
//! full-frame space.

use ndarray::{Array2, Array3};

/// Analyzer inputs sampled from the guide configuration.
#[derive(Debug, Clone, Copy)]
pub struct AnalyzerParams {
    /// Binarization cutoff; pixels strictly above it are foreground.
    pub gray_threshold: u8,
    /// Minimum component area (strict) for a valid star.
    pub star_size: f64,
    /// Maximum hint-to-component distance for re-association.
    pub max_distance: f64,
}

/// Result of one analyzer run.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// One slot per hint (a single slot when no hints were given); `None`
    /// when that star was not found.
    pub centroids: Vec<Option<(f64, f64)>>,
    /// Gamma-stretched BGR crop of the first found star with its column
    /// profile overlay.
    pub preview: Option<Array3<u8>>,
    /// The binarized frame.
    pub threshold: Array2<u8>,
    /// Standard deviation of the background-subtracted crop.
    pub focus_metric: f64,
}

struct Component {
    area: f64,
    mean_x: f64,
    mean_y: f64,
    /// Raw moments over member pixels.
    m00: f64,
    m10: f64,
    m01: f64,
    /// Central second moments.
    mu20: f64,
    mu02: f64,
}

/// Detect stars in `gray`, optionally near the given hints.
pub fn detect_stars(
    gray: &Array2<u8>,
    hints: Option<&[(f64, f64)]>,
    params: &AnalyzerParams,
) -> Analysis {
    let threshold = binarize(gray, params.gray_threshold);
    let components = find_components(&threshold);

    let mut centroids = Vec::new();
    let mut preview = None;
    let mut focus_metric = 0.0;

    let selections: Vec<Option<&Component>> = match hints {
        None => vec![select_largest(&components, params)],
        Some(hints) => hints
            .iter()
            .map(|hint| select_near(&components, *hint, params))
            .collect(),
    };

    for selection in selections {
        match selection {
            Some(component) => {
                let star = refine_centroid(gray, component);
                if preview.is_none() {
                    focus_metric = star.focus_metric;
                    preview = Some(star.preview);
                }
                centroids.push(Some(star.centroid));
            }
            None => centroids.push(None),
        }
    }

    Analysis {
        centroids,
        preview,
        threshold,
        focus_metric,
    }
}

/// Binarize at `threshold`: strictly greater pixels become 255.
pub fn binarize(gray: &Array2<u8>, threshold: u8) -> Array2<u8> {
    gray.mapv(|p| if p > threshold { 255 } else { 0 })
}

/// Label 8-connected foreground components and compute their moments.
fn find_components(binary: &Array2<u8>) -> Vec<Component> {
    let (rows, cols) = binary.dim();
    let mut labels = Array2::<u32>::zeros((rows, cols));
    let mut components = Vec::new();
    let mut next_label = 0u32;

    let neighbors = [
        (-1i64, -1i64),
        (-1, 0),
        (-1, 1),
        (0, -1),
        (0, 1),
        (1, -1),
        (1, 0),
        (1, 1),
    ];

    for sy in 0..rows {
        for sx in 0..cols {
            if binary[[sy, sx]] == 0 || labels[[sy, sx]] != 0 {
                continue;
            }
            next_label += 1;
            let mut stack = vec![(sy, sx)];
            let mut pixels: Vec<(usize, usize)> = Vec::new();

            while let Some((y, x)) = stack.pop() {
                if binary[[y, x]] == 0 || labels[[y, x]] != 0 {
                    continue;
                }
                labels[[y, x]] = next_label;
                pixels.push((y, x));

                for &(dy, dx) in &neighbors {
                    let ny = y as i64 + dy;
                    let nx = x as i64 + dx;
                    if ny >= 0 && ny < rows as i64 && nx >= 0 && nx < cols as i64 {
                        let (ny, nx) = (ny as usize, nx as usize);
                        if binary[[ny, nx]] != 0 && labels[[ny, nx]] == 0 {
                            stack.push((ny, nx));
                        }
                    }
                }
            }

            let m00 = pixels.len() as f64;
            let m10: f64 = pixels.iter().map(|&(_, x)| x as f64).sum();
            let m01: f64 = pixels.iter().map(|&(y, _)| y as f64).sum();
            let cx = m10 / m00;
            let cy = m01 / m00;
            let mu20: f64 = pixels.iter().map(|&(_, x)| (x as f64 - cx).powi(2)).sum();
            let mu02: f64 = pixels.iter().map(|&(y, _)| (y as f64 - cy).powi(2)).sum();

            components.push(Component {
                area: m00,
                mean_x: cx,
                mean_y: cy,
                m00,
                m10,
                m01,
                mu20,
                mu02,
            });
        }
    }
    components
}

/// Largest component, still subject to the minimum-area check.
fn select_largest<'a>(
    components: &'a [Component],
    params: &AnalyzerParams,
) -> Option<&'a Component> {
    components
        .iter()
        .max_by(|a, b| a.area.partial_cmp(&b.area).unwrap())
        .filter(|c| c.area > params.star_size)
}

/// Nearest sufficiently large component within `max_distance` of the hint.
fn select_near<'a>(
    components: &'a [Component],
    hint: (f64, f64),
    params: &AnalyzerParams,
) -> Option<&'a Component> {
    components
        .iter()
        .filter(|c| c.area > params.star_size)
        .map(|c| {
            let d = ((c.mean_x - hint.0).powi(2) + (c.mean_y - hint.1).powi(2)).sqrt();
            (c, d)
        })
        .filter(|&(_, d)| d < params.max_distance)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .map(|(c, _)| c)
}

struct RefinedStar {
    centroid: (f64, f64),
    focus_metric: f64,
    preview: Array3<u8>,
}

/// Crop around the initial centroid, subtract the local background and
/// compute the intensity-weighted centroid in full-frame coordinates.
fn refine_centroid(gray: &Array2<u8>, component: &Component) -> RefinedStar {
    let (rows, cols) = gray.dim();
    let cx = (component.m10 / component.m00).round() as i64;
    let cy = (component.m01 / component.m00).round() as i64;

    // Crop size from the larger of the area diameter and the per-axis
    // spreads, with a buffer factor of 3, clamped and rounded up to even.
    let area_diameter = component.m00.sqrt();
    let x_spread = (component.mu20 / component.m00).sqrt();
    let y_spread = (component.mu02 / component.m00).sqrt();
    let max_spread = area_diameter.max(x_spread).max(y_spread);
    let mut crop_size = ((max_spread * 3.0) as i64).clamp(20, 50);
    crop_size += crop_size % 2;
    let half = crop_size / 2;

    let x0 = (cx - half).max(0) as usize;
    let y0 = (cy - half).max(0) as usize;
    let x1 = ((cx + half) as usize).min(cols);
    let y1 = ((cy + half) as usize).min(rows);

    let crop = gray.slice(ndarray::s![y0..y1, x0..x1]);

    // Median background of the crop.
    let mut values: Vec<u8> = crop.iter().copied().collect();
    values.sort_unstable();
    let background = values[values.len() / 2];

    let subtracted = crop.mapv(|p| p.saturating_sub(background));

    // Intensity-weighted moments of the background-subtracted crop.
    let mut w00 = 0.0f64;
    let mut w10 = 0.0f64;
    let mut w01 = 0.0f64;
    for ((y, x), &v) in subtracted.indexed_iter() {
        let v = v as f64;
        w00 += v;
        w10 += v * x as f64;
        w01 += v * y as f64;
    }

    let centroid = if w00 == 0.0 {
        // Weighted mass vanished with the background; fall back to the
        // unweighted centroid.
        (cx as f64, cy as f64)
    } else {
        (
            round4(w10 / w00 + x0 as f64),
            round4(w01 / w00 + y0 as f64),
        )
    };

    let focus_metric = std_dev(&subtracted);
    let preview = render_preview(&subtracted);

    RefinedStar {
        centroid,
        focus_metric,
        preview,
    }
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

fn std_dev(crop: &Array2<u8>) -> f64 {
    let n = crop.len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = crop.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = crop.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

const PREVIEW_GAMMA: f64 = 3.5;

/// Gamma-stretch the crop, convert to BGR and overlay the yellow
/// column-mean profile normalized to the crop height.
fn render_preview(crop: &Array2<u8>) -> Array3<u8> {
    let (h, w) = crop.dim();
    let mut preview = Array3::<u8>::zeros((h, w, 3));
    if h == 0 || w == 0 {
        return preview;
    }

    let mut lut = [0u8; 256];
    let inv_gamma = 1.0 / PREVIEW_GAMMA;
    for (i, entry) in lut.iter_mut().enumerate() {
        *entry = ((i as f64 / 255.0).powf(inv_gamma) * 255.0) as u8;
    }

    for ((y, x), &v) in crop.indexed_iter() {
        let stretched = lut[v as usize];
        for c in 0..3 {
            preview[[y, x, c]] = stretched;
        }
    }

    // Column means, normalized to the crop height.
    let mut profile = vec![0.0f64; w];
    for (x, entry) in profile.iter_mut().enumerate() {
        let column = crop.column(x);
        *entry = column.iter().map(|&v| v as f64).sum::<f64>() / h as f64;
    }
    let max = profile.iter().cloned().fold(f64::MIN, f64::max);
    let min = profile.iter().cloned().fold(f64::MAX, f64::min);
    let normalized: Vec<f64> = if max > min {
        profile
            .iter()
            .map(|&p| (p - min) / (max - min) * (h - 1) as f64)
            .collect()
    } else {
        vec![0.0; w]
    };

    // Yellow polyline, BGR order, y inverted so zero sits at the bottom.
    for x in 0..w.saturating_sub(1) {
        let y1 = (h - 1) as i64 - normalized[x] as i64;
        let y2 = (h - 1) as i64 - normalized[x + 1] as i64;
        draw_segment(&mut preview, x as i64, y1, x as i64 + 1, y2);
    }

    preview
}

/// Draw a yellow line segment by stepping the longer axis.
fn draw_segment(image: &mut Array3<u8>, x0: i64, y0: i64, x1: i64, y1: i64) {
    let (h, w, _) = image.dim();
    let steps = (x1 - x0).abs().max((y1 - y0).abs()).max(1);
    for step in 0..=steps {
        let t = step as f64 / steps as f64;
        let x = (x0 as f64 + (x1 - x0) as f64 * t).round() as i64;
        let y = (y0 as f64 + (y1 - y0) as f64 * t).round() as i64;
        if x >= 0 && (x as usize) < w && y >= 0 && (y as usize) < h {
            image[[y as usize, x as usize, 0]] = 0;
            image[[y as usize, x as usize, 1]] = 255;
            image[[y as usize, x as usize, 2]] = 255;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gaussian star on a flat background.
    fn synthetic_star(
        width: usize,
        height: usize,
        x_center: f64,
        y_center: f64,
        sigma: f64,
        peak: f64,
    ) -> Array2<u8> {
        let mut frame = Array2::<f64>::zeros((height, width));
        for ((y, x), v) in frame.indexed_iter_mut() {
            let dx = x as f64 - x_center;
            let dy = y as f64 - y_center;
            *v = peak * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
        }
        frame.mapv(|v| v.round().clamp(0.0, 255.0) as u8)
    }

    fn params() -> AnalyzerParams {
        AnalyzerParams {
            gray_threshold: 128,
            star_size: 4.0,
            max_distance: 10.0,
        }
    }

    #[test]
    fn centroid_of_gaussian_star_is_subpixel_accurate() {
        let frame = synthetic_star(640, 480, 321.7, 240.3, 2.0, 200.0);
        let analysis = detect_stars(&frame, None, &params());
        let (cx, cy) = analysis.centroids[0].expect("star not found");
        assert!((cx - 321.7).abs() <= 0.2, "cx = {cx}");
        assert!((cy - 240.3).abs() <= 0.2, "cy = {cy}");
        assert!(analysis.focus_metric > 0.0);
        assert!(analysis.preview.is_some());
    }

    #[test]
    fn centroid_stays_within_half_crop_of_initial_guess() {
        let frame = synthetic_star(200, 200, 100.4, 99.6, 3.0, 220.0);
        let analysis = detect_stars(&frame, None, &params());
        let (cx, cy) = analysis.centroids[0].unwrap();
        // Crop sizes are at most 50, so the refined centroid can move at
        // most 25 px from the initial one.
        assert!((cx - 100.4).abs() <= 25.0);
        assert!((cy - 99.6).abs() <= 25.0);
    }

    #[test]
    fn hint_selects_nearest_star() {
        let mut frame = synthetic_star(300, 200, 80.0, 100.0, 2.0, 200.0);
        let second = synthetic_star(300, 200, 220.0, 100.0, 2.0, 180.0);
        frame.zip_mut_with(&second, |a, &b| *a = (*a).max(b));

        let hints = [(222.0, 101.0), (81.0, 99.0)];
        let analysis = detect_stars(&frame, Some(&hints), &params());
        assert_eq!(analysis.centroids.len(), 2);
        let (x0, _) = analysis.centroids[0].unwrap();
        let (x1, _) = analysis.centroids[1].unwrap();
        assert!((x0 - 220.0).abs() < 1.0);
        assert!((x1 - 80.0).abs() < 1.0);
    }

    #[test]
    fn hint_beyond_max_distance_yields_none() {
        let frame = synthetic_star(300, 200, 80.0, 100.0, 2.0, 200.0);
        let hints = [(150.0, 100.0)];
        let analysis = detect_stars(&frame, Some(&hints), &params());
        assert_eq!(analysis.centroids, vec![None]);
    }

    #[test]
    fn area_equal_to_star_size_is_not_found() {
        // A 2x2 plateau has component area exactly 4.
        let mut frame = Array2::<u8>::zeros((50, 50));
        for y in 20..22 {
            for x in 20..22 {
                frame[[y, x]] = 255;
            }
        }
        let p = AnalyzerParams {
            gray_threshold: 128,
            star_size: 4.0,
            max_distance: 10.0,
        };
        let analysis = detect_stars(&frame, None, &p);
        assert_eq!(analysis.centroids, vec![None]);

        // One unit smaller admits it.
        let p = AnalyzerParams {
            star_size: 3.0,
            ..p
        };
        let analysis = detect_stars(&frame, None, &p);
        assert!(analysis.centroids[0].is_some());
    }

    #[test]
    fn zero_threshold_binarizes_everything_above_zero() {
        let frame = Array2::<u8>::from_elem((30, 40), 1);
        let binary = binarize(&frame, 0);
        assert!(binary.iter().all(|&v| v == 255));

        // The whole image is one component and is returned as the largest.
        let p = AnalyzerParams {
            gray_threshold: 0,
            star_size: 4.0,
            max_distance: 10.0,
        };
        let analysis = detect_stars(&frame, None, &p);
        let (cx, cy) = analysis.centroids[0].unwrap();
        assert!((cx - 19.5).abs() <= 1.0);
        assert!((cy - 14.5).abs() <= 1.0);
    }

    #[test]
    fn crop_at_image_edge_keeps_absolute_coordinates() {
        let frame = synthetic_star(100, 100, 3.0, 3.0, 2.0, 220.0);
        let analysis = detect_stars(&frame, None, &params());
        let (cx, cy) = analysis.centroids[0].expect("edge star not found");
        assert!((cx - 3.0).abs() <= 1.0, "cx = {cx}");
        assert!((cy - 3.0).abs() <= 1.0, "cy = {cy}");
    }

    #[test]
    fn empty_frame_yields_no_star() {
        let frame = Array2::<u8>::zeros((100, 100));
        let analysis = detect_stars(&frame, None, &params());
        assert_eq!(analysis.centroids, vec![None]);
        assert!(analysis.preview.is_none());
    }

    #[test]
    fn threshold_image_is_binary() {
        let frame = synthetic_star(64, 64, 32.0, 32.0, 2.0, 200.0);
        let analysis = detect_stars(&frame, None, &params());
        assert!(analysis.threshold.iter().all(|&v| v == 0 || v == 255));
    }
}
