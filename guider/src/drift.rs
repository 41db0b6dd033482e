//! Drift estimation: robust mean over per-star displacements and the
//! conversion into mount-frame arcseconds.

use shared::conversions::{pixels_to_arcseconds, rotate_vector};

use crate::config::{Correction, RotationModel};

/// Robust mean of displacement vectors.
///
/// Computes the mean vector, measures each vector's distance from it, and
/// keeps the vectors whose distance lies within twice the distance spread
/// before averaging again. A single wildly different star (a hot pixel, a
/// misassociation) is rejected; identical drifts are all kept. Returns
/// `(0, 0)` when nothing survives the trim.
pub fn robust_mean(vectors: &[(f64, f64)]) -> (f64, f64) {
    if vectors.is_empty() {
        return (0.0, 0.0);
    }

    let n = vectors.len() as f64;
    let mean_x = vectors.iter().map(|v| v.0).sum::<f64>() / n;
    let mean_y = vectors.iter().map(|v| v.1).sum::<f64>() / n;

    let distances: Vec<f64> = vectors
        .iter()
        .map(|v| ((v.0 - mean_x).powi(2) + (v.1 - mean_y).powi(2)).sqrt())
        .collect();
    let mean_d = distances.iter().sum::<f64>() / n;
    let var = distances.iter().map(|d| (d - mean_d).powi(2)).sum::<f64>() / n;
    let sigma = var.sqrt();

    let kept: Vec<&(f64, f64)> = vectors
        .iter()
        .zip(&distances)
        .filter(|(_, &d)| d <= 2.0 * sigma)
        .map(|(v, _)| v)
        .collect();

    if kept.is_empty() {
        return (0.0, 0.0);
    }
    let kn = kept.len() as f64;
    let x = kept.iter().map(|v| v.0).sum::<f64>() / kn;
    let y = kept.iter().map(|v| v.1).sum::<f64>() / kn;
    (round4(x), round4(y))
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

/// Reduce per-star displacements to a correction record: robust mean,
/// rotation into mount axes, conversion to arcseconds at the current
/// declination. Pulse directions and speeds are filled in later by the
/// selected guide-output method.
pub fn compute_correction(
    displacements: &[(f64, f64)],
    rotation: &RotationModel,
    declination_deg: f64,
) -> Correction {
    let (dx, dy) = robust_mean(displacements);
    let (dx_rot, dy_rot) = rotate_vector(dx, dy, rotation.rotation_angle);
    let (ra_arcsec, dec_arcsec) =
        pixels_to_arcseconds(dx_rot, dy_rot, rotation.pixel_scale, declination_deg);
    Correction {
        ra_px: round4(dx_rot),
        dec_px: round4(dy_rot),
        ra_arcsec: round2(ra_arcsec),
        dec_arcsec: round2(dec_arcsec),
        ra: 0,
        dec: 0,
        ra_speed: 0,
        dec_speed: 0,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identical_drifts_are_all_kept() {
        let v = vec![(10.0, 0.0), (10.0, 0.0), (10.0, 0.0)];
        assert_eq!(robust_mean(&v), (10.0, 0.0));
    }

    #[test]
    fn outlier_is_rejected_by_two_sigma_trim() {
        let v = vec![(10.0, 0.0), (10.0, 0.0), (10.0, 0.0), (50.0, 50.0)];
        assert_eq!(robust_mean(&v), (10.0, 0.0));
    }

    #[test]
    fn single_vector_passes_through() {
        assert_eq!(robust_mean(&[(3.25, -1.5)]), (3.25, -1.5));
    }

    #[test]
    fn empty_input_yields_zero() {
        assert_eq!(robust_mean(&[]), (0.0, 0.0));
    }

    #[test]
    fn correction_rotates_and_scales() {
        let rotation = RotationModel {
            rotation_angle: 0.0,
            pixel_scale: 3.6,
            ..Default::default()
        };
        let corr = compute_correction(&[(10.0, 0.0)], &rotation, 0.0);
        assert_relative_eq!(corr.ra_px, 10.0);
        assert_relative_eq!(corr.dec_px, 0.0);
        assert_relative_eq!(corr.ra_arcsec, 36.0);
        assert_relative_eq!(corr.dec_arcsec, 0.0);
    }

    #[test]
    fn correction_applies_field_rotation() {
        let rotation = RotationModel {
            rotation_angle: 90.0,
            pixel_scale: 1.0,
            ..Default::default()
        };
        // A pure-x drift rotated 90 deg CCW lands on +y.
        let corr = compute_correction(&[(5.0, 0.0)], &rotation, 0.0);
        assert_relative_eq!(corr.ra_px, 0.0, epsilon = 1e-9);
        assert_relative_eq!(corr.dec_px, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn correction_widens_ra_with_declination() {
        let rotation = RotationModel {
            rotation_angle: 0.0,
            pixel_scale: 2.0,
            ..Default::default()
        };
        let corr = compute_correction(&[(1.0, 1.0)], &rotation, 60.0);
        assert_relative_eq!(corr.ra_arcsec, 4.0, epsilon = 1e-6);
        assert_relative_eq!(corr.dec_arcsec, 2.0, epsilon = 1e-6);
    }
}
