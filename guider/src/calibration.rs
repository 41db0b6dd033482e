//! Calibration of the field rotation angle and per-axis backlash.
//!
//! The procedure commands the mount through a fixed move/settle/detect
//! sequence around one tracked reference star and infers the rotation of
//! the camera field relative to the mount's RA axis (and optionally the
//! backlash of both axes). Guiding and the bridge's quiet flag are
//! restored on every exit path; nothing is mutated on failure.

use std::time::Duration;

use tracing::info;

use shared::conversions::rotate_vector;

use crate::analyzer::{detect_stars, AnalyzerParams};
use crate::guider::{analyzer_params, Guider};
use crate::{GuideError, GuideResult, PulseDirection};

/// Hint radius while the mount is being slewed around; much wider than the
/// guiding radius because the star travels tens of pixels between
/// detections.
const CALIBRATION_SEARCH_RADIUS: f64 = 100.0;

/// Timing knobs, separated so tests can run the sequence without real
/// settling delays.
#[derive(Debug, Clone)]
pub struct CalibrationTiming {
    pub settle: Duration,
    /// Scale applied to the nominal move durations.
    pub move_scale: f64,
}

impl Default for CalibrationTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            move_scale: 1.0,
        }
    }
}

/// Outcome of a successful calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub rotation_angle: f64,
    pub backlash_ra: Option<u16>,
    pub backlash_dec: Option<u16>,
}

/// Run the calibration procedure. Requires one tracked star.
pub fn calibrate(
    guider: &Guider,
    with_backlash: bool,
    timing: &CalibrationTiming,
) -> GuideResult<CalibrationResult> {
    let reference = guider.first_tracked().ok_or(GuideError::NoTrackedStar)?;

    let guiding_before = guider.guiding();
    let quiet_before = guider.mount().quiet();
    guider.set_guiding_flag(false);
    guider.mount().set_quiet(true);
    guider.set_calibrating(true);

    let result = run_sequence(guider, reference, with_backlash, timing);

    guider.set_calibrating(false);
    guider.mount().set_quiet(quiet_before);
    guider.set_guiding_flag(guiding_before);

    match &result {
        Ok(r) => {
            let status = format!("Calibrated rotation angle: {:.1} degrees", r.rotation_angle);
            info!("{status}");
            guider.status_log().record(status);
        }
        Err(e) => {
            guider.status_log().record(format!("Calibration failed: {e}"));
        }
    }
    result
}

fn run_sequence(
    guider: &Guider,
    reference: (f64, f64),
    with_backlash: bool,
    timing: &CalibrationTiming,
) -> GuideResult<CalibrationResult> {
    let mount = guider.mount();
    mount.set_guide_rate().map_err(GuideError::Mount)?;

    if with_backlash {
        // Measure raw axis play without the firmware compensating for it.
        mount.set_backlash(0, 0).map_err(GuideError::Mount)?;
    }

    let params = analyzer_params(&guider.config());

    let c1 = detect_at(guider, &params, reference)?;
    let c2 = move_and_detect(guider, &params, PulseDirection::East, 20.0, c1, timing)?;
    let c3 = move_and_detect(guider, &params, PulseDirection::East, 10.0, c2, timing)?;
    let c4 = move_and_detect(guider, &params, PulseDirection::West, 10.0, c3, timing)?;

    let backlash_points = if with_backlash {
        let c5 = move_and_detect(guider, &params, PulseDirection::North, 20.0, c4, timing)?;
        let c6 = move_and_detect(guider, &params, PulseDirection::North, 15.0, c5, timing)?;
        let c7 = move_and_detect(guider, &params, PulseDirection::South, 15.0, c6, timing)?;
        // Return the DEC excursion.
        mount
            .correction_pulse(PulseDirection::South, 20.0 * timing.move_scale)
            .map_err(GuideError::Mount)?;
        Some((c5, c7))
    } else {
        None
    };

    // Approximately cancel the net RA excursion.
    mount
        .correction_pulse(PulseDirection::West, 20.0 * timing.move_scale)
        .map_err(GuideError::Mount)?;

    let dx = c3.0 - c1.0;
    let dy = c3.1 - c1.1;
    let rotation_angle = (-dy.atan2(dx)).to_degrees();

    let pixel_scale = guider.rotation().pixel_scale;
    let mut rotation = guider.rotation();
    rotation.rotation_angle = rotation_angle;

    let (backlash_ra, backlash_dec) = match backlash_points {
        Some((c5, c7)) => {
            // RA backlash from the east/west reversal (C4 vs C2), DEC from
            // the north/south reversal (C7 vs C5), both in the rotated
            // frame.
            let (ra_rot, _) = rotate_vector(c4.0 - c2.0, c4.1 - c2.1, rotation_angle);
            let ra_arcsec = (ra_rot * pixel_scale).abs().round() as u16;

            let (_, dec_rot) = rotate_vector(c7.0 - c5.0, c7.1 - c5.1, rotation_angle);
            let dec_arcsec = (dec_rot * pixel_scale).abs().round() as u16;

            mount
                .set_backlash(ra_arcsec, dec_arcsec)
                .map_err(GuideError::Mount)?;
            rotation.backlash_ra = ra_arcsec;
            rotation.backlash_dec = dec_arcsec;
            (Some(ra_arcsec), Some(dec_arcsec))
        }
        None => (None, None),
    };

    guider.set_rotation_model(rotation);

    Ok(CalibrationResult {
        rotation_angle,
        backlash_ra,
        backlash_dec,
    })
}

fn detect_at(
    guider: &Guider,
    params: &AnalyzerParams,
    near: (f64, f64),
) -> GuideResult<(f64, f64)> {
    let frame = guider.frames().current_frame().ok_or(GuideError::NoFrame)?;
    let gray = frame.to_gray();
    let params = AnalyzerParams {
        max_distance: CALIBRATION_SEARCH_RADIUS,
        ..*params
    };
    let analysis = detect_stars(&gray, Some(&[near]), &params);
    analysis
        .centroids
        .first()
        .copied()
        .flatten()
        .ok_or_else(|| GuideError::CalibrationFailed("failed to detect centroid".to_string()))
}

fn move_and_detect(
    guider: &Guider,
    params: &AnalyzerParams,
    direction: PulseDirection,
    seconds: f64,
    search_near: (f64, f64),
    timing: &CalibrationTiming,
) -> GuideResult<(f64, f64)> {
    info!("calibration move {:?} for {seconds} s", direction);
    guider
        .mount()
        .correction_pulse(direction, seconds * timing.move_scale)
        .map_err(GuideError::Mount)?;
    std::thread::sleep(timing.settle);
    detect_at(guider, params, search_near)
}
