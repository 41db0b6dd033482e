//! Plate-solver adapter.
//!
//! Delegates to the astrometry.net `solve-field` program and parses the
//! field center, rotation and pixel scale out of its report. The solved
//! rotation is normalized into the guider's [-180, 180] convention.

use std::path::Path;
use std::process::Command;

use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("failed to run solve-field: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("solve-field failed: {0}")]
    Failed(String),
    #[error("image was not solved")]
    Unsolved,
    #[error("failed to parse solver output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveResult {
    pub ra_deg: f64,
    pub dec_deg: f64,
    /// Field rotation in degrees, [-180, 180].
    pub rotation_deg: f64,
    /// Arcseconds per pixel.
    pub pixel_scale: f64,
}

/// Solve an image, blocking until `solve-field` finishes or hits its CPU
/// limit.
pub fn solve(
    image_path: &Path,
    downsample: u32,
    scale_low: u32,
    scale_high: u32,
    timeout_s: u32,
) -> Result<SolveResult, SolveError> {
    info!("solving {}", image_path.display());
    let output = Command::new("solve-field")
        .arg(image_path)
        .args(["--scale-units", "arcminwidth"])
        .args(["--scale-low", &scale_low.to_string()])
        .args(["--scale-high", &scale_high.to_string()])
        .args(["--downsample", &downsample.to_string()])
        .args(["--cpulimit", &timeout_s.to_string()])
        .arg("--overwrite")
        .arg("--no-plots")
        .args(["--dir", "."])
        .output()?;

    if !output.status.success() {
        return Err(SolveError::Failed(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    parse_solve_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse the relevant lines of a `solve-field` report.
pub fn parse_solve_output(stdout: &str) -> Result<SolveResult, SolveError> {
    if !stdout.contains("Field 1: solved") {
        return Err(SolveError::Unsolved);
    }

    let (ra_deg, dec_deg) = parse_field_center(stdout)
        .ok_or_else(|| SolveError::Parse("missing field center".to_string()))?;
    let up = parse_after(stdout, "Field rotation angle: up is ", " degrees")
        .ok_or_else(|| SolveError::Parse("missing rotation angle".to_string()))?;
    let pixel_scale = parse_after(stdout, "pixel scale ", " arcsec/pix")
        .ok_or_else(|| SolveError::Parse("missing pixel scale".to_string()))?;

    // The solver reports where "up" points; the guider wants the field
    // rotation, wrapped into [-180, 180].
    let mut rotation_deg = 180.0 - up;
    if rotation_deg > 180.0 {
        rotation_deg -= 360.0;
    }
    if rotation_deg < -180.0 {
        rotation_deg += 360.0;
    }

    Ok(SolveResult {
        ra_deg,
        dec_deg,
        rotation_deg,
        pixel_scale,
    })
}

fn parse_field_center(stdout: &str) -> Option<(f64, f64)> {
    let marker = "Field center: (RA,Dec) = (";
    let start = stdout.find(marker)? + marker.len();
    let rest = &stdout[start..];
    let end = rest.find(')')?;
    let mut parts = rest[..end].split(',');
    let ra = parts.next()?.trim().parse().ok()?;
    let dec = parts.next()?.trim().parse().ok()?;
    Some((ra, dec))
}

fn parse_after(text: &str, prefix: &str, suffix: &str) -> Option<f64> {
    let start = text.find(prefix)? + prefix.len();
    let rest = &text[start..];
    let end = rest.find(suffix)?;
    rest[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = "\
Reading input file 1 of 1: \"frame.png\"...
Field 1: solved with index index-4207-00.fits.
Field center: (RA,Dec) = (187.123456, 12.654321) deg.
Field rotation angle: up is 214.300000 degrees E of N
pixel scale 3.612 arcsec/pix.
";

    #[test]
    fn parses_center_rotation_and_scale() {
        let result = parse_solve_output(SAMPLE).unwrap();
        assert_relative_eq!(result.ra_deg, 187.123456);
        assert_relative_eq!(result.dec_deg, 12.654321);
        // 180 - 214.3 = -34.3, already within range.
        assert_relative_eq!(result.rotation_deg, -34.3, epsilon = 1e-9);
        assert_relative_eq!(result.pixel_scale, 3.612);
    }

    #[test]
    fn rotation_wraps_into_range() {
        let sample = SAMPLE.replace("214.300000", "10.000000");
        let result = parse_solve_output(&sample).unwrap();
        // 180 - 10 = 170, inside the range.
        assert_relative_eq!(result.rotation_deg, 170.0, epsilon = 1e-9);

        let sample = SAMPLE.replace("214.300000", "-10.000000");
        let result = parse_solve_output(&sample).unwrap();
        // 180 + 10 = 190 wraps to -170.
        assert_relative_eq!(result.rotation_deg, -170.0, epsilon = 1e-9);
    }

    #[test]
    fn unsolved_field_is_reported() {
        assert!(matches!(
            parse_solve_output("Field 1: did not solve"),
            Err(SolveError::Unsolved)
        ));
    }

    #[test]
    fn missing_lines_are_parse_errors() {
        assert!(matches!(
            parse_solve_output("Field 1: solved"),
            Err(SolveError::Parse(_))
        ));
    }
}
