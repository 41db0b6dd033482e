//! Coordinate and angle conversions.
//!
//! Three families live here: the LX200 sexagesimal strings spoken by the
//! mount (`HH:MM:SS` / `±DD*MM:SS`), the Stellarium wire integers
//! (radians scaled by 2³¹/π), and the plane geometry used by the guider
//! (vector rotation, pixel ↔ arcsecond scaling with the declination
//! correction).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConversionError {
    #[error("invalid RA string: {0}")]
    InvalidRa(String),
    #[error("invalid DEC string: {0}")]
    InvalidDec(String),
}

/// Smallest |cos(dec)| used when scaling RA; keeps the conversion finite
/// within 1e-6 rad of the pole.
pub const MIN_COS_DEC: f64 = 1e-6;

/// Degrees to LX200 right-ascension string `HH:MM:SS`.
pub fn deg_to_lx200_ra(deg: f64) -> String {
    let ra_hours = deg / 15.0;
    let h = ra_hours as i32;
    let m = ((ra_hours - h as f64) * 60.0) as i32;
    let s = (((ra_hours - h as f64) * 60.0 - m as f64) * 60.0) as i32;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

/// Degrees to LX200 declination string `±DD*MM:SS`.
pub fn deg_to_lx200_dec(deg: f64) -> String {
    let sign = if deg >= 0.0 { '+' } else { '-' };
    let deg_abs = deg.abs();
    let d = deg_abs as i32;
    let m = ((deg_abs - d as f64) * 60.0) as i32;
    let s = (((deg_abs - d as f64) * 60.0 - m as f64) * 60.0) as i32;
    format!("{}{:02}*{:02}:{:02}", sign, d, m, s)
}

/// LX200 RA string `HH:MM:SS` to degrees.
pub fn lx200_ra_to_deg(ra: &str) -> Result<f64, ConversionError> {
    let parts: Vec<&str> = ra.trim().trim_end_matches('#').split(':').collect();
    if parts.len() != 3 {
        return Err(ConversionError::InvalidRa(ra.to_string()));
    }
    let nums: Result<Vec<i32>, _> = parts.iter().map(|p| p.parse::<i32>()).collect();
    match nums {
        Ok(v) => Ok(v[0] as f64 * 15.0 + v[1] as f64 * 15.0 / 60.0 + v[2] as f64 * 15.0 / 3600.0),
        Err(_) => Err(ConversionError::InvalidRa(ra.to_string())),
    }
}

/// LX200 DEC string `±DD*MM:SS` to degrees.
pub fn lx200_dec_to_deg(dec: &str) -> Result<f64, ConversionError> {
    let s = dec.trim().trim_end_matches('#');
    let mut chars = s.chars();
    let sign = match chars.next() {
        Some('+') => 1.0,
        Some('-') => -1.0,
        _ => return Err(ConversionError::InvalidDec(dec.to_string())),
    };
    let rest: String = chars.collect();
    let normalized = rest.replace('*', ":");
    let parts: Vec<&str> = normalized.split(':').collect();
    if parts.len() != 3 {
        return Err(ConversionError::InvalidDec(dec.to_string()));
    }
    let nums: Result<Vec<i32>, _> = parts.iter().map(|p| p.parse::<i32>()).collect();
    match nums {
        Ok(v) => Ok(sign * (v[0] as f64 + v[1] as f64 / 60.0 + v[2] as f64 / 3600.0)),
        Err(_) => Err(ConversionError::InvalidDec(dec.to_string())),
    }
}

/// Degrees to the Stellarium unsigned 32-bit RA integer (rad · 2³¹/π).
pub fn deg_to_stellarium_ra(deg: f64) -> u32 {
    let rad = deg.to_radians();
    let scaled = (rad * (0x8000_0000u32 as f64 / std::f64::consts::PI)).round() as i64;
    (scaled & 0xFFFF_FFFF) as u32
}

/// Degrees to the Stellarium signed 32-bit DEC integer (rad · 2³¹/π).
pub fn deg_to_stellarium_dec(deg: f64) -> i32 {
    let rad = deg.to_radians();
    (rad * (0x8000_0000u32 as f64 / std::f64::consts::PI)).round() as i32
}

/// Stellarium RA integer back to degrees in [0, 360).
pub fn stellarium_ra_to_deg(ra: u32) -> f64 {
    let rad = ra as f64 * (std::f64::consts::PI / 0x8000_0000u32 as f64);
    rad.to_degrees().rem_euclid(360.0)
}

/// Stellarium DEC integer back to degrees clamped to [-90, 90].
pub fn stellarium_dec_to_deg(dec: i32) -> f64 {
    let rad = dec as f64 * (std::f64::consts::PI / 0x8000_0000u32 as f64);
    rad.to_degrees().clamp(-90.0, 90.0)
}

/// Rotate `(dx, dy)` counter-clockwise by `angle_deg`.
pub fn rotate_vector(dx: f64, dy: f64, angle_deg: f64) -> (f64, f64) {
    let rad = angle_deg.to_radians();
    let (sin, cos) = rad.sin_cos();
    (dx * cos - dy * sin, dx * sin + dy * cos)
}

/// Pixel offsets to arcseconds, scaling RA by 1/cos(dec).
///
/// `pixel_scale` is arcsec per pixel at the equator; `declination_deg`
/// widens the RA scale towards the poles, clamped so the conversion stays
/// finite within 1e-6 rad of the pole.
pub fn pixels_to_arcseconds(
    dx: f64,
    dy: f64,
    pixel_scale: f64,
    declination_deg: f64,
) -> (f64, f64) {
    let cos_dec = declination_deg.to_radians().cos();
    let ra_scale = if cos_dec.abs() > MIN_COS_DEC {
        pixel_scale / cos_dec
    } else {
        pixel_scale / MIN_COS_DEC
    };
    (dx * ra_scale, dy * pixel_scale)
}

/// Inverse of [`pixels_to_arcseconds`].
pub fn arcseconds_to_pixels(
    ra_arcsec: f64,
    dec_arcsec: f64,
    pixel_scale: f64,
    declination_deg: f64,
) -> (f64, f64) {
    let cos_dec = declination_deg.to_radians().cos();
    let ra_scale = if cos_dec.abs() > MIN_COS_DEC {
        pixel_scale / cos_dec
    } else {
        pixel_scale / MIN_COS_DEC
    };
    (ra_arcsec / ra_scale, dec_arcsec / pixel_scale)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn lx200_ra_round_trips_for_integer_seconds() {
        for &s in &["00:00:00", "06:00:00", "12:34:56", "23:59:59"] {
            let deg = lx200_ra_to_deg(s).unwrap();
            assert_eq!(deg_to_lx200_ra(deg), s);
        }
    }

    #[test]
    fn lx200_dec_round_trips_for_integer_seconds() {
        for &s in &["+00*00:00", "+45*00:00", "-12*34:56", "+89*59:59", "-89*59:59"] {
            let deg = lx200_dec_to_deg(s).unwrap();
            assert_eq!(deg_to_lx200_dec(deg), s);
        }
    }

    #[test]
    fn lx200_parse_rejects_garbage() {
        assert!(lx200_ra_to_deg("12:34").is_err());
        assert!(lx200_ra_to_deg("ab:cd:ef").is_err());
        assert!(lx200_dec_to_deg("45*00:00").is_err());
    }

    #[test]
    fn stellarium_known_values() {
        // 0x40000000 = 90 deg, 0x20000000 = 45 deg.
        assert_relative_eq!(stellarium_ra_to_deg(0x4000_0000), 90.0, epsilon = 1e-6);
        assert_relative_eq!(stellarium_dec_to_deg(0x2000_0000), 45.0, epsilon = 1e-6);
        assert_eq!(deg_to_stellarium_ra(90.0), 0x4000_0000);
        assert_eq!(deg_to_stellarium_dec(45.0), 0x2000_0000);
    }

    #[test]
    fn stellarium_negative_dec() {
        let enc = deg_to_stellarium_dec(-45.0);
        assert!(enc < 0);
        assert_relative_eq!(stellarium_dec_to_deg(enc), -45.0, epsilon = 1e-6);
    }

    #[test]
    fn rotation_round_trips() {
        for &angle in &[0.0, 26.565, -26.565, 90.0, 180.0, -179.0] {
            let (rx, ry) = rotate_vector(3.5, -1.25, angle);
            let (bx, by) = rotate_vector(rx, ry, -angle);
            assert_relative_eq!(bx, 3.5, epsilon = 1e-3);
            assert_relative_eq!(by, -1.25, epsilon = 1e-3);
        }
    }

    #[test]
    fn arcsecond_conversion_is_identity_below_85_deg() {
        for &dec in &[0.0, 30.0, -60.0, 84.9] {
            let (ra, de) = pixels_to_arcseconds(10.0, -4.0, 3.6, dec);
            let (px, py) = arcseconds_to_pixels(ra, de, 3.6, dec);
            assert_relative_eq!(px, 10.0, epsilon = 1e-9);
            assert_relative_eq!(py, -4.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn pole_uses_clamped_scale() {
        let (ra, _) = pixels_to_arcseconds(1.0, 0.0, 3.6, 90.0);
        assert!(ra.is_finite());
        assert_relative_eq!(ra, 3.6 / MIN_COS_DEC, epsilon = 1.0);
    }

    #[test]
    fn dec_scaling_widens_ra() {
        let (ra_eq, dec_eq) = pixels_to_arcseconds(10.0, 10.0, 3.6, 0.0);
        let (ra_60, dec_60) = pixels_to_arcseconds(10.0, 10.0, 3.6, 60.0);
        assert_relative_eq!(ra_eq, 36.0, epsilon = 1e-9);
        assert_relative_eq!(dec_eq, 36.0, epsilon = 1e-9);
        assert_relative_eq!(ra_60, 72.0, epsilon = 1e-6);
        assert_relative_eq!(dec_60, 36.0, epsilon = 1e-9);
    }
}
