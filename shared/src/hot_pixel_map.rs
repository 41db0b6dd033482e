//! Persisted hot-pixel map.
//!
//! Built offline from averaged dark frames and applied by the capture
//! pipeline after frame integration. The 3×3 anti-debayer weight kernel is
//! stored inside the map file so the correction is fully described by its
//! inputs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotPixelMapError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed map file: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Weights removed around a hot pixel before it is replaced by the
/// neighborhood median. The center weight of 1.0 removes the hot value
/// itself; the neighbors undo the demosaicing bleed.
pub const DEFAULT_KERNEL: [[f32; 3]; 3] = [
    [0.15, 0.3, 0.15],
    [0.3, 1.0, 0.3],
    [0.15, 0.3, 0.15],
];

/// Sparse set of hot pixels plus the correction kernel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HotPixelMap {
    /// Hot pixel coordinates as `(y, x)` pairs.
    pub pixels: Vec<(u32, u32)>,
    /// 3×3 anti-debayer weight kernel, row-major.
    #[serde(default = "default_kernel")]
    pub kernel: [[f32; 3]; 3],
}

fn default_kernel() -> [[f32; 3]; 3] {
    DEFAULT_KERNEL
}

impl HotPixelMap {
    pub fn new(pixels: Vec<(u32, u32)>) -> Self {
        Self {
            pixels,
            kernel: DEFAULT_KERNEL,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn load(path: &Path) -> Result<Self, HotPixelMapError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), HotPixelMapError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot_pixel_mask.json");

        let map = HotPixelMap::new(vec![(10, 20), (30, 40)]);
        map.save(&path).unwrap();

        let loaded = HotPixelMap::load(&path).unwrap();
        assert_eq!(loaded, map);
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn kernel_defaults_when_absent_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.json");
        std::fs::write(&path, r#"{"pixels": [[1, 2]]}"#).unwrap();

        let loaded = HotPixelMap::load(&path).unwrap();
        assert_eq!(loaded.pixels, vec![(1, 2)]);
        assert_eq!(loaded.kernel, DEFAULT_KERNEL);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            HotPixelMap::load(&path),
            Err(HotPixelMapError::Malformed(_))
        ));
    }
}
