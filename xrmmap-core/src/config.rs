//! Scan configuration loaded from TOML.
//!
//! A scan folder carries a one-time configuration describing axis ranges,
//! the expected point count per row, ROI windows and energy calibration:
//!
//! ```toml
//! [scan]
//! dimension = 2
//! serpentine = true
//!
//! [scan.fast_axis]
//! name = "fine x"
//! start = -1.0
//! stop = 1.0
//! step = 0.002
//!
//! [scan.slow_axis]
//! name = "fine y"
//! start = -0.5
//! stop = 0.5
//! step = 0.002
//!
//! [[rois]]
//! name = "Fe Ka"
//! left = 630
//! right = 660
//!
//! [[calibration]]
//! offset = -0.012
//! slope = 0.01
//! ```

use crate::{Error, Result};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration for a scan folder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Geometry of the scan.
    #[serde(default)]
    pub scan: ScanSection,
    /// Named channel windows integrated into ROI maps.
    #[serde(default)]
    pub rois: Vec<RoiDefinition>,
    /// Energy calibration, either one shared entry or one per detector.
    #[serde(default)]
    pub calibration: Vec<Calibration>,
}

/// The `[scan]` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanSection {
    /// 1 for a line scan, 2 for a map.
    #[serde(default = "default_dimension")]
    pub dimension: u8,
    /// Stage axis moved within a row.
    #[serde(default)]
    pub fast_axis: AxisRange,
    /// Stage axis stepped between rows (2-D scans only).
    #[serde(default)]
    pub slow_axis: Option<AxisRange>,
    /// Explicit pixels per row; derived from `fast_axis` when absent.
    #[serde(default)]
    pub points_per_row: Option<usize>,
    /// Odd rows are collected in the reverse direction.
    #[serde(default = "default_serpentine")]
    pub serpentine: bool,
}

fn default_dimension() -> u8 {
    2
}

fn default_serpentine() -> bool {
    true
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            dimension: default_dimension(),
            fast_axis: AxisRange::default(),
            slow_axis: None,
            points_per_row: None,
            serpentine: default_serpentine(),
        }
    }
}

/// Start/stop/step description of one stage axis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// Axis label stored in the position names.
    pub name: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl Default for AxisRange {
    fn default() -> Self {
        Self {
            name: "x".to_string(),
            start: 0.0,
            stop: 0.0,
            step: 1.0,
        }
    }
}

impl AxisRange {
    /// Number of stage stops covered by this range.
    ///
    /// Returns 0 for a non-positive or non-finite step.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn points(&self) -> usize {
        let step = self.step.abs();
        if step <= 0.0 || !step.is_finite() {
            return 0;
        }
        let n = ((self.stop - self.start).abs() + 1.1 * step) / step;
        if n.is_finite() && n > 0.0 {
            n.floor() as usize
        } else {
            0
        }
    }
}

/// A named channel window. `right` is exclusive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiDefinition {
    pub name: String,
    pub left: usize,
    pub right: usize,
    /// Optional per-detector `[left, right)` windows overriding the shared one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detectors: Option<Vec<[usize; 2]>>,
}

impl RoiDefinition {
    /// Create a window shared by all detectors.
    #[must_use]
    pub fn new(name: impl Into<String>, left: usize, right: usize) -> Self {
        Self {
            name: name.into(),
            left,
            right,
            detectors: None,
        }
    }

    /// Channel window for detector `det`.
    #[must_use]
    pub fn window(&self, det: usize) -> [usize; 2] {
        self.detectors
            .as_ref()
            .and_then(|w| w.get(det).copied())
            .unwrap_or([self.left, self.right])
    }
}

/// Quadratic channel-to-energy calibration.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub offset: f64,
    #[serde(default = "default_slope")]
    pub slope: f64,
    #[serde(default)]
    pub quad: f64,
}

fn default_slope() -> f64 {
    0.01
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            offset: 0.0,
            slope: default_slope(),
            quad: 0.0,
        }
    }
}

impl Calibration {
    /// Energy of channel `ch`: `offset + slope*ch + quad*ch^2`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn energy_at(&self, ch: usize) -> f64 {
        let x = ch as f64;
        self.offset + x * (self.slope + x * self.quad)
    }

    /// Energy axis for `nchan` channels.
    #[must_use]
    pub fn energy(&self, nchan: usize) -> Array1<f64> {
        (0..nchan).map(|ch| self.energy_at(ch)).collect()
    }
}

impl ScanConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    /// Returns an error if the TOML is malformed or the scan is inconsistent.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency that does not depend on row data.
    ///
    /// # Errors
    /// Returns `InvalidConfig` for a bad dimension, a 2-D scan without a
    /// slow axis, or an empty/inverted ROI window.
    pub fn validate(&self) -> Result<()> {
        match self.scan.dimension {
            1 => {}
            2 => {
                if self.scan.slow_axis.is_none() {
                    return Err(Error::InvalidConfig(
                        "2-D scan requires a slow_axis".to_string(),
                    ));
                }
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "dimension must be 1 or 2, got {other}"
                )));
            }
        }
        for roi in &self.rois {
            let windows = roi
                .detectors
                .clone()
                .unwrap_or_else(|| vec![[roi.left, roi.right]]);
            if let Some([l, r]) = windows.into_iter().find(|[l, r]| l >= r) {
                return Err(Error::InvalidConfig(format!(
                    "ROI '{}' has empty window [{l}, {r})",
                    roi.name
                )));
            }
        }
        Ok(())
    }

    /// Expected pixels per row.
    #[must_use]
    pub fn points_per_row(&self) -> usize {
        self.scan
            .points_per_row
            .unwrap_or_else(|| self.scan.fast_axis.points())
    }

    /// Expected number of rows (1 for line scans).
    #[must_use]
    pub fn expected_rows(&self) -> usize {
        match (&self.scan.slow_axis, self.scan.dimension) {
            (Some(axis), 2) => axis.points(),
            _ => 1,
        }
    }

    /// Calibration for each of `ndet` detectors.
    ///
    /// # Errors
    /// Returns `InvalidConfig` when more than one calibration is given and the
    /// count does not match `ndet`.
    pub fn calibrations(&self, ndet: usize) -> Result<Vec<Calibration>> {
        match self.calibration.len() {
            0 => Ok(vec![Calibration::default(); ndet]),
            1 => Ok(vec![self.calibration[0]; ndet]),
            n if n == ndet => Ok(self.calibration.clone()),
            n => Err(Error::InvalidConfig(format!(
                "{n} calibrations given for {ndet} detectors"
            ))),
        }
    }

    /// Position axis names in storage order.
    #[must_use]
    pub fn position_names(&self) -> Vec<String> {
        let mut names = vec![self.scan.fast_axis.name.clone()];
        if self.scan.dimension == 2 {
            if let Some(axis) = &self.scan.slow_axis {
                names.push(axis.name.clone());
            }
        }
        names.push("mca realtime".to_string());
        names.push("mca livetime".to_string());
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SAMPLE: &str = r#"
        [scan]
        dimension = 2

        [scan.fast_axis]
        name = "fine x"
        start = 0.0
        stop = 0.9
        step = 0.1

        [scan.slow_axis]
        name = "fine y"
        start = 0.0
        stop = 0.2
        step = 0.1

        [[rois]]
        name = "Fe Ka"
        left = 10
        right = 50

        [[rois]]
        name = "Cu Ka"
        left = 60
        right = 70
        detectors = [[60, 70], [61, 71]]

        [[calibration]]
        offset = -0.01
        slope = 0.02
    "#;

    #[test]
    fn test_parse_scan_config() {
        let config = ScanConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.scan.dimension, 2);
        assert!(config.scan.serpentine);
        assert_eq!(config.points_per_row(), 10);
        assert_eq!(config.expected_rows(), 3);
        assert_eq!(config.rois.len(), 2);
        assert_eq!(config.rois[1].window(1), [61, 71]);
        assert_eq!(config.rois[0].window(1), [10, 50]);
        assert_eq!(
            config.position_names(),
            vec!["fine x", "fine y", "mca realtime", "mca livetime"]
        );
    }

    #[test]
    fn test_calibrations_broadcast_and_mismatch() {
        let config = ScanConfig::from_str(SAMPLE).unwrap();
        let cals = config.calibrations(4).unwrap();
        assert_eq!(cals.len(), 4);
        assert_relative_eq!(cals[3].slope, 0.02);
        assert_relative_eq!(cals[3].quad, 0.0);

        let mut two = config.clone();
        two.calibration.push(Calibration::default());
        assert!(two.calibrations(2).is_ok());
        assert!(matches!(two.calibrations(3), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_energy_axis() {
        let cal = Calibration {
            offset: 1.0,
            slope: 0.5,
            quad: 0.25,
        };
        let e = cal.energy(3);
        assert_relative_eq!(e[0], 1.0);
        assert_relative_eq!(e[1], 1.75);
        assert_relative_eq!(e[2], 3.0);
    }

    #[test]
    fn test_axis_points() {
        let axis = AxisRange {
            name: "x".into(),
            start: 1.0,
            stop: -1.0,
            step: 0.5,
        };
        assert_eq!(axis.points(), 5);
        let bad = AxisRange {
            step: 0.0,
            ..axis
        };
        assert_eq!(bad.points(), 0);
    }

    #[test]
    fn test_rejects_bad_dimension_and_window() {
        let err = ScanConfig::from_str("[scan]\ndimension = 3\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ScanConfig::from_str(
            "[scan]\ndimension = 1\n[[rois]]\nname = \"bad\"\nleft = 5\nright = 5\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = ScanConfig::from_str("[scan]\ndimension = 2\n").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), SAMPLE).unwrap();
        let config = ScanConfig::from_file(file.path()).unwrap();
        assert_eq!(config.rois[0].name, "Fe Ka");
    }
}
