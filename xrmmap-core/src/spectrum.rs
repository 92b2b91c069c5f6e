//! Self-describing aggregation results.

use crate::config::Calibration;
use crate::{Error, Result};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Where a result came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    /// Container file name.
    pub filename: String,
    /// Detector group, e.g. `mca2` or `mcasum`.
    pub detector: String,
    /// Rectangle or area the data was summed over.
    pub region: String,
}

/// A named channel window on a spectrum, `[left, right)`.
///
/// Summed-detector spectra carry the first detector's windows. When the
/// detectors use different windows, the summed ROI map adds each
/// detector's own window and will not equal the window total here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpectrumRoi {
    pub name: String,
    pub left: usize,
    pub right: usize,
}

/// Summed spectrum over a region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Counts per channel, dead-time corrected when requested.
    pub counts: Array1<f64>,
    pub energy: Array1<f64>,
    pub calibration: Calibration,
    pub rois: Vec<SpectrumRoi>,
    /// Pixels that contributed.
    pub npixels: usize,
    /// Summed real time in seconds.
    pub real_time: f64,
    /// Summed live time in seconds.
    pub live_time: f64,
    pub dead_time_corrected: bool,
    pub provenance: Provenance,
}

impl Spectrum {
    /// Number of channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all channels.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.counts.sum()
    }

    /// Integrated counts in the named ROI.
    ///
    /// # Errors
    /// Returns `NotFound` when the spectrum carries no ROI with that name.
    pub fn roi_counts(&self, name: &str) -> Result<f64> {
        let roi = self
            .rois
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::NotFound(format!("ROI '{name}'")))?;
        let right = roi.right.min(self.counts.len());
        let left = roi.left.min(right);
        Ok(self.counts.slice(ndarray::s![left..right]).sum())
    }

    /// Counts divided by summed real time; unchanged when the time is not
    /// positive.
    #[must_use]
    pub fn counts_per_second(&self) -> Array1<f64> {
        if self.real_time > 0.0 {
            &self.counts / self.real_time
        } else {
            self.counts.clone()
        }
    }
}

/// Summed diffraction frames over a region.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameSum {
    /// `[height, width]`
    pub frame: Array2<f64>,
    pub npixels: usize,
    pub provenance: Provenance,
}

/// Summed live and real time over a region, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveRealTime {
    pub live_time: f64,
    pub real_time: f64,
    pub npixels: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn spectrum() -> Spectrum {
        Spectrum {
            counts: array![1.0, 2.0, 3.0, 4.0],
            energy: array![0.0, 0.01, 0.02, 0.03],
            calibration: Calibration::default(),
            rois: vec![SpectrumRoi {
                name: "mid".to_string(),
                left: 1,
                right: 3,
            }],
            npixels: 2,
            real_time: 2.0,
            live_time: 1.5,
            dead_time_corrected: false,
            provenance: Provenance::default(),
        }
    }

    #[test]
    fn test_roi_counts() {
        let s = spectrum();
        assert_relative_eq!(s.roi_counts("mid").unwrap(), 5.0);
        assert!(matches!(s.roi_counts("missing"), Err(Error::NotFound(_))));
        assert_relative_eq!(s.total(), 10.0);
    }

    #[test]
    fn test_counts_per_second() {
        let mut s = spectrum();
        assert_relative_eq!(s.counts_per_second()[3], 2.0);
        s.real_time = 0.0;
        assert_relative_eq!(s.counts_per_second()[3], 4.0);
    }
}
