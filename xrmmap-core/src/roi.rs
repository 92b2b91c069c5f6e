//! ROI window integration for ROI maps.

use crate::config::RoiDefinition;
use crate::{Error, Result};
use ndarray::{s, Array2, ArrayView2, ArrayView3};

/// Channel windows for every ROI and detector, `windows[roi][det] = [left, right)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoiTable {
    pub names: Vec<String>,
    pub windows: Vec<Vec<[usize; 2]>>,
}

impl RoiTable {
    /// Resolve ROI definitions for `ndet` detectors with `nchan` channels.
    ///
    /// # Errors
    /// Returns `InvalidShape` if a per-detector window list has the wrong
    /// length or a window lies outside `0..nchan`, and `InvalidConfig` on a
    /// duplicate ROI name.
    pub fn resolve(rois: &[RoiDefinition], ndet: usize, nchan: usize) -> Result<Self> {
        let mut names = Vec::with_capacity(rois.len());
        let mut windows = Vec::with_capacity(rois.len());
        for roi in rois {
            if names.contains(&roi.name) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate ROI name '{}'",
                    roi.name
                )));
            }
            if let Some(per_det) = &roi.detectors {
                if per_det.len() != ndet {
                    return Err(Error::InvalidShape(format!(
                        "ROI '{}' has {} windows for {ndet} detectors",
                        roi.name,
                        per_det.len()
                    )));
                }
            }
            let mut row = Vec::with_capacity(ndet);
            for det in 0..ndet {
                let [left, right] = roi.window(det);
                if left >= right || right > nchan {
                    return Err(Error::InvalidShape(format!(
                        "ROI '{}' window [{left}, {right}) outside 0..{nchan}",
                        roi.name
                    )));
                }
                row.push([left, right]);
            }
            names.push(roi.name.clone());
            windows.push(row);
        }
        Ok(Self { names, windows })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Position of `name` in the table.
    ///
    /// # Errors
    /// Returns `NotFound` when no ROI has that name.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::NotFound(format!("ROI '{name}'")))
    }

    /// Column names for the per-detector ROI map, `"<roi> (mca<k>)"`.
    #[must_use]
    pub fn detector_column_names(&self, ndet: usize) -> Vec<String> {
        self.names
            .iter()
            .flat_map(|name| (1..=ndet).map(move |k| format!("{name} (mca{k})")))
            .collect()
    }
}

/// Integrated ROI values for one row.
#[derive(Clone, Debug)]
pub struct RoiSums {
    /// `[pixel, roi * ndet + det]`
    pub det_raw: Array2<f64>,
    pub det_cor: Array2<f64>,
    /// `[pixel, roi]`
    pub sum_raw: Array2<f64>,
    pub sum_cor: Array2<f64>,
}

/// Integrate `counts[det, pixel, channel]` over every ROI window.
///
/// Corrected values scale each detector's integral by its own `dtfactor`;
/// sum columns add the detector columns.
#[must_use]
pub fn integrate_rois(
    counts: ArrayView3<'_, u32>,
    dtfactor: ArrayView2<'_, f64>,
    table: &RoiTable,
) -> RoiSums {
    let (ndet, npix, _) = counts.dim();
    let nroi = table.len();
    let mut det_raw = Array2::<f64>::zeros((npix, nroi * ndet));
    let mut det_cor = Array2::<f64>::zeros((npix, nroi * ndet));
    let mut sum_raw = Array2::<f64>::zeros((npix, nroi));
    let mut sum_cor = Array2::<f64>::zeros((npix, nroi));

    for (iroi, windows) in table.windows.iter().enumerate() {
        for (det, &[left, right]) in windows.iter().enumerate().take(ndet) {
            let col = iroi * ndet + det;
            let band = counts.slice(s![det, .., left..right]);
            for (pix, lane) in band.outer_iter().enumerate() {
                let raw = lane.iter().map(|&c| f64::from(c)).sum::<f64>();
                let cor = raw * dtfactor[[det, pix]];
                det_raw[[pix, col]] = raw;
                det_cor[[pix, col]] = cor;
                sum_raw[[pix, iroi]] += raw;
                sum_cor[[pix, iroi]] += cor;
            }
        }
    }

    RoiSums {
        det_raw,
        det_cor,
        sum_raw,
        sum_cor,
    }
}
