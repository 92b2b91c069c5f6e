//! Region queries: summed spectra, diffraction frames, timing and ROI maps.
//!
//! Every query clamps its rectangle to the ingested rows and reads the
//! container in bounded chunks, so memory use does not depend on the size
//! of the selection.

use crate::areas::{Area, AreaStore};
use crate::container::ContainerHandle;
use crate::h5util::{read_attr_opt, read_strings, required_group};
use crate::schema::SUM_DETECTOR;
use crate::{Error, Result};
use hdf5::Group;
use log::debug;
use ndarray::{s, Array1, Array2, ArrayView2, Ix2, Ix3, Ix4, Zip};
use std::fmt;
use std::str::FromStr;
use xrmmap_core::{
    Calibration, FrameSum, LiveRealTime, Provenance, Rect, Spectrum, SpectrumRoi,
    DEFAULT_CHUNK_PIXELS,
};

/// Chunk budgets for region traversal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryOptions {
    /// Pixels per spectrum chunk.
    pub chunk_pixels: usize,
    /// Pixels per diffraction-frame chunk.
    pub frame_chunk_pixels: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            chunk_pixels: DEFAULT_CHUNK_PIXELS,
            frame_chunk_pixels: 64,
        }
    }
}

/// Detector selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Detector {
    /// The synthetic sum detector.
    Sum,
    /// Physical detector, 0-based (`Index(0)` is `mca1`).
    Index(usize),
}

impl Detector {
    /// HDF5 group name.
    #[must_use]
    pub fn group_name(&self) -> String {
        match self {
            Self::Sum => SUM_DETECTOR.to_string(),
            Self::Index(k) => format!("mca{}", k + 1),
        }
    }
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.group_name())
    }
}

impl FromStr for Detector {
    type Err = Error;

    /// Accepts `mcasum`/`sum`, a group name like `mca2`, or a 1-based
    /// number.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(SUM_DETECTOR) || s.eq_ignore_ascii_case("sum") {
            return Ok(Self::Sum);
        }
        let digits = s.strip_prefix("mca").unwrap_or(s);
        match digits.parse::<usize>() {
            Ok(k) if k >= 1 => Ok(Self::Index(k - 1)),
            _ => Err(Error::NotFound(format!("detector '{s}'"))),
        }
    }
}

/// A selection: explicit rectangle or stored area (by name or
/// description).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Region {
    Rect(Rect),
    Area(String),
}

impl From<Rect> for Region {
    fn from(rect: Rect) -> Self {
        Self::Rect(rect)
    }
}

/// Read-only query surface over a container.
pub struct AggregationEngine<'a> {
    handle: &'a ContainerHandle,
    options: QueryOptions,
}

impl<'a> AggregationEngine<'a> {
    #[must_use]
    pub fn new(handle: &'a ContainerHandle) -> Self {
        Self {
            handle,
            options: QueryOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    fn detector_group(&self, detector: Detector) -> Result<Group> {
        if !self.handle.schema_built() {
            return Err(Error::SchemaMissing);
        }
        let name = detector.group_name();
        if !self.handle.root().link_exists(&name) {
            return Err(Error::NotFound(format!("detector '{name}'")));
        }
        Ok(self.handle.root().group(&name)?)
    }

    fn pixels(&self) -> Result<usize> {
        let root = self.handle.root();
        let npts: i64 = read_attr_opt(root, "npts")?.ok_or(Error::SchemaMissing)?;
        Ok(usize::try_from(npts).unwrap_or(0))
    }

    /// Clamp to the ingested grid; `EmptySelection` if nothing remains.
    fn clamp(&self, rect: Rect) -> Result<Rect> {
        let clamped = rect.clamp(self.handle.rows()?, self.pixels()?);
        if clamped.is_empty() {
            return Err(Error::EmptySelection(rect.to_string()));
        }
        Ok(clamped)
    }

    fn area(&self, name: &str) -> Result<(Area, Rect)> {
        let area = AreaStore::new(self.handle).get_area(name)?;
        let rows = self.handle.rows()?;
        let rect = area
            .bounds(rows)
            .ok_or_else(|| Error::EmptySelection(format!("area '{}'", area.name)))?;
        Ok((area, rect))
    }

    fn provenance(&self, detector: Detector, region: String) -> Provenance {
        Provenance {
            filename: self.handle.filename(),
            detector: detector.group_name(),
            region,
        }
    }

    /// Summed spectrum over a rectangle or area.
    ///
    /// # Errors
    /// As [`Self::spectrum_for_rect`] and [`Self::spectrum_for_area`].
    pub fn get_spectrum(
        &self,
        region: &Region,
        detector: Detector,
        dt_correct: bool,
    ) -> Result<Spectrum> {
        match region {
            Region::Rect(rect) => self.spectrum_for_rect(*rect, detector, dt_correct),
            Region::Area(name) => self.spectrum_for_area(name, detector, dt_correct),
        }
    }

    /// Summed diffraction frame over a rectangle or area.
    ///
    /// # Errors
    /// As [`Self::frames_for_rect`] and [`Self::frames_for_area`].
    pub fn get_frames(&self, region: &Region) -> Result<FrameSum> {
        match region {
            Region::Rect(rect) => self.frames_for_rect(*rect),
            Region::Area(name) => self.frames_for_area(name),
        }
    }

    /// Summed spectrum over a rectangle.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown detector, `EmptySelection` when
    /// the clamped rectangle is empty, or an HDF5 error.
    pub fn spectrum_for_rect(
        &self,
        rect: Rect,
        detector: Detector,
        dt_correct: bool,
    ) -> Result<Spectrum> {
        let group = self.detector_group(detector)?;
        let rect = self.clamp(rect)?;
        self.spectrum(&group, detector, rect, None, dt_correct, rect.to_string())
    }

    /// Summed spectrum over a stored area.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown area or detector, `EmptySelection`
    /// when the area covers no ingested pixel, or an HDF5 error.
    pub fn spectrum_for_area(
        &self,
        name: &str,
        detector: Detector,
        dt_correct: bool,
    ) -> Result<Spectrum> {
        let group = self.detector_group(detector)?;
        let (area, rect) = self.area(name)?;
        let rows = self.handle.rows()?;
        let region = format!("area '{}'", area.name);
        self.spectrum(
            &group,
            detector,
            rect,
            Some(area.clipped(rows)),
            dt_correct,
            region,
        )
    }

    fn spectrum(
        &self,
        group: &Group,
        detector: Detector,
        rect: Rect,
        mask: Option<ArrayView2<'_, bool>>,
        dt_correct: bool,
        region: String,
    ) -> Result<Spectrum> {
        let counts_ds = group.dataset("counts")?;
        let nchan = counts_ds.shape().get(2).copied().unwrap_or(0);
        let mut total = Array1::<f64>::zeros(nchan);
        let mut npixels = 0;
        let mut real_time = 0.0;
        let mut live_time = 0.0;

        for chunk in rect.chunks(self.options.chunk_pixels) {
            let (rows, cols) = (chunk.y0..chunk.y1, chunk.x0..chunk.x1);
            let counts = counts_ds
                .read_slice::<u32, _, Ix3>(s![chunk.y0..chunk.y1, chunk.x0..chunk.x1, ..])?;
            let dtf = if dt_correct {
                Some(
                    group
                        .dataset("dtfactor")?
                        .read_slice::<f32, _, Ix2>(s![rows.clone(), cols.clone()])?,
                )
            } else {
                None
            };
            let rt = group
                .dataset("realtime")?
                .read_slice::<f64, _, Ix2>(s![rows.clone(), cols.clone()])?;
            let lt = group
                .dataset("livetime")?
                .read_slice::<f64, _, Ix2>(s![rows, cols])?;

            for i in 0..chunk.rows() {
                for j in 0..chunk.cols() {
                    if let Some(m) = &mask {
                        if !m[[chunk.y0 + i, chunk.x0 + j]] {
                            continue;
                        }
                    }
                    let weight = dtf.as_ref().map_or(1.0, |d| f64::from(d[[i, j]]));
                    Zip::from(&mut total)
                        .and(counts.slice(s![i, j, ..]))
                        .for_each(|t, &c| *t += weight * f64::from(c));
                    npixels += 1;
                    real_time += rt[[i, j]];
                    live_time += lt[[i, j]];
                }
            }
        }
        if npixels == 0 {
            return Err(Error::EmptySelection(region));
        }
        debug!("summed {npixels} pixels of {detector} over {region}");

        let calibration = read_calibration(group)?;
        Ok(Spectrum {
            counts: total,
            energy: calibration.energy(nchan),
            calibration,
            rois: read_rois(group)?,
            npixels,
            real_time,
            live_time,
            dead_time_corrected: dt_correct,
            provenance: self.provenance(detector, region),
        })
    }

    /// Summed diffraction frame over a rectangle.
    ///
    /// # Errors
    /// Returns `NotFound` when the container holds no frames, or
    /// `EmptySelection` for an empty clamped rectangle.
    pub fn frames_for_rect(&self, rect: Rect) -> Result<FrameSum> {
        let rect = self.clamp(rect)?;
        self.frames(rect, None, rect.to_string())
    }

    /// Summed diffraction frame over a stored area.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown area or when the container holds
    /// no frames, or `EmptySelection`.
    pub fn frames_for_area(&self, name: &str) -> Result<FrameSum> {
        let (area, rect) = self.area(name)?;
        let rows = self.handle.rows()?;
        let region = format!("area '{}'", area.name);
        self.frames(rect, Some(area.clipped(rows)), region)
    }

    fn frames(
        &self,
        rect: Rect,
        mask: Option<ArrayView2<'_, bool>>,
        region: String,
    ) -> Result<FrameSum> {
        let root = self.handle.root();
        if !root.link_exists("xrd2d") {
            return Err(Error::NotFound("diffraction frames".to_string()));
        }
        let frames_ds = root.group("xrd2d")?.dataset("frames")?;
        let shape = frames_ds.shape();
        let mut total = Array2::<f64>::zeros((shape[2], shape[3]));
        let mut npixels = 0;

        for chunk in rect.chunks(self.options.frame_chunk_pixels) {
            let frames = frames_ds
                .read_slice::<u32, _, Ix4>(s![chunk.y0..chunk.y1, chunk.x0..chunk.x1, .., ..])?;
            for i in 0..chunk.rows() {
                for j in 0..chunk.cols() {
                    if mask.as_ref().is_some_and(|m| !m[[chunk.y0 + i, chunk.x0 + j]]) {
                        continue;
                    }
                    Zip::from(&mut total)
                        .and(frames.slice(s![i, j, .., ..]))
                        .for_each(|t, &c| *t += f64::from(c));
                    npixels += 1;
                }
            }
        }
        if npixels == 0 {
            return Err(Error::EmptySelection(region));
        }
        Ok(FrameSum {
            frame: total,
            npixels,
            provenance: Provenance {
                filename: self.handle.filename(),
                detector: "xrd2d".to_string(),
                region,
            },
        })
    }

    /// Summed live and real time over a rectangle.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown detector or `EmptySelection`.
    pub fn live_real_time_for_rect(&self, rect: Rect, detector: Detector) -> Result<LiveRealTime> {
        let group = self.detector_group(detector)?;
        let rect = self.clamp(rect)?;
        self.live_real_time(&group, rect, None, &rect.to_string())
    }

    /// Summed live and real time over a stored area.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown area or detector, or
    /// `EmptySelection`.
    pub fn live_real_time_for_area(&self, name: &str, detector: Detector) -> Result<LiveRealTime> {
        let group = self.detector_group(detector)?;
        let (area, rect) = self.area(name)?;
        let rows = self.handle.rows()?;
        self.live_real_time(
            &group,
            rect,
            Some(area.clipped(rows)),
            &format!("area '{}'", area.name),
        )
    }

    fn live_real_time(
        &self,
        group: &Group,
        rect: Rect,
        mask: Option<ArrayView2<'_, bool>>,
        region: &str,
    ) -> Result<LiveRealTime> {
        let mut out = LiveRealTime::default();
        for chunk in rect.chunks(self.options.chunk_pixels) {
            let rt = group
                .dataset("realtime")?
                .read_slice::<f64, _, Ix2>(s![chunk.y0..chunk.y1, chunk.x0..chunk.x1])?;
            let lt = group
                .dataset("livetime")?
                .read_slice::<f64, _, Ix2>(s![chunk.y0..chunk.y1, chunk.x0..chunk.x1])?;
            for ((i, j), &r) in rt.indexed_iter() {
                if mask.as_ref().is_some_and(|m| !m[[chunk.y0 + i, chunk.x0 + j]]) {
                    continue;
                }
                out.real_time += r;
                out.live_time += lt[[i, j]];
                out.npixels += 1;
            }
        }
        if out.npixels == 0 {
            return Err(Error::EmptySelection(region.to_string()));
        }
        Ok(out)
    }

    /// ROI map over the ingested rows, `[row, pixel]`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown ROI or detector.
    pub fn roi_map(&self, roi: &str, detector: Detector, dt_correct: bool) -> Result<Array2<f64>> {
        self.detector_group(detector)?;
        let roimap = required_group(self.handle.root(), "roimap")?;
        let names = read_strings(&roimap, "sum_name")?;
        let iroi = names
            .iter()
            .position(|n| n == roi)
            .ok_or_else(|| Error::NotFound(format!("ROI '{roi}'")))?;
        let rows = self.handle.rows()?;
        let (dataset, column) = match (detector, dt_correct) {
            (Detector::Sum, false) => ("sum_raw", iroi),
            (Detector::Sum, true) => ("sum_cor", iroi),
            (Detector::Index(k), cor) => {
                let ndet = self.handle.n_detectors()?;
                (if cor { "det_cor" } else { "det_raw" }, iroi * ndet + k)
            }
        };
        if rows == 0 {
            return Ok(Array2::zeros((0, self.pixels()?)));
        }
        Ok(roimap
            .dataset(dataset)?
            .read_slice::<f64, _, Ix2>(s![..rows, .., column])?)
    }

    /// Energy axis of a detector, keV.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown detector.
    pub fn energy(&self, detector: Detector) -> Result<Array1<f64>> {
        Ok(self.detector_group(detector)?.dataset("energy")?.read_1d::<f64>()?)
    }

    /// One position axis over the ingested rows, `[row, pixel]`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown axis name.
    pub fn positions(&self, axis: &str) -> Result<Array2<f64>> {
        if !self.handle.schema_built() {
            return Err(Error::SchemaMissing);
        }
        let group = self.handle.root().group("positions")?;
        let index = read_strings(&group, "name")?
            .iter()
            .position(|n| n == axis)
            .ok_or_else(|| Error::NotFound(format!("position axis '{axis}'")))?;
        let rows = self.handle.rows()?;
        if rows == 0 {
            return Ok(Array2::zeros((0, self.pixels()?)));
        }
        let pos = group
            .dataset("pos")?
            .read_slice::<f32, _, Ix2>(s![..rows, .., index])?;
        Ok(pos.mapv(f64::from))
    }
}

fn read_calibration(group: &Group) -> Result<Calibration> {
    let energy = group.dataset("energy")?;
    let defaults = Calibration::default();
    Ok(Calibration {
        offset: read_attr_opt(&energy, "cal_offset")?.unwrap_or(defaults.offset),
        slope: read_attr_opt(&energy, "cal_slope")?.unwrap_or(defaults.slope),
        quad: read_attr_opt(&energy, "cal_quad")?.unwrap_or(defaults.quad),
    })
}

fn read_rois(group: &Group) -> Result<Vec<SpectrumRoi>> {
    let names = read_strings(group, "roi_name")?;
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let limits = group.dataset("roi_limits")?.read_2d::<u64>()?;
    let to_usize = |v: u64| usize::try_from(v).unwrap_or(usize::MAX);
    Ok(names
        .into_iter()
        .zip(limits.outer_iter())
        .map(|(name, lim)| SpectrumRoi {
            name,
            left: to_usize(lim[0]),
            right: to_usize(lim[1]),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_parsing() {
        assert_eq!("mcasum".parse::<Detector>().unwrap(), Detector::Sum);
        assert_eq!("sum".parse::<Detector>().unwrap(), Detector::Sum);
        assert_eq!("mca2".parse::<Detector>().unwrap(), Detector::Index(1));
        assert_eq!("1".parse::<Detector>().unwrap(), Detector::Index(0));
        assert!(matches!("mca0".parse::<Detector>(), Err(Error::NotFound(_))));
        assert!(matches!("xrd".parse::<Detector>(), Err(Error::NotFound(_))));
        assert_eq!(Detector::Index(3).to_string(), "mca4");
    }

    #[test]
    fn test_default_options() {
        let options = QueryOptions::default();
        assert_eq!(options.chunk_pixels, 16_384);
        assert_eq!(options.frame_chunk_pixels, 64);
    }
}
