//! Validated per-row instrument records.

use crate::{Error, Result};
use ndarray::{Array2, Array3};

/// Raw arrays for one scan row, as produced by the per-row file readers.
///
/// Sample counts of `gather`, `scalers` and `frames` may differ from the
/// detector pixel count; they are reconciled when the row is prepared.
#[derive(Clone, Debug)]
pub struct RowParts {
    /// Detector counts, `[detector, pixel, channel]`.
    pub counts: Array3<u32>,
    /// Real time in seconds, `[detector, pixel]`.
    pub realtime: Array2<f64>,
    /// Live time in seconds, `[detector, pixel]`.
    pub livetime: Array2<f64>,
    /// Input (trigger) counts, `[detector, pixel]`.
    pub input_counts: Array2<f64>,
    /// Output (processed) counts, `[detector, pixel]`.
    pub output_counts: Array2<f64>,
    /// Motion-controller gather samples, `[sample, column]`.
    pub gather: Array2<f64>,
    /// Slow-axis coordinate for this row.
    pub y_value: f64,
    pub scaler_names: Vec<String>,
    /// Scaler values, `[sample, scaler]`.
    pub scalers: Array2<f64>,
    /// Optional diffraction frames, `[frame, height, width]`.
    pub frames: Option<Array3<u32>>,
}

/// A row whose arrays are known to be mutually consistent.
#[derive(Clone, Debug)]
pub struct RowRecord {
    parts: RowParts,
}

impl RowRecord {
    /// Validate raw row arrays.
    ///
    /// # Errors
    /// Returns `InvalidShape` if the counts cube is empty, per-detector time
    /// arrays disagree with it, the gather has no samples, scaler columns do
    /// not match their names, or frames are empty.
    pub fn new(parts: RowParts) -> Result<Self> {
        let (ndet, npix, nchan) = parts.counts.dim();
        if ndet == 0 || npix == 0 || nchan == 0 {
            return Err(Error::InvalidShape(format!(
                "counts cube must be non-empty, got ({ndet}, {npix}, {nchan})"
            )));
        }
        for (label, arr) in [
            ("realtime", &parts.realtime),
            ("livetime", &parts.livetime),
            ("input_counts", &parts.input_counts),
            ("output_counts", &parts.output_counts),
        ] {
            if arr.dim() != (ndet, npix) {
                return Err(Error::InvalidShape(format!(
                    "{label} shape {:?} does not match ({ndet}, {npix})",
                    arr.dim()
                )));
            }
        }
        let (ngather, ncols) = parts.gather.dim();
        if ngather == 0 || ncols == 0 {
            return Err(Error::InvalidShape(
                "gather data has no samples".to_string(),
            ));
        }
        let (nscal, scol) = parts.scalers.dim();
        if scol != parts.scaler_names.len() {
            return Err(Error::InvalidShape(format!(
                "{} scaler names for {scol} scaler columns",
                parts.scaler_names.len()
            )));
        }
        if scol > 0 && nscal == 0 {
            return Err(Error::InvalidShape(
                "scaler data has no samples".to_string(),
            ));
        }
        if let Some(frames) = &parts.frames {
            let (nf, h, w) = frames.dim();
            if nf == 0 || h == 0 || w == 0 {
                return Err(Error::InvalidShape(format!(
                    "frames must be non-empty, got ({nf}, {h}, {w})"
                )));
            }
        }
        Ok(Self { parts })
    }

    #[must_use]
    pub fn n_detectors(&self) -> usize {
        self.parts.counts.dim().0
    }

    /// Pixels in the detector cube.
    #[must_use]
    pub fn n_pixels(&self) -> usize {
        self.parts.counts.dim().1
    }

    #[must_use]
    pub fn n_channels(&self) -> usize {
        self.parts.counts.dim().2
    }

    /// Frame `(height, width)` when diffraction frames are present.
    #[must_use]
    pub fn frame_shape(&self) -> Option<(usize, usize)> {
        self.parts.frames.as_ref().map(|f| (f.dim().1, f.dim().2))
    }

    #[must_use]
    pub fn scaler_names(&self) -> &[String] {
        &self.parts.scaler_names
    }

    #[must_use]
    pub fn parts(&self) -> &RowParts {
        &self.parts
    }

    /// Consume the record, returning its arrays.
    #[must_use]
    pub fn into_parts(self) -> RowParts {
        self.parts
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small, consistent row for unit tests.
    pub(crate) fn sample_parts(ndet: usize, npix: usize, nchan: usize) -> RowParts {
        let counts = Array3::from_shape_fn((ndet, npix, nchan), |(d, p, c)| {
            u32::try_from(d + p + c).unwrap()
        });
        let gather = Array2::from_shape_fn((npix, 2), |(p, c)| {
            if c == 0 {
                f64::from(u32::try_from(p).unwrap()) * 0.1
            } else {
                5.0
            }
        });
        RowParts {
            counts,
            realtime: Array2::from_elem((ndet, npix), 1.0),
            livetime: Array2::from_elem((ndet, npix), 0.8),
            input_counts: Array2::from_elem((ndet, npix), 1000.0),
            output_counts: Array2::from_elem((ndet, npix), 900.0),
            gather,
            y_value: 0.25,
            scaler_names: vec!["I0".to_string()],
            scalers: Array2::from_elem((npix, 1), 7.0),
            frames: None,
        }
    }

    #[test]
    fn test_row_record_accepts_consistent_parts() {
        let row = RowRecord::new(sample_parts(2, 5, 16)).unwrap();
        assert_eq!(row.n_detectors(), 2);
        assert_eq!(row.n_pixels(), 5);
        assert_eq!(row.n_channels(), 16);
        assert_eq!(row.frame_shape(), None);
    }

    #[test]
    fn test_row_record_rejects_time_mismatch() {
        let mut parts = sample_parts(2, 5, 16);
        parts.livetime = Array2::from_elem((2, 4), 0.8);
        assert!(matches!(RowRecord::new(parts), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_row_record_rejects_empty_cube_and_scaler_names() {
        let mut parts = sample_parts(1, 5, 16);
        parts.counts = Array3::zeros((1, 5, 0));
        assert!(matches!(RowRecord::new(parts), Err(Error::InvalidShape(_))));

        let mut parts = sample_parts(1, 5, 16);
        parts.scaler_names.push("I1".to_string());
        assert!(matches!(RowRecord::new(parts), Err(Error::InvalidShape(_))));
    }

    #[test]
    fn test_row_record_frames() {
        let mut parts = sample_parts(1, 3, 4);
        parts.frames = Some(Array3::zeros((3, 2, 6)));
        let row = RowRecord::new(parts).unwrap();
        assert_eq!(row.frame_shape(), Some((2, 6)));
    }
}
