//! Row preparation: align sample counts, undo serpentine reversal, derive
//! positions, dead-time factors and sum-detector data.

use crate::deadtime::{correction_factors, sum_detectors, SumDetector};
use crate::row::RowRecord;
use crate::{Error, Result};
use log::{debug, warn};
use ndarray::{concatenate, Array, Array2, Array3, ArrayView, Axis, RemoveAxis, Slice};

/// How a row is mapped onto the container grid.
#[derive(Clone, Copy, Debug)]
pub struct AlignSettings {
    /// Pixels per row fixed by the schema.
    pub pixel_count: usize,
    pub row_index: usize,
    /// Reverse odd rows.
    pub serpentine: bool,
    /// Scan dimension; a slow-axis position is stored for 2-D scans.
    pub dimension: u8,
}

/// A row ready to be appended: every per-pixel array has exactly
/// `pixel_count` entries in increasing fast-axis order.
#[derive(Clone, Debug)]
pub struct PreparedRow {
    pub row_index: usize,
    pub reversed: bool,
    /// `[detector, pixel, channel]`
    pub counts: Array3<u32>,
    /// `[detector, pixel]`
    pub realtime: Array2<f64>,
    pub livetime: Array2<f64>,
    pub input_counts: Array2<f64>,
    pub output_counts: Array2<f64>,
    pub dtfactor: Array2<f64>,
    pub sum: SumDetector,
    /// `[pixel, axis]`: fast, slow (2-D only), mean realtime, mean livetime.
    pub positions: Array2<f64>,
    /// `[pixel, scaler]`
    pub scalers: Array2<f64>,
    /// `[pixel, height, width]`
    pub frames: Option<Array3<u32>>,
}

/// Trim or pad `arr` along `axis` to exactly `n` entries, padding by
/// repeating the final entry.
///
/// # Errors
/// Returns `InvalidShape` if `arr` is empty along `axis` while `n > 0`.
pub fn fit_len<A, D>(arr: ArrayView<'_, A, D>, axis: Axis, n: usize) -> Result<Array<A, D>>
where
    A: Clone,
    D: RemoveAxis,
{
    let len = arr.len_of(axis);
    if len >= n {
        return Ok(arr.slice_axis(axis, Slice::from(..n)).to_owned());
    }
    if len == 0 {
        return Err(Error::InvalidShape(
            "cannot pad an empty array".to_string(),
        ));
    }
    let last = arr.clone().slice_axis_move(axis, Slice::from(len - 1..len));
    let mut views = Vec::with_capacity(1 + n - len);
    views.push(arr);
    views.extend(std::iter::repeat(last).take(n - len));
    concatenate(axis, &views).map_err(|e| Error::InvalidShape(e.to_string()))
}

fn fit_logged<A, D>(
    label: &str,
    row: usize,
    arr: ArrayView<'_, A, D>,
    axis: Axis,
    n: usize,
) -> Result<Array<A, D>>
where
    A: Clone,
    D: RemoveAxis,
{
    let len = arr.len_of(axis);
    if len > n {
        debug!("row {row}: trimming {label} from {len} to {n} samples");
    } else if len < n {
        warn!("row {row}: padding {label} from {len} to {n} samples");
    }
    fit_len(arr, axis, n)
}

fn reversed<A: Clone, D: RemoveAxis>(mut arr: Array<A, D>, axis: Axis) -> Array<A, D> {
    arr.invert_axis(axis);
    arr.as_standard_layout().into_owned()
}

/// Index of the gather column with the largest variance (the fast axis).
#[must_use]
pub fn fast_axis_column(gather: &Array2<f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (idx, column) in gather.axis_iter(Axis(1)).enumerate() {
        let var = column.var(0.0);
        if var > best.1 {
            best = (idx, var);
        }
    }
    best.0
}

/// Align, reverse and correct one row.
///
/// # Errors
/// Returns `InvalidShape` if `pixel_count` is zero.
#[allow(clippy::cast_precision_loss)]
pub fn prepare_row(record: &RowRecord, settings: &AlignSettings) -> Result<PreparedRow> {
    let n = settings.pixel_count;
    let row = settings.row_index;
    if n == 0 {
        return Err(Error::InvalidShape("pixel count is zero".to_string()));
    }
    let parts = record.parts();
    let pix = Axis(1);

    let mut counts = fit_logged("detector counts", row, parts.counts.view(), pix, n)?;
    let mut realtime = fit_logged("realtime", row, parts.realtime.view(), pix, n)?;
    let mut livetime = fit_logged("livetime", row, parts.livetime.view(), pix, n)?;
    let mut input_counts = fit_logged("input counts", row, parts.input_counts.view(), pix, n)?;
    let mut output_counts = fit_logged("output counts", row, parts.output_counts.view(), pix, n)?;
    let mut gather = fit_logged("gather", row, parts.gather.view(), Axis(0), n)?;
    let mut scalers = if parts.scalers.ncols() == 0 {
        Array2::zeros((n, 0))
    } else {
        fit_logged("scalers", row, parts.scalers.view(), Axis(0), n)?
    };
    let mut frames = match &parts.frames {
        Some(f) => Some(fit_logged("frames", row, f.view(), Axis(0), n)?),
        None => None,
    };

    let is_reversed = settings.serpentine && row % 2 == 1;
    if is_reversed {
        debug!("row {row}: reversing serpentine row");
        counts = reversed(counts, pix);
        realtime = reversed(realtime, pix);
        livetime = reversed(livetime, pix);
        input_counts = reversed(input_counts, pix);
        output_counts = reversed(output_counts, pix);
        gather = reversed(gather, Axis(0));
        scalers = reversed(scalers, Axis(0));
        frames = frames.map(|f| reversed(f, Axis(0)));
    }

    let dtfactor = correction_factors(
        realtime.view(),
        livetime.view(),
        input_counts.view(),
        output_counts.view(),
    );
    let sum = sum_detectors(
        counts.view(),
        dtfactor.view(),
        realtime.view(),
        livetime.view(),
        input_counts.view(),
        output_counts.view(),
    );

    let fast = fast_axis_column(&gather);
    let naxes = if settings.dimension == 2 { 4 } else { 3 };
    let mut positions = Array2::<f64>::zeros((n, naxes));
    for p in 0..n {
        let mut col = 0;
        positions[[p, col]] = gather[[p, fast]];
        col += 1;
        if settings.dimension == 2 {
            positions[[p, col]] = parts.y_value;
            col += 1;
        }
        positions[[p, col]] = sum.realtime[p];
        positions[[p, col + 1]] = sum.livetime[p];
    }

    Ok(PreparedRow {
        row_index: row,
        reversed: is_reversed,
        counts,
        realtime,
        livetime,
        input_counts,
        output_counts,
        dtfactor,
        sum,
        positions,
        scalers,
        frames,
    })
}
