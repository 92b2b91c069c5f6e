//! Dead-time correction factors and the synthetic sum detector.

use ndarray::{Array1, Array2, ArrayView2, ArrayView3, Axis, Zip};

/// Dead-time correction factor for one detector pixel.
///
/// `(input/livetime) / (output/livetime) * (realtime/livetime)` when both
/// count totals are positive, `realtime/livetime` when either is not, and
/// exactly `1.0` when either time is non-positive or the result is not finite.
#[must_use]
pub fn dtfactor(realtime: f64, livetime: f64, input_counts: f64, output_counts: f64) -> f64 {
    if realtime.is_nan() || livetime.is_nan() || realtime <= 0.0 || livetime <= 0.0 {
        return 1.0;
    }
    let time_ratio = realtime / livetime;
    let factor = if input_counts > 0.0 && output_counts > 0.0 {
        (input_counts / livetime) / (output_counts / livetime) * time_ratio
    } else {
        time_ratio
    };
    if factor.is_finite() {
        factor
    } else {
        1.0
    }
}

/// Per-pixel factors for `[detector, pixel]` arrays.
#[must_use]
pub fn correction_factors(
    realtime: ArrayView2<'_, f64>,
    livetime: ArrayView2<'_, f64>,
    input_counts: ArrayView2<'_, f64>,
    output_counts: ArrayView2<'_, f64>,
) -> Array2<f64> {
    Zip::from(realtime)
        .and(livetime)
        .and(input_counts)
        .and(output_counts)
        .map_collect(|&rt, &lt, &icr, &ocr| dtfactor(rt, lt, icr, ocr))
}

/// Row data for the synthetic sum detector, indexed by pixel.
#[derive(Clone, Debug)]
pub struct SumDetector {
    /// Raw counts summed over detectors, `[pixel, channel]`.
    pub counts: Array2<u32>,
    /// Count-weighted mean of detector factors.
    pub dtfactor: Array1<f64>,
    /// Mean real time over detectors.
    pub realtime: Array1<f64>,
    /// Mean live time over detectors.
    pub livetime: Array1<f64>,
    pub input_counts: Array1<f64>,
    pub output_counts: Array1<f64>,
}

/// Combine per-detector arrays into the sum detector.
///
/// The factor is weighted so that `sum(counts) * dtfactor` of the sum
/// detector equals the sum over detectors of `sum(counts) * dtfactor`.
/// Pixels with no counts get a factor of `1.0`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn sum_detectors(
    counts: ArrayView3<'_, u32>,
    dtfactors: ArrayView2<'_, f64>,
    realtime: ArrayView2<'_, f64>,
    livetime: ArrayView2<'_, f64>,
    input_counts: ArrayView2<'_, f64>,
    output_counts: ArrayView2<'_, f64>,
) -> SumDetector {
    let (ndet, npix, nchan) = counts.dim();
    let mut total = Array2::<u32>::zeros((npix, nchan));
    let mut weighted = Array1::<f64>::zeros(npix);
    let mut denom = Array1::<f64>::zeros(npix);

    for det in 0..ndet {
        let cube = counts.index_axis(Axis(0), det);
        for (pix, spectrum) in cube.outer_iter().enumerate() {
            let mut pixel_total = 0u64;
            for (acc, &c) in total.row_mut(pix).iter_mut().zip(spectrum.iter()) {
                *acc = acc.saturating_add(c);
                pixel_total += u64::from(c);
            }
            let pixel_total = pixel_total as f64;
            weighted[pix] += pixel_total * dtfactors[[det, pix]];
            denom[pix] += pixel_total;
        }
    }

    let dtfactor = Zip::from(&weighted)
        .and(&denom)
        .map_collect(|&w, &d| if d > 0.0 { w / d } else { 1.0 });

    let n = ndet.max(1) as f64;
    SumDetector {
        counts: total,
        dtfactor,
        realtime: realtime.sum_axis(Axis(0)) / n,
        livetime: livetime.sum_axis(Axis(0)) / n,
        input_counts: input_counts.sum_axis(Axis(0)),
        output_counts: output_counts.sum_axis(Axis(0)),
    }
}
