//! Descriptive statistics for per-pixel values inside an area.

use serde::{Deserialize, Serialize};

/// Summary of one sample of values.
///
/// `std`, `skew` and `kurtosis` are population (biased) moments; `kurtosis`
/// is excess kurtosis. Geometric and harmonic means are 0 unless every
/// value is positive.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub gmean: f64,
    pub hmean: f64,
    pub skew: f64,
    pub kurtosis: f64,
}

impl SummaryStats {
    /// Compute statistics for `values`. An empty sample yields all zeros.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_values(name: impl Into<String>, values: &[f64]) -> Self {
        let name = name.into();
        let count = values.len();
        if count == 0 {
            return Self {
                name,
                ..Self::default()
            };
        }
        let n = count as f64;
        let mean = values.iter().sum::<f64>() / n;
        let (mut m2, mut m3, mut m4) = (0.0, 0.0, 0.0);
        for &v in values {
            let d = v - mean;
            let d2 = d * d;
            m2 += d2;
            m3 += d2 * d;
            m4 += d2 * d2;
        }
        m2 /= n;
        m3 /= n;
        m4 /= n;
        let (skew, kurtosis) = if m2 > 0.0 {
            (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
        } else {
            (0.0, 0.0)
        };

        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let median = if count % 2 == 1 {
            sorted[count / 2]
        } else {
            0.5 * (sorted[count / 2 - 1] + sorted[count / 2])
        };

        let all_positive = sorted[0] > 0.0;
        let gmean = if all_positive {
            (values.iter().map(|v| v.ln()).sum::<f64>() / n).exp()
        } else {
            0.0
        };
        let hmean = if all_positive {
            n / values.iter().map(|v| v.recip()).sum::<f64>()
        } else {
            0.0
        };

        Self {
            name,
            count,
            mean,
            std: m2.sqrt(),
            median,
            min: sorted[0],
            max: sorted[count - 1],
            gmean,
            hmean,
            skew,
            kurtosis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_summary_basic() {
        let s = SummaryStats::from_values("Fe", &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(s.count, 4);
        assert_relative_eq!(s.mean, 2.5);
        assert_relative_eq!(s.median, 2.5);
        assert_relative_eq!(s.std, 1.25_f64.sqrt());
        assert_relative_eq!(s.min, 1.0);
        assert_relative_eq!(s.max, 4.0);
        assert_relative_eq!(s.skew, 0.0, epsilon = 1e-12);
        // uniform-like sample: m4/m2^2 = 2.5625/1.5625
        assert_relative_eq!(s.kurtosis, 2.5625 / 1.5625 - 3.0, epsilon = 1e-12);
        assert_relative_eq!(s.gmean, 24.0_f64.powf(0.25), epsilon = 1e-12);
        assert_relative_eq!(s.hmean, 4.0 / (1.0 + 0.5 + 1.0 / 3.0 + 0.25), epsilon = 1e-12);
    }

    #[test]
    fn test_summary_skewed_and_degenerate() {
        let s = SummaryStats::from_values("x", &[0.0, 0.0, 0.0, 10.0]);
        assert!(s.skew > 0.0);
        assert_relative_eq!(s.gmean, 0.0);
        assert_relative_eq!(s.median, 0.0);

        let flat = SummaryStats::from_values("flat", &[3.0; 5]);
        assert_relative_eq!(flat.std, 0.0);
        assert_relative_eq!(flat.skew, 0.0);

        let empty = SummaryStats::from_values("none", &[]);
        assert_eq!(empty.count, 0);
        assert_eq!(empty.name, "none");
    }
}
