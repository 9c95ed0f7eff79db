//! Statistical utility functions shared across modules
//!
//! Sample moments, quantiles, robust scale and bandwidth selection used by the
//! regularizer, the residual summaries and the orchestrator.

use std::cmp::Ordering;

/// Consistency constant making the MAD estimate sigma for normal data
pub const MAD_CONSTANT: f64 = 1.4826;

fn cmp_f64(a: &f64, b: &f64) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

/// Arithmetic mean; NaN for an empty slice
pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

/// Sample variance with n - 1 denominator; NaN with fewer than two values
pub fn sample_variance(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(x);
    x.iter().map(|&v| (v - m) * (v - m)).sum::<f64>() / (n - 1) as f64
}

/// Mean and sample variance over the finite entries only
pub fn finite_mean_variance(x: &[f64]) -> (f64, f64) {
    let finite: Vec<f64> = x.iter().copied().filter(|v| v.is_finite()).collect();
    (mean(&finite), sample_variance(&finite))
}

/// Quantile with linear interpolation between order statistics
/// (`1 + (n - 1) p` positioning). NaN values are dropped.
pub fn quantile(x: &[f64], prob: f64) -> f64 {
    let mut sorted: Vec<f64> = x.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(cmp_f64);
    quantile_sorted(&sorted, prob)
}

fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let h = (n - 1) as f64 * prob.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - lo as f64;
    sorted[lo] + frac * (sorted[hi] - sorted[lo])
}

/// Median (NaN values dropped)
pub fn median(x: &[f64]) -> f64 {
    quantile(x, 0.5)
}

/// Median absolute deviation scaled by [`MAD_CONSTANT`]
pub fn mad(x: &[f64]) -> f64 {
    let m = median(x);
    let dev: Vec<f64> = x.iter().filter(|v| !v.is_nan()).map(|&v| (v - m).abs()).collect();
    MAD_CONSTANT * median(&dev)
}

/// Silverman's rule-of-thumb bandwidth: `0.9 * min(sd, IQR / 1.34) * n^(-1/5)`.
///
/// Falls back to whichever of sd / IQR is positive, then to `|x[0]|`, then 1,
/// so the result is positive whenever the input is non-empty.
pub fn silverman_bandwidth(x: &[f64]) -> f64 {
    let finite: Vec<f64> = x.iter().copied().filter(|v| v.is_finite()).collect();
    let n = finite.len();
    if n < 2 {
        return f64::NAN;
    }
    let sd = sample_variance(&finite).sqrt();
    let iqr = quantile(&finite, 0.75) - quantile(&finite, 0.25);
    let mut lo = sd.min(iqr / 1.34);
    if !(lo > 0.0) {
        lo = if sd > 0.0 {
            sd
        } else if iqr > 0.0 {
            iqr / 1.34
        } else if finite[0].abs() > 0.0 {
            finite[0].abs()
        } else {
            1.0
        };
    }
    0.9 * lo * (n as f64).powf(-0.2)
}
