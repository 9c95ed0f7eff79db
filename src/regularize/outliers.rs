//! Binned robust z-scores for excluding outlying raw parameters

use crate::stats::{median, MAD_CONSTANT};

/// Robust z-score of each value within its bin of `x`, bins of `width`
/// starting at `start`
fn robust_scale_binned(y: &[f64], x: &[f64], start: f64, width: f64) -> Vec<f64> {
    let bin_of = |v: f64| ((v - start) / width).floor() as i64;
    let mut scores = vec![0.0; y.len()];

    let mut order: Vec<usize> = (0..y.len()).collect();
    order.sort_by_key(|&i| bin_of(x[i]));

    let mut lo = 0;
    while lo < order.len() {
        let bin = bin_of(x[order[lo]]);
        let mut hi = lo;
        while hi < order.len() && bin_of(x[order[hi]]) == bin {
            hi += 1;
        }
        let members = &order[lo..hi];
        let values: Vec<f64> = members.iter().map(|&i| y[i]).collect();
        let center = median(&values);
        let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        let scale = MAD_CONSTANT * median(&deviations) + f64::EPSILON;
        for &i in members {
            scores[i] = (y[i] - center) / scale;
        }
        lo = hi;
    }
    scores
}

/// Flag values whose robust z-score exceeds `threshold` on both of two bin
/// grids offset by half a bin. The bin width is `(max(x) - min(x)) * bw / 2`.
pub fn is_outlier(y: &[f64], x: &[f64], bw: f64, threshold: f64) -> Vec<bool> {
    if y.len() < 3 {
        return vec![false; y.len()];
    }
    let min = x.iter().copied().fold(f64::INFINITY, f64::min);
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let width = (max - min) * bw / 2.0;
    if !(width > 0.0) || !width.is_finite() {
        return vec![false; y.len()];
    }

    let eps = f64::EPSILON * 10.0;
    let s1 = robust_scale_binned(y, x, min - eps, width);
    let s2 = robust_scale_binned(y, x, min - eps - width / 2.0, width);
    s1.iter()
        .zip(s2.iter())
        .map(|(a, b)| a.abs().min(b.abs()) > threshold)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_spike_is_flagged() {
        let x: Vec<f64> = (0..100).map(|i| i as f64 / 10.0).collect();
        let mut y: Vec<f64> = x.iter().map(|v| 0.5 * v + 0.01 * ((v * 7.0).sin())).collect();
        y[42] = 100.0;
        let flags = is_outlier(&y, &x, 0.5, 10.0);
        assert!(flags[42]);
        assert_eq!(flags.iter().filter(|&&f| f).count(), 1);
    }

    #[test]
    fn test_no_outliers_in_smooth_data() {
        let x: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let y: Vec<f64> = x.iter().map(|v| v.sqrt()).collect();
        assert!(is_outlier(&y, &x, 0.3, 10.0).iter().all(|&f| !f));
    }

    #[test]
    fn test_constant_x_disables_removal() {
        let y = vec![1.0, 2.0, 300.0];
        let x = vec![1.0; 3];
        assert!(is_outlier(&y, &x, 1.0, 10.0).iter().all(|&f| !f));
    }
}
