//! Nadaraya-Watson smoothing with a normal kernel

use std::cmp::Ordering;

use rayon::prelude::*;

/// Kernel sd per unit bandwidth: quartiles of the kernel at +-0.25 * bandwidth
pub const KERNEL_SD_SCALE: f64 = 0.3706506;

/// Kernel support in units of sd
const SUPPORT_SDS: f64 = 4.0;

/// Training points sorted by x
#[derive(Debug, Clone)]
pub struct KernelSmoother {
    x: Vec<f64>,
    y: Vec<f64>,
    sd: f64,
}

impl KernelSmoother {
    /// Pairs with a non-finite coordinate are dropped. `None` when no pair
    /// remains or the bandwidth is not positive.
    pub fn new(x: &[f64], y: &[f64], bandwidth: f64) -> Option<Self> {
        if !(bandwidth > 0.0) || !bandwidth.is_finite() {
            return None;
        }
        let mut pairs: Vec<(f64, f64)> = x
            .iter()
            .zip(y.iter())
            .filter(|(a, b)| a.is_finite() && b.is_finite())
            .map(|(&a, &b)| (a, b))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
        let (x, y) = pairs.into_iter().unzip();
        Some(Self {
            x,
            y,
            sd: KERNEL_SD_SCALE * bandwidth,
        })
    }

    pub fn range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    /// Smoothed value at `x0`, clamped into the training range. NaN for a
    /// non-finite `x0`.
    pub fn eval(&self, x0: f64) -> f64 {
        if !x0.is_finite() {
            return f64::NAN;
        }
        let (lo, hi) = self.range();
        let x0 = x0.clamp(lo, hi);
        let cutoff = SUPPORT_SDS * self.sd;

        let start = self.x.partition_point(|&v| v <= x0 - cutoff);
        let end = self.x.partition_point(|&v| v < x0 + cutoff);

        let mut num = 0.0;
        let mut den = 0.0;
        for i in start..end {
            let d = (self.x[i] - x0) / self.sd;
            let w = (-0.5 * d * d).exp();
            num += w * self.y[i];
            den += w;
        }
        if den > 0.0 {
            num / den
        } else {
            self.y[self.nearest(x0)]
        }
    }

    /// Evaluate at many points in parallel
    pub fn eval_many(&self, points: &[f64]) -> Vec<f64> {
        points.par_iter().map(|&p| self.eval(p)).collect()
    }

    fn nearest(&self, x0: f64) -> usize {
        let pos = self.x.partition_point(|&v| v < x0);
        if pos == 0 {
            0
        } else if pos == self.x.len() {
            self.x.len() - 1
        } else if (self.x[pos] - x0).abs() < (x0 - self.x[pos - 1]).abs() {
            pos
        } else {
            pos - 1
        }
    }
}
