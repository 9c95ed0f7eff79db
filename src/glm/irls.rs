//! Two-coefficient GLM fitting using Iteratively Reweighted Least Squares (IRLS)
//!
//! Every per-gene regression in this crate has the design `[1, x]` where `x` is
//! the cell covariate, so the weighted normal equations are a 2x2 system solved
//! in closed form.

use super::negative_binomial::{mean_from_eta, nb_unit_deviance, nb_weight, poisson_unit_deviance};

/// Error family with log link
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlmFamily {
    Poisson,
    /// Negative binomial with theta held fixed
    NegativeBinomial { theta: f64 },
}

impl GlmFamily {
    fn weight(&self, mu: f64) -> f64 {
        match *self {
            GlmFamily::Poisson => mu,
            GlmFamily::NegativeBinomial { theta } => nb_weight(mu, theta),
        }
    }

    fn unit_deviance(&self, y: f64, mu: f64) -> f64 {
        match *self {
            GlmFamily::Poisson => poisson_unit_deviance(y, mu),
            GlmFamily::NegativeBinomial { theta } => nb_unit_deviance(y, mu, theta),
        }
    }
}

/// Configurable parameters for IRLS
#[derive(Debug, Clone, Copy)]
pub struct IrlsParams {
    /// Maximum IRLS iterations
    pub maxit: usize,
    /// Relative deviance tolerance
    pub tol: f64,
}

impl Default for IrlsParams {
    fn default() -> Self {
        Self {
            maxit: 25,
            tol: 1e-8,
        }
    }
}

impl IrlsParams {
    /// Looser tolerance and a larger iteration budget for a retry
    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            maxit: self.maxit * 2,
            tol: self.tol * factor,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IrlsFit {
    pub intercept: f64,
    pub slope: f64,
    /// Fitted means per cell
    pub mu: Vec<f64>,
    pub deviance: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Solve the weighted least squares problem `z ~ b0 + b1 x` with weights `w`.
/// Returns None when the weighted design is singular.
pub fn weighted_least_squares(x: &[f64], z: &[f64], w: &[f64]) -> Option<(f64, f64)> {
    let mut sum_w = 0.0_f64;
    let mut sum_wx = 0.0_f64;
    let mut sum_wz = 0.0_f64;
    let mut sum_wxx = 0.0_f64;
    let mut sum_wxz = 0.0_f64;

    for ((&xi, &zi), &wi) in x.iter().zip(z.iter()).zip(w.iter()) {
        sum_w += wi;
        sum_wx += wi * xi;
        sum_wz += wi * zi;
        sum_wxx += wi * xi * xi;
        sum_wxz += wi * xi * zi;
    }

    let det = sum_w * sum_wxx - sum_wx * sum_wx;
    if !det.is_finite() || det.abs() <= 1e-12 * sum_w.abs().max(1.0) * sum_wxx.abs().max(1.0) {
        return None;
    }

    let b0 = (sum_wxx * sum_wz - sum_wx * sum_wxz) / det;
    let b1 = (sum_w * sum_wxz - sum_wx * sum_wz) / det;
    if b0.is_finite() && b1.is_finite() {
        Some((b0, b1))
    } else {
        None
    }
}

/// Ordinary least squares `z ~ b0 + b1 x`
pub fn least_squares(x: &[f64], z: &[f64]) -> Option<(f64, f64)> {
    let ones = vec![1.0; x.len()];
    weighted_least_squares(x, z, &ones)
}

fn fitted_means(x: &[f64], b0: f64, b1: f64, mu: &mut [f64]) {
    for (m, &xi) in mu.iter_mut().zip(x.iter()) {
        *m = mean_from_eta(b0 + b1 * xi);
    }
}

/// Fit `ln E[y] = b0 + b1 x` by IRLS.
///
/// Without a start the iteration begins from `mu = y + 0.1`. Convergence is
/// declared when `|dev - dev_old| / (|dev| + 0.1) < tol`.
pub fn fit_irls(
    y: &[f64],
    x: &[f64],
    family: GlmFamily,
    start: Option<(f64, f64)>,
    params: &IrlsParams,
) -> IrlsFit {
    let n = y.len();
    let mut mu = vec![0.0; n];
    let mut eta = vec![0.0; n];
    let (mut b0, mut b1) = (f64::NAN, f64::NAN);

    match start {
        Some((s0, s1)) if s0.is_finite() && s1.is_finite() => {
            b0 = s0;
            b1 = s1;
            fitted_means(x, b0, b1, &mut mu);
            for i in 0..n {
                eta[i] = b0 + b1 * x[i];
            }
        }
        _ => {
            for i in 0..n {
                mu[i] = y[i] + 0.1;
                eta[i] = mu[i].ln();
            }
        }
    }

    let mut dev_old: f64 = y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| family.unit_deviance(yi, mi))
        .sum();

    let mut z = vec![0.0; n];
    let mut w = vec![0.0; n];
    let mut converged = false;
    let mut iterations = 0;
    let mut dev = dev_old;

    for iter in 0..params.maxit {
        iterations = iter + 1;

        for i in 0..n {
            let m = mu[i].max(1e-300);
            z[i] = eta[i] + (y[i] - m) / m;
            w[i] = family.weight(m);
        }

        let Some((nb0, nb1)) = weighted_least_squares(x, &z, &w) else {
            break;
        };

        fitted_means(x, nb0, nb1, &mut mu);
        dev = y
            .iter()
            .zip(mu.iter())
            .map(|(&yi, &mi)| family.unit_deviance(yi, mi))
            .sum();
        if !dev.is_finite() {
            break;
        }

        b0 = nb0;
        b1 = nb1;
        for i in 0..n {
            eta[i] = b0 + b1 * x[i];
        }

        let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
        if conv_test < params.tol {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    if b0.is_finite() && b1.is_finite() {
        fitted_means(x, b0, b1, &mut mu);
    } else {
        converged = false;
    }

    IrlsFit {
        intercept: b0,
        slope: b1,
        mu,
        deviance: dev,
        iterations,
        converged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_least_squares_exact_line() {
        let x = vec![0.0, 1.0, 2.0, 3.0];
        let z: Vec<f64> = x.iter().map(|v| 1.5 + 2.0 * v).collect();
        let w = vec![1.0, 2.0, 0.5, 1.0];
        let (b0, b1) = weighted_least_squares(&x, &z, &w).unwrap();
        assert!((b0 - 1.5).abs() < 1e-10);
        assert!((b1 - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_singular_design() {
        let x = vec![1.0, 1.0, 1.0];
        let z = vec![1.0, 2.0, 3.0];
        assert!(least_squares(&x, &z).is_none());
    }

    #[test]
    fn test_poisson_irls_recovers_noise_free_curve() {
        let x: Vec<f64> = (0..50).map(|i| 1.0 + i as f64 / 25.0).collect();
        let y: Vec<f64> = x.iter().map(|v| (0.5 + 1.2 * v).exp()).collect();
        let fit = fit_irls(&y, &x, GlmFamily::Poisson, None, &IrlsParams::default());
        assert!(fit.converged);
        assert!((fit.intercept - 0.5).abs() < 1e-6, "b0 = {}", fit.intercept);
        assert!((fit.slope - 1.2).abs() < 1e-6, "b1 = {}", fit.slope);
    }

    #[test]
    fn test_nb_irls_with_start() {
        let x: Vec<f64> = (0..40).map(|i| i as f64 / 20.0).collect();
        let y: Vec<f64> = x.iter().map(|v| (1.0 + 0.7 * v).exp().round()).collect();
        let poisson = fit_irls(&y, &x, GlmFamily::Poisson, None, &IrlsParams::default());
        let nb = fit_irls(
            &y,
            &x,
            GlmFamily::NegativeBinomial { theta: 10.0 },
            Some((poisson.intercept, poisson.slope)),
            &IrlsParams::default(),
        );
        assert!(nb.converged);
        assert!((nb.intercept - 1.0).abs() < 0.1);
        assert!((nb.slope - 0.7).abs() < 0.1);
    }

    #[test]
    fn test_relaxed_params() {
        let p = IrlsParams::default().relaxed(1e3);
        assert_eq!(p.maxit, 50);
        assert!((p.tol - 1e-5).abs() < 1e-18);
    }
}
