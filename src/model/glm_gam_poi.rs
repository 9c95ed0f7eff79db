//! Gamma-Poisson backend
//!
//! Overdispersion `alpha = 1 / theta` is estimated by maximizing the Cox-Reid
//! adjusted profile log-likelihood over `ln(alpha)` with an Armijo line search,
//! falling back to a two-level grid search when the line search stalls.

use statrs::function::gamma::{digamma, ln_gamma};

use super::{cancelled, CancelToken, FitError, GeneInput, GeneRawParams, ModelFitParams};
use crate::glm::{fit_irls, least_squares, mean_from_eta, GlmFamily, IrlsFit};

const KAPPA_0: f64 = 1.0;
const ARMIJO_EPSILON: f64 = 1.0e-4;
const GRID_POINTS: usize = 20;

/// Result of the overdispersion MLE
#[derive(Debug, Clone, Copy)]
pub struct OverdispersionFit {
    pub alpha: f64,
    /// Adjusted profile log-likelihood at `alpha`
    pub log_likelihood: f64,
    pub iterations: usize,
    /// False when the line search ran out of iterations
    pub converged: bool,
}

/// 2x2 information `X'WX` for the design `[1, x]` with `w = 1 / (1/mu + alpha)`
fn weighted_gram(x: &[f64], mu: &[f64], alpha: f64) -> ([[f64; 2]; 2], [[f64; 2]; 2]) {
    let mut b = [[0.0f64; 2]; 2];
    let mut db = [[0.0f64; 2]; 2];
    for (&xi, &mi) in x.iter().zip(mu.iter()) {
        let m = mi.max(1e-10);
        let w = 1.0 / (1.0 / m + alpha);
        let dw = -w * w;
        let row = [1.0, xi];
        for j in 0..2 {
            for k in 0..2 {
                b[j][k] += w * row[j] * row[k];
                db[j][k] += dw * row[j] * row[k];
            }
        }
    }
    (b, db)
}

/// Cox-Reid adjusted log-likelihood of `ln(alpha)` at fixed means
fn adjusted_log_likelihood(y: &[f64], x: &[f64], mu: &[f64], log_alpha: f64) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;

    let mut ll = 0.0;
    for (&yi, &mi) in y.iter().zip(mu.iter()) {
        let m = mi.max(1e-10);
        ll += ln_gamma(yi + alpha_inv) - ln_gamma(alpha_inv);
        ll -= yi * (m + alpha_inv).ln();
        ll -= alpha_inv * (1.0 + m * alpha).ln();
    }

    let (b, _) = weighted_gram(x, mu, alpha);
    let det = b[0][0] * b[1][1] - b[0][1] * b[1][0];
    let cr = if det > 1e-10 { -0.5 * det.ln() } else { 0.0 };
    ll + cr
}

/// Derivative of [`adjusted_log_likelihood`] with respect to `ln(alpha)`
fn d_adjusted_log_likelihood(y: &[f64], x: &[f64], mu: &[f64], log_alpha: f64) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_sq = alpha * alpha;
    let alpha_inv = 1.0 / alpha;

    let mut dll = 0.0;
    for (&yi, &mi) in y.iter().zip(mu.iter()) {
        let m = mi.max(1e-10);
        dll += -digamma(yi + alpha_inv) / alpha_sq + digamma(alpha_inv) / alpha_sq;
        dll += yi / (alpha_sq * (m + alpha_inv));
        dll += (1.0 + m * alpha).ln() / alpha_sq - m / (alpha * (1.0 + m * alpha));
    }

    // d(-0.5 ln|B|)/dalpha = -0.5 tr(B^-1 dB)
    let (b, db) = weighted_gram(x, mu, alpha);
    let det = b[0][0] * b[1][1] - b[0][1] * b[1][0];
    let dcr = if det.abs() > 1e-10 {
        let tr = (b[1][1] * db[0][0] + b[0][0] * db[1][1] - b[0][1] * db[1][0] - b[1][0] * db[0][1]) / det;
        -0.5 * tr
    } else {
        0.0
    };

    (dll + dcr) * alpha
}

/// Maximize the adjusted log-likelihood over `ln(alpha)` in
/// `[min_log_alpha, max_log_alpha]` by gradient ascent with Armijo backtracking.
pub fn overdispersion_mle(
    y: &[f64],
    x: &[f64],
    mu: &[f64],
    alpha_init: f64,
    bounds: (f64, f64),
    maxit: usize,
    tol: f64,
) -> OverdispersionFit {
    let (min_log_alpha, max_log_alpha) = bounds;
    let mut log_alpha = alpha_init.max(1e-300).ln().clamp(min_log_alpha, max_log_alpha);
    let mut lp = adjusted_log_likelihood(y, x, mu, log_alpha);
    let mut dlp = d_adjusted_log_likelihood(y, x, mu, log_alpha);
    let mut kappa = KAPPA_0;

    let mut accepted = 0;
    let mut iterations = 0;
    let mut converged = false;

    for iter in 0..maxit {
        iterations = iter + 1;
        if !dlp.is_finite() || dlp == 0.0 {
            converged = dlp == 0.0;
            break;
        }

        let raw = log_alpha + kappa * dlp;
        if raw < min_log_alpha {
            kappa = (min_log_alpha - log_alpha) / dlp;
        }
        if raw > max_log_alpha {
            kappa = (max_log_alpha - log_alpha) / dlp;
        }
        let proposal = log_alpha + kappa * dlp;

        let lp_proposal = adjusted_log_likelihood(y, x, mu, proposal);
        if -lp_proposal <= -lp - kappa * ARMIJO_EPSILON * dlp * dlp {
            accepted += 1;
            log_alpha = proposal;
            let change = lp_proposal - lp;
            lp = lp_proposal;

            if change < tol {
                converged = true;
                break;
            }
            // Poisson-like boundary
            if log_alpha <= min_log_alpha {
                converged = true;
                break;
            }

            dlp = d_adjusted_log_likelihood(y, x, mu, log_alpha);
            kappa = (kappa * 1.1).min(KAPPA_0);
            if accepted % 5 == 0 {
                kappa /= 2.0;
            }
        } else {
            kappa /= 2.0;
        }
    }

    OverdispersionFit {
        alpha: log_alpha.exp(),
        log_likelihood: lp,
        iterations,
        converged,
    }
}

/// Coarse grid over the bounds, then a fine grid around the best coarse point
fn grid_search_overdispersion(y: &[f64], x: &[f64], mu: &[f64], bounds: (f64, f64)) -> OverdispersionFit {
    let (lo, hi) = bounds;
    let argmax = |grid: &[f64]| -> (f64, f64) {
        grid.iter()
            .map(|&a| (a, adjusted_log_likelihood(y, x, mu, a)))
            .filter(|(_, lp)| lp.is_finite())
            .fold((grid[0], f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best })
    };

    let delta = (hi - lo) / (GRID_POINTS - 1) as f64;
    let coarse: Vec<f64> = (0..GRID_POINTS).map(|i| lo + i as f64 * delta).collect();
    let (best_coarse, _) = argmax(&coarse);

    let fine_lo = (best_coarse - delta).max(lo);
    let fine_hi = (best_coarse + delta).min(hi);
    let fine_delta = (fine_hi - fine_lo) / (GRID_POINTS - 1) as f64;
    let fine: Vec<f64> = (0..GRID_POINTS).map(|i| fine_lo + i as f64 * fine_delta).collect();
    let (best, lp) = argmax(&fine);

    OverdispersionFit {
        alpha: best.exp(),
        log_likelihood: lp,
        iterations: 2 * GRID_POINTS,
        converged: lp.is_finite(),
    }
}

/// Moments overdispersion: `(sum((y - mu)^2) - sum(mu)) / sum(mu^2)`
fn moments_overdispersion(y: &[f64], mu: &[f64]) -> f64 {
    let mut num = 0.0;
    let mut den = 0.0;
    for (&yi, &mi) in y.iter().zip(mu.iter()) {
        num += (yi - mi) * (yi - mi) - mi;
        den += mi * mi;
    }
    num / den
}

fn nb_refit(
    gene: &GeneInput<'_>,
    alpha: f64,
    start: (f64, f64),
    params: &ModelFitParams,
) -> Result<IrlsFit, FitError> {
    let fit = fit_irls(
        gene.y,
        gene.x,
        GlmFamily::NegativeBinomial { theta: 1.0 / alpha },
        Some(start),
        &params.irls,
    );
    if fit.converged {
        Ok(fit)
    } else {
        log::debug!("Gamma-Poisson coefficient fit for {} did not converge", gene.id);
        Err(gene.non_convergence())
    }
}

/// Gamma-Poisson fit of one gene; `cancel` is checked between stages
pub fn fit_glm_gam_poi(
    gene: &GeneInput<'_>,
    params: &ModelFitParams,
    cancel: Option<&CancelToken>,
) -> Result<GeneRawParams, FitError> {
    if gene.all_zero() {
        return Err(gene.degenerate("all counts are zero"));
    }

    let min_log_alpha = (1.0 / params.theta.max_theta).ln();
    let max_log_alpha = (1.0 / params.theta.min_theta).ln();
    let bounds = (min_log_alpha, max_log_alpha);

    let log_y: Vec<f64> = gene.y.iter().map(|&v| (v + 0.5).ln()).collect();
    let rough = least_squares(gene.x, &log_y).ok_or_else(|| gene.degenerate("covariate is constant"))?;
    let rough_mu: Vec<f64> = gene.x.iter().map(|&xi| mean_from_eta(rough.0 + rough.1 * xi)).collect();

    let alpha_start = {
        let a = moments_overdispersion(gene.y, &rough_mu);
        if a.is_finite() && a > 0.0 {
            a.clamp(min_log_alpha.exp(), max_log_alpha.exp())
        } else {
            min_log_alpha.exp()
        }
    };

    let first = nb_refit(gene, alpha_start, rough, params)?;
    if cancelled(cancel) {
        return Err(FitError::Cancelled);
    }
    let mut od = overdispersion_mle(
        gene.y,
        gene.x,
        &first.mu,
        alpha_start,
        bounds,
        params.gp_maxit,
        params.gp_tol,
    );
    if !od.converged || !od.alpha.is_finite() {
        log::debug!(
            "overdispersion line search for {} stalled after {} iterations, using grid search",
            gene.id,
            od.iterations
        );
        if cancelled(cancel) {
            return Err(FitError::Cancelled);
        }
        od = grid_search_overdispersion(gene.y, gene.x, &first.mu, bounds);
        if !od.converged {
            return Err(gene.non_convergence());
        }
    }

    let fit = nb_refit(gene, od.alpha, (first.intercept, first.slope), params)?;
    Ok(GeneRawParams {
        intercept: fit.intercept,
        slope: fit.slope,
        theta: params.theta.clamp(1.0 / od.alpha),
        converged: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::simulate::{simulate_gene_counts, GeneTruth};
    use crate::rng::MersenneTwister;

    fn simulated(seed: u32, n: usize, theta: f64) -> (Vec<f64>, Vec<f64>, GeneTruth) {
        let mut rng = MersenneTwister::new(seed);
        let x: Vec<f64> = (0..n).map(|_| rng.runif_range(1.5, 2.5)).collect();
        let truth = GeneTruth {
            intercept: -0.5,
            slope: std::f64::consts::LN_10,
            theta,
        };
        let y = simulate_gene_counts(&mut rng, &x, truth);
        (x, y, truth)
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let (x, y, truth) = simulated(1, 200, 5.0);
        let mu: Vec<f64> = x.iter().map(|&v| (truth.intercept + truth.slope * v).exp()).collect();
        let la = (0.3f64).ln();
        let h = 1e-5;
        let numeric = (adjusted_log_likelihood(&y, &x, &mu, la + h) - adjusted_log_likelihood(&y, &x, &mu, la - h))
            / (2.0 * h);
        let analytic = d_adjusted_log_likelihood(&y, &x, &mu, la);
        assert!(
            (numeric - analytic).abs() < 1e-4 * analytic.abs().max(1.0),
            "numeric {} analytic {}",
            numeric,
            analytic
        );
    }

    #[test]
    fn test_line_search_and_grid_agree() {
        let (x, y, truth) = simulated(2, 800, 4.0);
        let mu: Vec<f64> = x.iter().map(|&v| (truth.intercept + truth.slope * v).exp()).collect();
        let bounds = ((1e-5f64).ln(), (1e7f64).ln());
        let line = overdispersion_mle(&y, &x, &mu, 1.0, bounds, 100, 1e-6);
        let grid = grid_search_overdispersion(&y, &x, &mu, bounds);
        assert!(line.converged);
        assert!(
            (line.alpha.ln() - grid.alpha.ln()).abs() < 0.1,
            "line {} grid {}",
            line.alpha,
            grid.alpha
        );
    }

    #[test]
    fn test_recovers_theta() {
        let (x, y, truth) = simulated(3, 2000, 10.0);
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let gene = GeneInput { id: "g", y: &y, x: &x, mean };
        let p = fit_glm_gam_poi(&gene, &ModelFitParams::default(), None).unwrap();
        assert!((p.theta - truth.theta).abs() < 0.2 * truth.theta, "theta {}", p.theta);
        assert!((p.slope - truth.slope).abs() < 0.1, "slope {}", p.slope);
    }

    #[test]
    fn test_poisson_data_reaches_lower_bound_region() {
        let mut rng = MersenneTwister::new(4);
        let x: Vec<f64> = (0..1000).map(|_| rng.runif_range(0.0, 1.0)).collect();
        let y: Vec<f64> = x.iter().map(|&v| rng.rpois((1.0 + v).exp())).collect();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let gene = GeneInput { id: "p", y: &y, x: &x, mean };
        let p = fit_glm_gam_poi(&gene, &ModelFitParams::default(), None).unwrap();
        assert!(p.theta > 10.0, "theta {}", p.theta);
    }
}
