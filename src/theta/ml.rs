//! Maximum likelihood estimation of theta given fixed fitted means

use statrs::function::gamma::digamma;

use super::ThetaParams;
use crate::error::{Result, VstError};

/// Trigamma function: recurrence up to x >= 6, then the asymptotic series
pub fn trigamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    acc + inv
        + 0.5 * inv2
        + inv * inv2 * (1.0 / 6.0 - inv2 * (1.0 / 30.0 - inv2 * (1.0 / 42.0 - inv2 / 30.0)))
}

fn score(theta: f64, y: &[f64], mu: &[f64]) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            digamma(theta + yi) - digamma(theta) + theta.ln() + 1.0
                - (theta + mi).ln()
                - (yi + theta) / (mi + theta)
        })
        .sum()
}

fn information(theta: f64, y: &[f64], mu: &[f64]) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| {
            -trigamma(theta + yi) + trigamma(theta) - 1.0 / theta + 2.0 / (mi + theta)
                - (yi + theta) / ((mi + theta) * (mi + theta))
        })
        .sum()
}

/// Outcome of the Newton iterations
#[derive(Debug, Clone, Copy)]
struct NewtonRun {
    theta: f64,
    updates: usize,
    converged: bool,
}

fn newton(y: &[f64], mu: &[f64], params: &ThetaParams) -> NewtonRun {
    let n = y.len() as f64;
    let denom: f64 = y
        .iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| (yi / mi - 1.0).powi(2))
        .sum();
    let mut t0 = n / denom;

    let mut updates = 0;
    let mut del: f64 = 1.0;
    while updates < params.ml_limit && del.abs() > params.ml_eps {
        if !t0.is_finite() || t0 > params.max_theta {
            break;
        }
        updates += 1;
        t0 = t0.abs();
        del = score(t0, y, mu) / information(t0, y, mu);
        t0 += del;
    }

    NewtonRun {
        theta: t0,
        updates,
        converged: del.abs() <= params.ml_eps,
    }
}

/// Newton iterations on the profile score for theta.
///
/// Starts from `n / sum((y/mu - 1)^2)` and performs at most `ml_limit`
/// updates. A step still above `ml_eps` after the last update, a non-finite
/// iterate, or an iterate above `max_theta` is a `ThetaNonConvergence`; a
/// negative estimate is clamped to `min_theta`.
pub fn theta_ml(y: &[f64], mu: &[f64], params: &ThetaParams) -> Result<f64> {
    if y.len() != mu.len() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} fitted means", y.len()),
            got: format!("{} fitted means", mu.len()),
        });
    }
    let run = newton(y, mu, params);
    if !run.converged || !run.theta.is_finite() || run.theta > params.max_theta {
        log::debug!("theta_ml stopped at {} after {} updates", run.theta, run.updates);
        return Err(VstError::ThetaNonConvergence { iterations: run.updates });
    }
    Ok(run.theta.max(params.min_theta))
}
