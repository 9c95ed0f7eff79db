//! Poisson-based fits: poisson, qpoisson and nb_fast

use super::{FitError, GeneInput, GeneRawParams, ModelFitParams};
use crate::glm::{fit_irls, GlmFamily, IrlsFit};
use crate::theta::{ThetaParams, ThetaStrategy};

/// Poisson IRLS of the gene on the covariate
pub(crate) fn poisson_glm(gene: &GeneInput<'_>, params: &ModelFitParams) -> Result<IrlsFit, FitError> {
    if gene.all_zero() {
        return Err(gene.degenerate("all counts are zero"));
    }
    let fit = fit_irls(gene.y, gene.x, GlmFamily::Poisson, None, &params.irls);
    if !fit.converged {
        log::debug!(
            "Poisson IRLS for {} stopped after {} iterations",
            gene.id,
            fit.iterations
        );
        return Err(gene.non_convergence());
    }
    Ok(fit)
}

/// Theta on the Poisson fitted means with the configured estimator
pub(crate) fn poisson_theta(
    gene: &GeneInput<'_>,
    fit: &IrlsFit,
    params: &ModelFitParams,
) -> Result<f64, FitError> {
    let strategy = ThetaStrategy::from(params.theta_estimation);
    strategy
        .estimate_or_poisson(gene.y, &fit.mu, &params.theta)
        .map_err(|e| {
            log::debug!("theta estimation failed for {}: {}", gene.id, e);
            gene.non_convergence()
        })
}

/// Poisson regression, then theta from the fitted means
pub fn fit_poisson(gene: &GeneInput<'_>, params: &ModelFitParams) -> Result<GeneRawParams, FitError> {
    let fit = poisson_glm(gene, params)?;
    let theta = poisson_theta(gene, &fit, params)?;
    Ok(GeneRawParams {
        intercept: fit.intercept,
        slope: fit.slope,
        theta,
        converged: true,
    })
}

/// Theta implied by the quasi-Poisson dispersion.
///
/// `phi = sum((y - mu)^2 / mu) / (n - 2)`; `theta = mean(mu) / (phi - 1)` for
/// `phi > 1`, otherwise the Poisson-like `max_theta`.
pub fn quasi_poisson_theta(y: &[f64], mu: &[f64], params: &ThetaParams) -> f64 {
    let n = y.len();
    if n <= 2 {
        return params.max_theta;
    }
    let pearson: f64 = y
        .iter()
        .zip(mu.iter())
        .filter(|&(_, &m)| m > 0.0)
        .map(|(&yi, &mi)| (yi - mi) * (yi - mi) / mi)
        .sum();
    let phi = pearson / (n - 2) as f64;
    if !(phi > 1.0) {
        return params.max_theta;
    }
    let mean_mu = mu.iter().sum::<f64>() / n as f64;
    params.clamp(mean_mu / (phi - 1.0))
}

/// Poisson regression with the dispersion converted to theta
pub fn fit_qpoisson(gene: &GeneInput<'_>, params: &ModelFitParams) -> Result<GeneRawParams, FitError> {
    let fit = poisson_glm(gene, params)?;
    let theta = quasi_poisson_theta(gene.y, &fit.mu, &params.theta);
    Ok(GeneRawParams {
        intercept: fit.intercept,
        slope: fit.slope,
        theta,
        converged: true,
    })
}

/// Poisson fit and theta, then one NB regression with theta held fixed
pub fn fit_nb_fast(gene: &GeneInput<'_>, params: &ModelFitParams) -> Result<GeneRawParams, FitError> {
    let poisson = poisson_glm(gene, params)?;
    let theta = poisson_theta(gene, &poisson, params)?;

    let nb = fit_irls(
        gene.y,
        gene.x,
        GlmFamily::NegativeBinomial { theta },
        Some((poisson.intercept, poisson.slope)),
        &params.irls,
    );
    if !nb.converged {
        log::debug!("NB refit for {} did not converge (theta = {})", gene.id, theta);
        return Err(gene.non_convergence());
    }

    Ok(GeneRawParams {
        intercept: nb.intercept,
        slope: nb.slope,
        theta,
        converged: true,
    })
}
