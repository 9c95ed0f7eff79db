//! Full negative binomial regression: alternating coefficient and theta updates

use super::poisson::poisson_glm;
use super::{cancelled, CancelToken, FitError, GeneInput, GeneRawParams, ModelFitParams};
use crate::error::VstError;
use crate::glm::{fit_irls, nb_total_log_likelihood, GlmFamily, IrlsFit};
use crate::theta::theta_ml;

enum ThetaStep {
    Estimate(f64),
    /// The ML solver diverged; continue as Poisson-like
    Diverged,
}

fn ml_step(gene: &GeneInput<'_>, mu: &[f64], params: &ModelFitParams) -> Result<ThetaStep, FitError> {
    match theta_ml(gene.y, mu, &params.theta) {
        Ok(theta) => Ok(ThetaStep::Estimate(theta)),
        Err(VstError::ThetaNonConvergence { iterations }) => {
            log::debug!(
                "theta for {} diverged after {} iterations, treating as Poisson-like",
                gene.id,
                iterations
            );
            Ok(ThetaStep::Diverged)
        }
        Err(e) => {
            log::debug!("theta estimation failed for {}: {}", gene.id, e);
            Err(gene.non_convergence())
        }
    }
}

fn nb_glm(
    gene: &GeneInput<'_>,
    theta: f64,
    start: (f64, f64),
    params: &ModelFitParams,
) -> Result<IrlsFit, FitError> {
    let fit = fit_irls(
        gene.y,
        gene.x,
        GlmFamily::NegativeBinomial { theta },
        Some(start),
        &params.irls,
    );
    if fit.converged {
        Ok(fit)
    } else {
        log::debug!("NB IRLS for {} did not converge at theta = {}", gene.id, theta);
        Err(gene.non_convergence())
    }
}

/// Joint NB fit.
///
/// Starts from the Poisson fit and its ML theta, then alternates NB IRLS at
/// fixed theta with an ML theta update on the new means until
/// `|Lm0 - Lm| / d1 + |del| / d2 <= nb_tol`, with
/// `d1 = sqrt(2 max(1, n - 2))` and `d2 = 1`. `cancel` is checked before
/// every alternation.
pub fn fit_nb(
    gene: &GeneInput<'_>,
    params: &ModelFitParams,
    cancel: Option<&CancelToken>,
) -> Result<GeneRawParams, FitError> {
    let poisson = poisson_glm(gene, params)?;
    let max_theta = params.theta.max_theta;

    let mut theta = match ml_step(gene, &poisson.mu, params)? {
        ThetaStep::Estimate(t) => t,
        ThetaStep::Diverged => {
            let fit = nb_glm(gene, max_theta, (poisson.intercept, poisson.slope), params)?;
            return Ok(GeneRawParams {
                intercept: fit.intercept,
                slope: fit.slope,
                theta: max_theta,
                converged: true,
            });
        }
    };

    let n = gene.y.len() as f64;
    let d1 = (2.0 * (n - 2.0).max(1.0)).sqrt();
    let d2 = 1.0;

    let mut coef = (poisson.intercept, poisson.slope);
    let mut lm = nb_total_log_likelihood(gene.y, &poisson.mu, theta);
    let mut lm0 = lm + 2.0 * d1;
    let mut del: f64 = 1.0;
    let mut iter = 0;

    while (lm0 - lm).abs() / d1 + del.abs() / d2 > params.nb_tol {
        if cancelled(cancel) {
            return Err(FitError::Cancelled);
        }
        if iter >= params.nb_maxit {
            log::debug!(
                "NB alternation for {} hit the limit of {} iterations",
                gene.id,
                params.nb_maxit
            );
            return Err(gene.non_convergence());
        }
        iter += 1;

        let theta_prev = theta;
        let fit = nb_glm(gene, theta, coef, params)?;
        coef = (fit.intercept, fit.slope);

        match ml_step(gene, &fit.mu, params)? {
            ThetaStep::Estimate(t) => theta = t,
            ThetaStep::Diverged => {
                let fit = nb_glm(gene, max_theta, coef, params)?;
                coef = (fit.intercept, fit.slope);
                theta = max_theta;
                break;
            }
        }

        del = theta_prev - theta;
        lm0 = lm;
        lm = nb_total_log_likelihood(gene.y, &fit.mu, theta);
        if !lm.is_finite() {
            return Err(gene.non_convergence());
        }
    }

    log::debug!("NB fit for {} finished after {} alternations", gene.id, iter);
    Ok(GeneRawParams {
        intercept: coef.0,
        slope: coef.1,
        theta,
        converged: true,
    })
}
