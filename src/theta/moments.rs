//! Method-of-moments theta

/// Closed-form moment estimate: `sum(mu^2) / (sum((y - mu)^2) - sum(mu))`.
///
/// Matches the NB variance `mu + mu^2 / theta` to the observed squared
/// residuals. Non-positive or infinite when the data show no excess variance;
/// callers clamp.
pub fn theta_mm(y: &[f64], mu: &[f64]) -> f64 {
    let mut sum_mu_sq = 0.0;
    let mut sum_resid_sq = 0.0;
    let mut sum_mu = 0.0;
    for (&yi, &mi) in y.iter().zip(mu.iter()) {
        sum_mu_sq += mi * mi;
        sum_resid_sq += (yi - mi) * (yi - mi);
        sum_mu += mi;
    }
    sum_mu_sq / (sum_resid_sq - sum_mu)
}
