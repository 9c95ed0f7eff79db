//! Negative binomial and Poisson distribution utilities
//!
//! Dispersion is parameterized by the size `theta`: Var(Y) = mu + mu^2 / theta.
//! `theta = inf` is the Poisson limit.

use statrs::function::gamma::ln_gamma;

/// Maximum eta value to prevent overflow (exp(700) ≈ 1e304)
pub const MAX_ETA: f64 = 700.0;

/// Expected count from the linear predictor under a log link
pub fn mean_from_eta(eta: f64) -> f64 {
    eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// Var(Y) = mu + mu^2 / theta
pub fn nb_variance(mu: f64, theta: f64) -> f64 {
    if theta.is_infinite() {
        mu
    } else {
        mu + mu * mu / theta
    }
}

/// IRLS weight for the log link: w = mu^2 / Var(Y) = mu / (1 + mu / theta)
pub fn nb_weight(mu: f64, theta: f64) -> f64 {
    if theta.is_infinite() {
        mu
    } else {
        mu / (1.0 + mu / theta)
    }
}

/// Log-likelihood of one observation under NB(mu, theta)
///
/// ln P(Y = y) = lgamma(theta + y) - lgamma(theta) - lgamma(y + 1)
///             + theta ln(theta) + y ln(mu) - (theta + y) ln(theta + mu)
pub fn nb_log_likelihood(y: f64, mu: f64, theta: f64) -> f64 {
    if mu <= 0.0 || theta <= 0.0 {
        return if y == 0.0 && mu == 0.0 { 0.0 } else { f64::NEG_INFINITY };
    }
    let y_ln_mu = if y > 0.0 { y * mu.ln() } else { 0.0 };
    ln_gamma(theta + y) - ln_gamma(theta) - ln_gamma(y + 1.0) + theta * theta.ln() + y_ln_mu
        - (theta + y) * (theta + mu).ln()
}

/// Total NB log-likelihood over a gene
pub fn nb_total_log_likelihood(y: &[f64], mu: &[f64], theta: f64) -> f64 {
    y.iter()
        .zip(mu.iter())
        .map(|(&yi, &mi)| nb_log_likelihood(yi, mi, theta))
        .sum()
}

/// Unit deviance of the Poisson family: 2 (y ln(y/mu) - (y - mu))
pub fn poisson_unit_deviance(y: f64, mu: f64) -> f64 {
    let term = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
    2.0 * (term - (y - mu))
}

/// Unit deviance with fixed theta:
/// 2 (y ln(y/mu) - (y + theta) ln((y + theta)/(mu + theta)))
pub fn nb_unit_deviance(y: f64, mu: f64, theta: f64) -> f64 {
    if theta.is_infinite() {
        return poisson_unit_deviance(y, mu);
    }
    let term = if y > 0.0 { y * (y / mu).ln() } else { 0.0 };
    2.0 * (term - (y + theta) * ((y + theta) / (mu + theta)).ln())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nb_variance() {
        let var = nb_variance(10.0, 10.0);
        assert!((var - 20.0).abs() < 1e-12);
        assert_eq!(nb_variance(10.0, f64::INFINITY), 10.0);
    }

    #[test]
    fn test_nb_log_likelihood_poisson_limit() {
        // For large theta the NB log-likelihood approaches the Poisson one
        let y: f64 = 5.0;
        let mu: f64 = 4.0;
        let poisson = y * mu.ln() - mu - ln_gamma(y + 1.0);
        let nb = nb_log_likelihood(y, mu, 1e8);
        assert!((nb - poisson).abs() < 1e-5, "nb={} poisson={}", nb, poisson);
    }

    #[test]
    fn test_deviance_zero_at_saturation() {
        assert!(poisson_unit_deviance(3.0, 3.0).abs() < 1e-12);
        assert!(nb_unit_deviance(3.0, 3.0, 5.0).abs() < 1e-12);
        assert!((poisson_unit_deviance(0.0, 2.0) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_nb_weight() {
        let w = nb_weight(10.0, 10.0);
        assert!((w - 5.0).abs() < 1e-12);
    }
}
