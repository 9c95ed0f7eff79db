//! Negative binomial theta (dispersion) estimation
//!
//! Per-gene strategies take observed counts and fitted means. The population
//! strategies ([`ThetaStrategy::Fixed`], [`ThetaStrategy::SharedAcrossGenes`])
//! are resolved once per run by [`ThetaStrategy::resolve`] and then applied to
//! every gene.

mod ml;
mod moments;
mod shared;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use ml::{theta_ml, trigamma};
pub use moments::theta_mm;
pub use shared::{estimate_shared_theta, select_shared_theta_genes, SharedThetaParams};

use crate::data::{CellAttributes, CountMatrix, GeneStats};
use crate::error::{Result, VstError};

/// Bounds and solver settings shared by every theta strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThetaParams {
    /// Smallest theta ever reported
    pub min_theta: f64,
    /// Largest theta ever reported; also the Poisson-like fallback
    pub max_theta: f64,
    /// Iteration limit of the ML Newton solver
    pub ml_limit: usize,
    /// Step tolerance of the ML Newton solver
    pub ml_eps: f64,
}

impl Default for ThetaParams {
    fn default() -> Self {
        Self {
            min_theta: 1e-7,
            max_theta: 1e5,
            ml_limit: 10,
            ml_eps: f64::EPSILON.powf(0.25),
        }
    }
}

impl ThetaParams {
    /// Clamp into `[min_theta, max_theta]`, mapping non-positive, NaN and
    /// infinite values to the Poisson-like `max_theta`
    pub fn clamp(&self, theta: f64) -> f64 {
        if theta.is_nan() || theta <= 0.0 || theta.is_infinite() {
            self.max_theta
        } else {
            theta.clamp(self.min_theta, self.max_theta)
        }
    }
}

/// Per-gene theta estimator selected by the user for Poisson-based methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThetaEstimation {
    #[default]
    #[serde(rename = "ml")]
    MaximumLikelihood,
    #[serde(rename = "mm")]
    MethodOfMoments,
}

impl FromStr for ThetaEstimation {
    type Err = VstError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ml" | "theta.ml" => Ok(ThetaEstimation::MaximumLikelihood),
            "mm" | "theta.mm" => Ok(ThetaEstimation::MethodOfMoments),
            other => Err(VstError::InvalidInput {
                reason: format!("Unknown theta estimation '{}'. Use: ml or mm", other),
            }),
        }
    }
}

impl fmt::Display for ThetaEstimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThetaEstimation::MaximumLikelihood => write!(f, "ml"),
            ThetaEstimation::MethodOfMoments => write!(f, "mm"),
        }
    }
}

/// How theta is obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ThetaStrategy {
    MaximumLikelihood,
    MethodOfMoments,
    /// One value for all genes, see [`estimate_shared_theta`]
    SharedAcrossGenes(SharedThetaParams),
    /// Caller-supplied constant
    Fixed(f64),
}

impl From<ThetaEstimation> for ThetaStrategy {
    fn from(e: ThetaEstimation) -> Self {
        match e {
            ThetaEstimation::MaximumLikelihood => ThetaStrategy::MaximumLikelihood,
            ThetaEstimation::MethodOfMoments => ThetaStrategy::MethodOfMoments,
        }
    }
}

impl ThetaStrategy {
    /// Estimate theta for one gene. Always `> 0` on success.
    ///
    /// ML failures surface as `ThetaNonConvergence` so the caller can apply the
    /// Poisson-like fallback; MM results are clamped here.
    pub fn estimate(&self, y: &[f64], mu: &[f64], params: &ThetaParams) -> Result<f64> {
        match self {
            ThetaStrategy::MaximumLikelihood => theta_ml(y, mu, params),
            ThetaStrategy::MethodOfMoments => Ok(params.clamp(theta_mm(y, mu))),
            ThetaStrategy::Fixed(theta) => validate_theta(*theta),
            ThetaStrategy::SharedAcrossGenes(_) => Err(VstError::InvalidInput {
                reason: "shared theta is estimated over the gene population, not per gene".to_string(),
            }),
        }
    }

    /// Whether the strategy yields one value for the whole run
    pub fn is_population(&self) -> bool {
        matches!(self, ThetaStrategy::SharedAcrossGenes(_) | ThetaStrategy::Fixed(_))
    }

    /// Resolve a population strategy once for a run
    pub fn resolve(
        &self,
        counts: &CountMatrix,
        cell_attr: &CellAttributes,
        stats: &[GeneStats],
        params: &ThetaParams,
    ) -> Result<f64> {
        match self {
            ThetaStrategy::Fixed(theta) => validate_theta(*theta),
            ThetaStrategy::SharedAcrossGenes(shared) => estimate_shared_theta(counts, cell_attr, stats, shared, params),
            ThetaStrategy::MaximumLikelihood | ThetaStrategy::MethodOfMoments => Err(VstError::InvalidInput {
                reason: format!("{:?} theta is estimated per gene", self),
            }),
        }
    }

    /// Estimate, substituting `max_theta` when the solver fails to converge
    pub fn estimate_or_poisson(&self, y: &[f64], mu: &[f64], params: &ThetaParams) -> Result<f64> {
        match self.estimate(y, mu, params) {
            Ok(theta) => Ok(theta),
            Err(VstError::ThetaNonConvergence { iterations }) => {
                log::debug!(
                    "theta did not converge after {} iterations, using {}",
                    iterations,
                    params.max_theta
                );
                Ok(params.max_theta)
            }
            Err(e) => Err(e),
        }
    }
}

/// A supplied theta must be finite and positive
pub fn validate_theta(theta: f64) -> Result<f64> {
    if theta.is_finite() && theta > 0.0 {
        Ok(theta)
    } else {
        Err(VstError::InvalidInput {
            reason: format!("theta must be a positive finite number, got {}", theta),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_strategy() {
        let s = ThetaStrategy::Fixed(100.0);
        assert_eq!(s.estimate(&[1.0], &[1.0], &ThetaParams::default()).unwrap(), 100.0);
        let bad = ThetaStrategy::Fixed(-1.0);
        assert!(matches!(
            bad.estimate(&[1.0], &[1.0], &ThetaParams::default()),
            Err(VstError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_resolve_population_strategies() {
        use crate::data::{simulate_counts, SimulationParams};

        let sim = simulate_counts(&SimulationParams {
            n_genes: 60,
            n_cells: 400,
            log10_fraction_range: (-3.0, -1.5),
            seed: 5,
            ..Default::default()
        })
        .unwrap();
        let attr = CellAttributes::from_counts(&sim.counts).unwrap();
        let stats = sim.counts.all_gene_stats();
        let p = ThetaParams::default();

        let fixed = ThetaStrategy::Fixed(100.0);
        assert!(fixed.is_population());
        assert_eq!(fixed.resolve(&sim.counts, &attr, &stats, &p).unwrap(), 100.0);

        let shared = ThetaStrategy::SharedAcrossGenes(SharedThetaParams::default());
        let direct = estimate_shared_theta(&sim.counts, &attr, &stats, &SharedThetaParams::default(), &p).unwrap();
        assert_eq!(shared.resolve(&sim.counts, &attr, &stats, &p).unwrap(), direct);

        assert!(!ThetaStrategy::MaximumLikelihood.is_population());
        assert!(matches!(
            ThetaStrategy::MethodOfMoments.resolve(&sim.counts, &attr, &stats, &p),
            Err(VstError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_clamp_maps_non_positive_to_poisson_like() {
        let p = ThetaParams::default();
        assert_eq!(p.clamp(-3.0), p.max_theta);
        assert_eq!(p.clamp(f64::INFINITY), p.max_theta);
        assert_eq!(p.clamp(1e-12), p.min_theta);
        assert_eq!(p.clamp(7.0), 7.0);
    }

    #[test]
    fn test_ml_failure_falls_back() {
        let y = vec![2.0, 4.0, 6.0];
        let p = ThetaParams::default();
        let theta = ThetaStrategy::MaximumLikelihood.estimate_or_poisson(&y, &y, &p).unwrap();
        assert_eq!(theta, p.max_theta);
    }

    #[test]
    fn test_mm_always_positive() {
        let y = vec![5.0, 5.0, 5.0];
        let theta = ThetaStrategy::MethodOfMoments
            .estimate(&y, &y, &ThetaParams::default())
            .unwrap();
        assert!(theta > 0.0);
    }

    #[test]
    fn test_parse_theta_estimation() {
        assert_eq!("ml".parse::<ThetaEstimation>().unwrap(), ThetaEstimation::MaximumLikelihood);
        assert_eq!("theta.mm".parse::<ThetaEstimation>().unwrap(), ThetaEstimation::MethodOfMoments);
        assert!("xx".parse::<ThetaEstimation>().is_err());
    }
}
