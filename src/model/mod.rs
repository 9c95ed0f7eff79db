//! Per-gene model fitting
//!
//! Every method regresses one gene's counts on the cell covariate and reports
//! `(intercept, slope, theta)`. [`FitMethod`] is the tagged set of strategies;
//! each variant dispatches to a stateless function with explicit configuration.

mod glm_gam_poi;
mod nb;
mod offset;
mod poisson;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use glm_gam_poi::{fit_glm_gam_poi, overdispersion_mle, OverdispersionFit};
pub use nb::fit_nb;
pub use offset::{fit_offset, offset_intercept, OFFSET_SLOPE};
pub use poisson::{fit_nb_fast, fit_poisson, fit_qpoisson, quasi_poisson_theta};

use crate::error::VstError;
use crate::glm::IrlsParams;
use crate::theta::{SharedThetaParams, ThetaEstimation, ThetaParams, ThetaStrategy};

/// Model fitting method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitMethod {
    #[serde(rename = "poisson")]
    Poisson,
    #[serde(rename = "qpoisson")]
    QuasiPoisson,
    #[serde(rename = "nb_fast")]
    NbFast,
    #[serde(rename = "nb")]
    Nb,
    #[serde(rename = "glmGamPoi")]
    GlmGamPoi,
    #[serde(rename = "offset")]
    Offset,
    #[serde(rename = "offset_shared_theta_estimate")]
    OffsetSharedThetaEstimate,
}

impl FitMethod {
    pub const ALL: [FitMethod; 7] = [
        FitMethod::Poisson,
        FitMethod::QuasiPoisson,
        FitMethod::NbFast,
        FitMethod::Nb,
        FitMethod::GlmGamPoi,
        FitMethod::Offset,
        FitMethod::OffsetSharedThetaEstimate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            FitMethod::Poisson => "poisson",
            FitMethod::QuasiPoisson => "qpoisson",
            FitMethod::NbFast => "nb_fast",
            FitMethod::Nb => "nb",
            FitMethod::GlmGamPoi => "glmGamPoi",
            FitMethod::Offset => "offset",
            FitMethod::OffsetSharedThetaEstimate => "offset_shared_theta_estimate",
        }
    }

    /// Whether the run must estimate a shared theta before fitting genes
    pub fn needs_shared_theta(&self) -> bool {
        matches!(self, FitMethod::OffsetSharedThetaEstimate)
    }

    /// Theta strategy resolved once per run rather than per gene
    pub fn population_theta_strategy(&self, params: &ModelFitParams) -> Option<ThetaStrategy> {
        match self {
            FitMethod::Offset => Some(ThetaStrategy::Fixed(params.theta_given)),
            FitMethod::OffsetSharedThetaEstimate => Some(ThetaStrategy::SharedAcrossGenes(params.shared_theta.clone())),
            _ => None,
        }
    }

    /// Whether a regression is solved per gene
    pub fn is_regression(&self) -> bool {
        !matches!(self, FitMethod::Offset | FitMethod::OffsetSharedThetaEstimate)
    }

    /// Fit one gene with this method
    pub fn fit(
        &self,
        gene: &GeneInput<'_>,
        params: &ModelFitParams,
        run: &RunConstants,
    ) -> Result<GeneRawParams, FitError> {
        match self {
            FitMethod::Poisson => fit_poisson(gene, params),
            FitMethod::QuasiPoisson => fit_qpoisson(gene, params),
            FitMethod::NbFast => fit_nb_fast(gene, params),
            FitMethod::Nb => fit_nb(gene, params, run.cancel),
            FitMethod::GlmGamPoi => fit_glm_gam_poi(gene, params, run.cancel),
            FitMethod::Offset | FitMethod::OffsetSharedThetaEstimate => {
                let theta = self
                    .population_theta_strategy(params)
                    .and_then(|s| run.population_theta(&s))
                    .ok_or_else(|| gene.degenerate("theta has not been resolved for this run"))?;
                fit_offset(gene, run.mean_umi, theta)
            }
        }
    }
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FitMethod {
    type Err = VstError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FitMethod::ALL
            .iter()
            .copied()
            .find(|m| m.name() == s)
            .ok_or_else(|| VstError::InvalidInput {
                reason: format!(
                    "Unknown method '{}'. Use: poisson, qpoisson, nb_fast, nb, glmGamPoi, offset, offset_shared_theta_estimate",
                    s
                ),
            })
    }
}

/// Unregularized parameters of one gene
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneRawParams {
    pub intercept: f64,
    pub slope: f64,
    pub theta: f64,
    pub converged: bool,
}

impl GeneRawParams {
    /// Placeholder for a gene whose fit failed
    pub fn missing() -> Self {
        Self {
            intercept: f64::NAN,
            slope: f64::NAN,
            theta: f64::NAN,
            converged: false,
        }
    }

    /// Converged with finite coefficients and a positive finite theta
    pub fn is_valid(&self) -> bool {
        self.converged
            && self.intercept.is_finite()
            && self.slope.is_finite()
            && self.theta.is_finite()
            && self.theta > 0.0
    }
}

/// Recoverable per-gene failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("model fit did not converge for gene {gene}")]
    NonConvergence { gene: String },

    #[error("gene {gene} cannot be fitted: {reason}")]
    Degenerate { gene: String, reason: String },

    #[error("fit cancelled")]
    Cancelled,
}

impl From<FitError> for VstError {
    fn from(e: FitError) -> Self {
        match e {
            FitError::NonConvergence { gene } => VstError::FitNonConvergence { gene },
            FitError::Degenerate { gene, reason } => VstError::InsufficientData {
                reason: format!("gene {}: {}", gene, reason),
            },
            FitError::Cancelled => VstError::Cancelled,
        }
    }
}

/// One gene's data as seen by a fitter
#[derive(Debug, Clone, Copy)]
pub struct GeneInput<'a> {
    pub id: &'a str,
    /// Counts per cell
    pub y: &'a [f64],
    /// Covariate per cell
    pub x: &'a [f64],
    /// Arithmetic mean count
    pub mean: f64,
}

impl GeneInput<'_> {
    pub(crate) fn all_zero(&self) -> bool {
        self.y.iter().all(|&v| v == 0.0)
    }

    pub(crate) fn non_convergence(&self) -> FitError {
        FitError::NonConvergence {
            gene: self.id.to_string(),
        }
    }

    pub(crate) fn degenerate(&self, reason: &str) -> FitError {
        FitError::Degenerate {
            gene: self.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Cooperative cancellation flag shared with the workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub(crate) fn cancelled(cancel: Option<&CancelToken>) -> bool {
    cancel.is_some_and(|c| c.is_cancelled())
}

/// Values fixed for a whole run
#[derive(Debug, Clone, Copy, Default)]
pub struct RunConstants<'a> {
    /// Mean linear-scale UMI over cells
    pub mean_umi: f64,
    /// Resolved [`ThetaStrategy::Fixed`] theta
    pub fixed_theta: Option<f64>,
    /// Resolved [`ThetaStrategy::SharedAcrossGenes`] theta
    pub shared_theta: Option<f64>,
    /// Checked inside long-running fits
    pub cancel: Option<&'a CancelToken>,
}

impl RunConstants<'_> {
    /// The run-level value of a population strategy, if it has been resolved
    pub fn population_theta(&self, strategy: &ThetaStrategy) -> Option<f64> {
        match strategy {
            ThetaStrategy::Fixed(_) => self.fixed_theta,
            ThetaStrategy::SharedAcrossGenes(_) => self.shared_theta,
            ThetaStrategy::MaximumLikelihood | ThetaStrategy::MethodOfMoments => None,
        }
    }

    pub fn set_population_theta(&mut self, strategy: &ThetaStrategy, theta: f64) {
        match strategy {
            ThetaStrategy::Fixed(_) => self.fixed_theta = Some(theta),
            ThetaStrategy::SharedAcrossGenes(_) => self.shared_theta = Some(theta),
            ThetaStrategy::MaximumLikelihood | ThetaStrategy::MethodOfMoments => {}
        }
    }
}

/// Configurable parameters for model fitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelFitParams {
    #[serde(skip)]
    pub irls: IrlsParams,
    pub theta: ThetaParams,
    /// Theta estimator after a Poisson fit (poisson, nb_fast)
    pub theta_estimation: ThetaEstimation,
    /// Theta for the offset method
    pub theta_given: f64,
    /// Shared theta settings of offset_shared_theta_estimate
    pub shared_theta: SharedThetaParams,
    /// Maximum coefficient/theta alternations of the nb method
    pub nb_maxit: usize,
    /// Alternation tolerance of the nb method
    pub nb_tol: f64,
    /// Maximum line search iterations of the overdispersion MLE (glmGamPoi)
    pub gp_maxit: usize,
    /// Log-likelihood change tolerance of the overdispersion MLE
    pub gp_tol: f64,
}

impl Default for ModelFitParams {
    fn default() -> Self {
        Self {
            irls: IrlsParams::default(),
            theta: ThetaParams::default(),
            theta_estimation: ThetaEstimation::MaximumLikelihood,
            theta_given: 100.0,
            shared_theta: SharedThetaParams::default(),
            nb_maxit: 25,
            nb_tol: 1e-8,
            gp_maxit: 100,
            gp_tol: 1e-6,
        }
    }
}

impl ModelFitParams {
    /// Same settings with looser solver tolerances and doubled iteration limits
    pub fn relaxed(&self, factor: f64) -> Self {
        Self {
            irls: self.irls.relaxed(factor),
            nb_maxit: self.nb_maxit * 2,
            nb_tol: self.nb_tol * factor,
            gp_maxit: self.gp_maxit * 2,
            gp_tol: self.gp_tol * factor,
            theta: ThetaParams {
                ml_limit: self.theta.ml_limit * 2,
                ..self.theta.clone()
            },
            ..self.clone()
        }
    }
}
