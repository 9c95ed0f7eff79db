//! Run orchestration: fit every gene, regularize, compute residuals
//!
//! Per-gene fits and residuals run as rayon parallel iterators over gene
//! indices; the collect of each phase is the join point at which the timing
//! checkpoint is taken.

pub mod timing;

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use timing::{Checkpoint, TimingRecord};

pub use crate::model::CancelToken;

use crate::data::{CellAttributes, CountMatrix};
use crate::error::{Result, VstError};
use crate::model::{FitError, FitMethod, GeneInput, GeneRawParams, ModelFitParams, RunConstants};
use crate::regularize::{regularize, GeneRegularizedParams, RegularizeParams};
use crate::residuals::{compute_residuals, ResidualParams};
use crate::stats::median;
use crate::theta::{validate_theta, SharedThetaParams, ThetaEstimation, ThetaParams};

/// What to do with a gene whose fit fails
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum ConvergencePolicy {
    /// NaN raw parameters; the gene is regularized by interpolation
    #[default]
    MarkMissing,
    /// Retry once with tolerances scaled by `factor` and doubled iteration limits
    RetryRelaxed { factor: f64 },
    /// Refit with another method
    Fallback(FitMethod),
}

/// Configurable parameters for a VST run.
///
/// The top-level theta settings override the matching fields of the
/// sub-parameter structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VstParams {
    pub theta_estimation: ThetaEstimation,
    pub theta_given: f64,
    pub n_genes_for_shared_theta: usize,
    pub shared_theta_min_detection: f64,
    pub n_cells_subsample: usize,
    pub random_seed: u32,
    pub theta: ThetaParams,
    /// Genes detected in fewer cells are not fitted; they are reported with
    /// NaN parameters and counted as failed
    pub min_cells: usize,
    pub return_residuals: bool,
    /// Worker threads; 0 uses the global rayon pool
    pub n_threads: usize,
    pub policy: ConvergencePolicy,
    pub model: ModelFitParams,
    pub regularize: RegularizeParams,
    pub residuals: ResidualParams,
}

impl Default for VstParams {
    fn default() -> Self {
        let shared = SharedThetaParams::default();
        Self {
            theta_estimation: ThetaEstimation::MaximumLikelihood,
            theta_given: 100.0,
            n_genes_for_shared_theta: shared.n_genes,
            shared_theta_min_detection: shared.min_detection_rate,
            n_cells_subsample: shared.n_cells_subsample,
            random_seed: shared.seed,
            theta: ThetaParams::default(),
            min_cells: 0,
            return_residuals: true,
            n_threads: 0,
            policy: ConvergencePolicy::MarkMissing,
            model: ModelFitParams::default(),
            regularize: RegularizeParams::default(),
            residuals: ResidualParams::default(),
        }
    }
}

impl VstParams {
    pub fn validate(&self) -> Result<()> {
        validate_theta(self.theta_given)?;
        if self.n_genes_for_shared_theta == 0 {
            return Err(VstError::InvalidInput {
                reason: "n_genes_for_shared_theta must be positive".to_string(),
            });
        }
        if self.n_cells_subsample == 0 {
            return Err(VstError::InvalidInput {
                reason: "n_cells_subsample must be positive".to_string(),
            });
        }
        if !(self.theta.min_theta > 0.0) || !(self.theta.max_theta > self.theta.min_theta) {
            return Err(VstError::InvalidInput {
                reason: format!(
                    "theta bounds must satisfy 0 < min_theta < max_theta, got [{}, {}]",
                    self.theta.min_theta, self.theta.max_theta
                ),
            });
        }
        if let ConvergencePolicy::RetryRelaxed { factor } = self.policy {
            if !(factor >= 1.0) {
                return Err(VstError::InvalidInput {
                    reason: format!("relaxation factor must be >= 1, got {}", factor),
                });
            }
        }
        Ok(())
    }

    fn model_params(&self) -> ModelFitParams {
        ModelFitParams {
            theta: self.theta.clone(),
            theta_estimation: self.theta_estimation,
            theta_given: self.theta_given,
            shared_theta: self.shared_theta_params(),
            ..self.model.clone()
        }
    }

    fn regularize_params(&self) -> RegularizeParams {
        RegularizeParams {
            theta: self.theta.clone(),
            ..self.regularize.clone()
        }
    }

    fn residual_params(&self) -> ResidualParams {
        ResidualParams {
            return_residuals: self.return_residuals,
            ..self.residuals.clone()
        }
    }

    fn shared_theta_params(&self) -> SharedThetaParams {
        SharedThetaParams {
            n_genes: self.n_genes_for_shared_theta,
            min_detection_rate: self.shared_theta_min_detection,
            n_cells_subsample: self.n_cells_subsample,
            seed: self.random_seed,
        }
    }
}

/// Input summaries and residual moments of one gene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneAttr {
    pub gene_id: String,
    pub mean: f64,
    pub geometric_mean: f64,
    pub variance: f64,
    pub detection_rate: f64,
    pub residual_mean: f64,
    pub residual_variance: f64,
    pub fit_converged: bool,
}

/// Output of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodResult {
    pub method: FitMethod,
    pub gene_attr: Vec<GeneAttr>,
    pub raw_params: Vec<GeneRawParams>,
    pub regularized_params: Vec<GeneRegularizedParams>,
    pub timing: TimingRecord,
    #[serde(skip)]
    pub residuals: Option<Array2<f64>>,
    pub n_failed_genes: usize,
    pub theta_shared: Option<f64>,
}

impl MethodResult {
    pub fn n_genes(&self) -> usize {
        self.gene_attr.len()
    }

    /// Median residual variance over genes with a finite value
    pub fn median_residual_variance(&self) -> f64 {
        let v: Vec<f64> = self
            .gene_attr
            .iter()
            .map(|g| g.residual_variance)
            .filter(|v| v.is_finite())
            .collect();
        median(&v)
    }
}

/// Run one method over all genes
pub fn run_vst(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    method: FitMethod,
    params: &VstParams,
) -> Result<MethodResult> {
    run_vst_with_cancel(counts, cell_attr, method, params, &CancelToken::new())
}

/// [`run_vst`] with a cancellation token checked before every gene fit and
/// inside the iterative fits
pub fn run_vst_with_cancel(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    method: FitMethod,
    params: &VstParams,
    cancel: &CancelToken,
) -> Result<MethodResult> {
    params.validate()?;
    if cell_attr.n_cells() != counts.n_cells() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} cells", counts.n_cells()),
            got: format!("{} cell attributes", cell_attr.n_cells()),
        });
    }

    if params.n_threads > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.n_threads)
            .build()
            .map_err(|e| VstError::ThreadPool(e.to_string()))?;
        pool.install(|| run_inner(counts, cell_attr, method, params, cancel))
    } else {
        run_inner(counts, cell_attr, method, params, cancel)
    }
}

/// Run several methods back to back against the same matrix
pub fn run_methods(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    methods: &[FitMethod],
    params: &VstParams,
) -> Result<Vec<MethodResult>> {
    methods
        .iter()
        .map(|&m| run_vst(counts, cell_attr, m, params))
        .collect()
}

fn fit_with_policy(
    method: FitMethod,
    gene: &GeneInput<'_>,
    params: &ModelFitParams,
    run: &RunConstants,
    policy: ConvergencePolicy,
) -> std::result::Result<GeneRawParams, FitError> {
    let err = match method.fit(gene, params, run) {
        Ok(p) => return Ok(p),
        Err(e) => e,
    };
    match policy {
        ConvergencePolicy::RetryRelaxed { factor } if matches!(err, FitError::NonConvergence { .. }) => {
            log::debug!("retrying {} with tolerances relaxed by {}", gene.id, factor);
            method.fit(gene, &params.relaxed(factor), run)
        }
        ConvergencePolicy::Fallback(other) if other != method && !matches!(err, FitError::Cancelled) => {
            log::debug!("refitting {} with {}", gene.id, other);
            other.fit(gene, params, run)
        }
        _ => Err(err),
    }
}

fn run_inner(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    method: FitMethod,
    params: &VstParams,
    cancel: &CancelToken,
) -> Result<MethodResult> {
    let mut timing = TimingRecord::start();
    log::info!(
        "Running {} on {} genes x {} cells",
        method,
        counts.n_genes(),
        counts.n_cells()
    );

    let stats = counts.all_gene_stats();
    let fitted: Vec<bool> = stats.iter().map(|s| s.n_detected >= params.min_cells).collect();
    let n_fitted = fitted.iter().filter(|&&f| f).count();
    if n_fitted == 0 {
        return Err(VstError::InsufficientData {
            reason: format!("no gene is detected in at least {} cells", params.min_cells),
        });
    }
    if n_fitted < counts.n_genes() {
        log::info!(
            "{} of {} genes are detected in fewer than {} cells and are not fitted",
            counts.n_genes() - n_fitted,
            counts.n_genes(),
            params.min_cells
        );
    }

    let model_params = params.model_params();
    let mut run = RunConstants {
        mean_umi: cell_attr.mean_umi(),
        cancel: Some(cancel),
        ..Default::default()
    };
    let fallback = match params.policy {
        ConvergencePolicy::Fallback(m) => Some(m),
        _ => None,
    };
    for m in std::iter::once(method).chain(fallback) {
        if let Some(strategy) = m.population_theta_strategy(&model_params) {
            if run.population_theta(&strategy).is_none() {
                let theta = strategy.resolve(counts, cell_attr, &stats, &params.theta)?;
                run.set_population_theta(&strategy, theta);
            }
        }
    }
    let theta_shared = run.shared_theta;

    let x = cell_attr.latent();
    let gene_ids = counts.gene_ids();
    let fits: Vec<std::result::Result<GeneRawParams, FitError>> = (0..counts.n_genes())
        .into_par_iter()
        .map(|g| {
            if cancel.is_cancelled() {
                return Err(FitError::Cancelled);
            }
            if !fitted[g] {
                return Err(FitError::Degenerate {
                    gene: gene_ids[g].clone(),
                    reason: format!(
                        "detected in {} cells, fewer than {}",
                        stats[g].n_detected, params.min_cells
                    ),
                });
            }
            let y = counts.gene_counts(g);
            let gene = GeneInput {
                id: &gene_ids[g],
                y: &y,
                x,
                mean: stats[g].mean,
            };
            fit_with_policy(method, &gene, &model_params, &run, params.policy)
        })
        .collect();

    if cancel.is_cancelled() || fits.iter().any(|f| matches!(f, Err(FitError::Cancelled))) {
        log::info!("{} run cancelled", method);
        return Err(VstError::Cancelled);
    }

    let mut n_failed = 0;
    let raw_params: Vec<GeneRawParams> = fits
        .into_iter()
        .map(|f| match f {
            Ok(p) => p,
            Err(e) => {
                log::debug!("{}", e);
                n_failed += 1;
                GeneRawParams::missing()
            }
        })
        .collect();
    if n_failed > 0 {
        log::warn!("{} of {} genes could not be fitted with {}", n_failed, raw_params.len(), method);
    }
    timing.checkpoint(timing::MODEL_FIT_DONE);

    let regularized_params = if method.is_regression() {
        // genes left unfitted are not interpolated
        let log_gene_mean: Vec<f64> = stats
            .iter()
            .zip(fitted.iter())
            .map(|(s, &f)| if f { s.geometric_mean.log10() } else { f64::NAN })
            .collect();
        regularize(&raw_params, &log_gene_mean, &params.regularize_params())?
    } else {
        raw_params
            .iter()
            .map(|p| {
                if p.is_valid() {
                    GeneRegularizedParams {
                        intercept: p.intercept,
                        slope: p.slope,
                        theta: p.theta,
                    }
                } else {
                    GeneRegularizedParams::missing()
                }
            })
            .collect()
    };
    timing.checkpoint(timing::REGULARIZE_DONE);

    if cancel.is_cancelled() {
        return Err(VstError::Cancelled);
    }
    let summary = compute_residuals(counts, cell_attr, &regularized_params, &params.residual_params())?;
    timing.checkpoint(timing::RESIDUALS_DONE);

    let gene_attr = (0..counts.n_genes())
        .map(|g| GeneAttr {
            gene_id: gene_ids[g].clone(),
            mean: stats[g].mean,
            geometric_mean: stats[g].geometric_mean,
            variance: stats[g].variance,
            detection_rate: stats[g].detection_rate,
            residual_mean: summary.mean[g],
            residual_variance: summary.variance[g],
            fit_converged: raw_params[g].converged,
        })
        .collect();
    timing.checkpoint(timing::DONE);
    log::info!("{} finished in {:.3}s", method, timing.total());

    Ok(MethodResult {
        method,
        gene_attr,
        raw_params,
        regularized_params,
        timing,
        residuals: summary.residuals,
        n_failed_genes: n_failed,
        theta_shared,
    })
}
