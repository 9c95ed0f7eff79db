//! Cross-gene regularization of raw per-gene parameters
//!
//! Each parameter is smoothed against log10 gene mean with a normal-kernel
//! Nadaraya-Watson estimator trained on the genes whose raw fit is valid, then
//! evaluated at every gene, including the ones whose fit failed.

mod kernel;
mod outliers;

use serde::{Deserialize, Serialize};

pub use kernel::{KernelSmoother, KERNEL_SD_SCALE};
pub use outliers::is_outlier;

use crate::error::{Result, VstError};
use crate::model::GeneRawParams;
use crate::stats::silverman_bandwidth;
use crate::theta::ThetaParams;

/// Bandwidth selection for the smoother
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BandwidthRule {
    /// Silverman's rule on the training log-means, times `bw_adjust`
    Silverman,
    /// Used as given
    Fixed(f64),
}

/// Scale on which theta is smoothed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThetaRegularization {
    /// `ln(theta)`
    #[default]
    LogTheta,
    /// `log10(1 + mean / theta)`
    OdFactor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularizeParams {
    pub bandwidth: BandwidthRule,
    pub bw_adjust: f64,
    pub exclude_outliers: bool,
    pub outlier_threshold: f64,
    /// Fewest valid genes the smoother accepts
    pub min_genes: usize,
    pub theta_regularization: ThetaRegularization,
    pub theta: ThetaParams,
}

impl Default for RegularizeParams {
    fn default() -> Self {
        Self {
            bandwidth: BandwidthRule::Silverman,
            bw_adjust: 3.0,
            exclude_outliers: true,
            outlier_threshold: 10.0,
            min_genes: 2,
            theta_regularization: ThetaRegularization::LogTheta,
            theta: ThetaParams::default(),
        }
    }
}

/// Smoothed parameters of one gene
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneRegularizedParams {
    pub intercept: f64,
    pub slope: f64,
    pub theta: f64,
}

impl GeneRegularizedParams {
    pub fn missing() -> Self {
        Self {
            intercept: f64::NAN,
            slope: f64::NAN,
            theta: f64::NAN,
        }
    }
}

/// Which raw parameter is being smoothed
#[derive(Debug, Clone, Copy)]
enum Component {
    Intercept,
    Slope,
    Theta,
}

impl Component {
    fn name(&self) -> &'static str {
        match self {
            Component::Intercept => "intercept",
            Component::Slope => "slope",
            Component::Theta => "theta",
        }
    }
}

fn theta_to_scale(theta: f64, log_mean: f64, rule: ThetaRegularization) -> f64 {
    match rule {
        ThetaRegularization::LogTheta => theta.ln(),
        ThetaRegularization::OdFactor => (1.0 + 10f64.powf(log_mean) / theta).log10(),
    }
}

fn theta_from_scale(value: f64, log_mean: f64, rule: ThetaRegularization, params: &ThetaParams) -> f64 {
    if !value.is_finite() {
        return f64::NAN;
    }
    match rule {
        ThetaRegularization::LogTheta => params.clamp(value.exp()),
        ThetaRegularization::OdFactor => {
            let denom = 10f64.powf(value) - 1.0;
            if denom > 0.0 {
                params.clamp(10f64.powf(log_mean) / denom)
            } else {
                params.max_theta
            }
        }
    }
}

fn resolve_bandwidth(train_x: &[f64], params: &RegularizeParams) -> Result<f64> {
    match params.bandwidth {
        BandwidthRule::Silverman => Ok(silverman_bandwidth(train_x) * params.bw_adjust),
        BandwidthRule::Fixed(h) if h > 0.0 && h.is_finite() => Ok(h),
        BandwidthRule::Fixed(h) => Err(VstError::InvalidInput {
            reason: format!("bandwidth must be positive and finite, got {}", h),
        }),
    }
}

/// Regularize raw parameters against `log_gene_mean` (log10 of the gene mean).
///
/// Fails with `InsufficientData` when fewer than `min_genes` genes have a
/// valid raw fit. Genes with a non-finite log-mean come back as NaN.
pub fn regularize(
    raw: &[GeneRawParams],
    log_gene_mean: &[f64],
    params: &RegularizeParams,
) -> Result<Vec<GeneRegularizedParams>> {
    if raw.len() != log_gene_mean.len() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} gene means", raw.len()),
            got: format!("{} gene means", log_gene_mean.len()),
        });
    }
    if !(params.bw_adjust > 0.0) {
        return Err(VstError::InvalidInput {
            reason: format!("bw_adjust must be positive, got {}", params.bw_adjust),
        });
    }

    let training: Vec<usize> = (0..raw.len())
        .filter(|&g| raw[g].is_valid() && log_gene_mean[g].is_finite())
        .collect();
    if training.len() < params.min_genes.max(1) {
        return Err(VstError::InsufficientData {
            reason: format!(
                "{} genes with a valid fit, regularization needs at least {}",
                training.len(),
                params.min_genes
            ),
        });
    }

    let train_x: Vec<f64> = training.iter().map(|&g| log_gene_mean[g]).collect();
    let bandwidth = resolve_bandwidth(&train_x, params)?;
    let outlier_bw = silverman_bandwidth(&train_x);
    log::debug!(
        "Regularizing {} genes trained on {} (bandwidth {:.4})",
        raw.len(),
        training.len(),
        bandwidth
    );

    let rule = params.theta_regularization;
    let smooth = |component: Component| -> Result<Vec<f64>> {
        let train_y: Vec<f64> = training
            .iter()
            .map(|&g| match component {
                Component::Intercept => raw[g].intercept,
                Component::Slope => raw[g].slope,
                Component::Theta => theta_to_scale(raw[g].theta, log_gene_mean[g], rule),
            })
            .collect();

        let (x, y) = if params.exclude_outliers {
            let flags = is_outlier(&train_y, &train_x, outlier_bw, params.outlier_threshold);
            let n_out = flags.iter().filter(|&&f| f).count();
            if n_out > 0 && train_y.len() - n_out >= params.min_genes {
                log::debug!("Excluding {} outlier genes for {}", n_out, component.name());
                let keep = |v: &[f64]| -> Vec<f64> {
                    v.iter().zip(flags.iter()).filter(|&(_, &f)| !f).map(|(&a, _)| a).collect()
                };
                (keep(&train_x), keep(&train_y))
            } else {
                (train_x.clone(), train_y)
            }
        } else {
            (train_x.clone(), train_y)
        };

        let smoother = KernelSmoother::new(&x, &y, bandwidth).ok_or_else(|| VstError::InsufficientData {
            reason: format!("no finite training values for {}", component.name()),
        })?;
        Ok(smoother.eval_many(log_gene_mean))
    };

    let intercept = smooth(Component::Intercept)?;
    let slope = smooth(Component::Slope)?;
    let theta_scale = smooth(Component::Theta)?;

    let out = (0..raw.len())
        .map(|g| {
            if !log_gene_mean[g].is_finite() {
                return GeneRegularizedParams::missing();
            }
            GeneRegularizedParams {
                intercept: intercept[g],
                slope: slope[g],
                theta: theta_from_scale(theta_scale[g], log_gene_mean[g], rule, &params.theta),
            }
        })
        .collect();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(intercept: f64, slope: f64, theta: f64) -> GeneRawParams {
        GeneRawParams {
            intercept,
            slope,
            theta,
            converged: true,
        }
    }

    fn trend(n: usize) -> (Vec<GeneRawParams>, Vec<f64>) {
        let log_mean: Vec<f64> = (0..n).map(|i| -2.0 + 4.0 * i as f64 / (n - 1) as f64).collect();
        let params = log_mean
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                let wiggle = if i % 2 == 0 { 0.05 } else { -0.05 };
                raw(-8.0 + m + wiggle, 2.3 + wiggle, (1.0 + m).exp())
            })
            .collect();
        (params, log_mean)
    }

    /// Raw slopes following a sine of the log-mean, so neighbourhoods differ
    fn wavy_trend(n: usize) -> (Vec<GeneRawParams>, Vec<f64>) {
        let log_mean: Vec<f64> = (0..n).map(|i| -2.0 + 4.0 * i as f64 / (n - 1) as f64).collect();
        let params = log_mean
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                let wiggle = if i % 3 == 0 { 0.1 } else { -0.05 };
                raw(-8.0 + m, 2.3 + (3.0 * m).sin() + wiggle, (1.0 + m).exp())
            })
            .collect();
        (params, log_mean)
    }

    fn assert_within_kernel_windows(params: &[GeneRawParams], log_mean: &[f64], p: &RegularizeParams) -> usize {
        let bw = resolve_bandwidth(log_mean, p).unwrap();
        let half_width = 4.0 * KERNEL_SD_SCALE * bw;
        let reg = regularize(params, log_mean, p).unwrap();
        let global_lo = params.iter().map(|r| r.slope).fold(f64::INFINITY, f64::min);
        let global_hi = params.iter().map(|r| r.slope).fold(f64::NEG_INFINITY, f64::max);

        let mut narrower = 0;
        for (g, r) in reg.iter().enumerate() {
            let window: Vec<f64> = (0..params.len())
                .filter(|&j| (log_mean[j] - log_mean[g]).abs() <= half_width)
                .map(|j| params[j].slope)
                .collect();
            let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            assert!(
                r.slope >= lo - 1e-12 && r.slope <= hi + 1e-12,
                "gene {}: {} outside [{}, {}]",
                g,
                r.slope,
                lo,
                hi
            );
            if hi - lo < 0.9 * (global_hi - global_lo) {
                narrower += 1;
            }
        }
        narrower
    }

    #[test]
    fn test_regularized_values_stay_in_window_range() {
        let (params, log_mean) = wavy_trend(200);
        let silverman = RegularizeParams {
            exclude_outliers: false,
            ..Default::default()
        };
        assert_within_kernel_windows(&params, &log_mean, &silverman);

        let narrow = RegularizeParams {
            bandwidth: BandwidthRule::Fixed(0.2),
            exclude_outliers: false,
            ..Default::default()
        };
        // the local bound is tighter than the global one for most genes
        let narrower = assert_within_kernel_windows(&params, &log_mean, &narrow);
        assert!(narrower > 150, "{} of 200 windows narrower than the global range", narrower);
    }

    #[test]
    fn test_alternating_noise_averages_out() {
        let (params, log_mean) = trend(200);
        let reg = regularize(&params, &log_mean, &RegularizeParams::default()).unwrap();
        assert!((reg[100].slope - 2.3).abs() < 0.01);
        assert!(reg.iter().all(|r| r.theta > 0.0 && r.theta.is_finite()));
    }

    #[test]
    fn test_failed_genes_are_interpolated() {
        let (mut params, log_mean) = trend(100);
        params[50] = GeneRawParams::missing();
        let reg = regularize(&params, &log_mean, &RegularizeParams::default()).unwrap();
        assert!(reg[50].intercept.is_finite());
        assert!((reg[50].intercept - (reg[49].intercept + reg[51].intercept) / 2.0).abs() < 0.05);
    }

    #[test]
    fn test_too_few_valid_genes() {
        let params = vec![raw(1.0, 2.0, 3.0), GeneRawParams::missing()];
        let err = regularize(&params, &[0.0, 1.0], &RegularizeParams::default()).unwrap_err();
        assert!(matches!(err, VstError::InsufficientData { .. }));
    }

    #[test]
    fn test_outlier_does_not_pull_trend() {
        let (mut params, log_mean) = trend(200);
        params[120].slope = 500.0;
        let reg = regularize(&params, &log_mean, &RegularizeParams::default()).unwrap();
        assert!((reg[120].slope - 2.3).abs() < 0.05, "slope {}", reg[120].slope);
    }

    #[test]
    fn test_non_finite_mean_is_missing() {
        let (params, mut log_mean) = trend(50);
        log_mean[3] = f64::NEG_INFINITY;
        let reg = regularize(&params, &log_mean, &RegularizeParams::default()).unwrap();
        assert!(reg[3].intercept.is_nan() && reg[3].theta.is_nan());
        assert!(reg[4].intercept.is_finite());
    }

    #[test]
    fn test_fixed_bandwidth_validation() {
        let (params, log_mean) = trend(20);
        let bad = RegularizeParams {
            bandwidth: BandwidthRule::Fixed(0.0),
            ..Default::default()
        };
        assert!(matches!(
            regularize(&params, &log_mean, &bad),
            Err(VstError::InvalidInput { .. })
        ));
        let good = RegularizeParams {
            bandwidth: BandwidthRule::Fixed(0.5),
            ..Default::default()
        };
        assert!(regularize(&params, &log_mean, &good).is_ok());
    }

    #[test]
    fn test_od_factor_theta_positive() {
        let (params, log_mean) = trend(80);
        let p = RegularizeParams {
            theta_regularization: ThetaRegularization::OdFactor,
            ..Default::default()
        };
        let reg = regularize(&params, &log_mean, &p).unwrap();
        assert!(reg.iter().all(|r| r.theta > 0.0 && r.theta.is_finite()));
    }
}
