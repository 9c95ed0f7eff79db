//! Pearson residuals under the regularized model

use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{CellAttributes, CountMatrix};
use crate::error::{Result, VstError};
use crate::regularize::GeneRegularizedParams;
use crate::stats::finite_mean_variance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidualParams {
    /// Clip residuals into `[-clip, clip]`
    pub clip_residuals: bool,
    /// Clip bound; `sqrt(n_cells)` when unset
    pub clip: Option<f64>,
    /// Keep the genes x cells residual matrix in the result
    pub return_residuals: bool,
}

impl Default for ResidualParams {
    fn default() -> Self {
        Self {
            clip_residuals: true,
            clip: None,
            return_residuals: true,
        }
    }
}

impl ResidualParams {
    fn bound(&self, n_cells: usize) -> Option<f64> {
        if !self.clip_residuals {
            return None;
        }
        Some(self.clip.unwrap_or_else(|| (n_cells as f64).sqrt()))
    }
}

/// Residual matrix (optional) and per-gene residual moments
#[derive(Debug, Clone)]
pub struct ResidualSummary {
    pub residuals: Option<Array2<f64>>,
    pub mean: Vec<f64>,
    pub variance: Vec<f64>,
    /// Cells whose residual could not be computed
    pub n_non_finite: usize,
}

/// `(y - mu) / sqrt(mu + mu^2 / theta)`; NaN when the model value overflows
pub fn pearson_residual(y: f64, mu: f64, theta: f64) -> f64 {
    let var = mu + mu * mu / theta;
    if !mu.is_finite() || !var.is_finite() || !(var > 0.0) {
        return f64::NAN;
    }
    (y - mu) / var.sqrt()
}

fn check_lengths(counts: &CountMatrix, cell_attr: &CellAttributes, params: &[GeneRegularizedParams]) -> Result<()> {
    if params.len() != counts.n_genes() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} genes", counts.n_genes()),
            got: format!("{} parameter rows", params.len()),
        });
    }
    if cell_attr.n_cells() != counts.n_cells() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} cells", counts.n_cells()),
            got: format!("{} cell attributes", cell_attr.n_cells()),
        });
    }
    Ok(())
}

fn gene_residuals(y: &[f64], x: &[f64], p: &GeneRegularizedParams, bound: Option<f64>) -> Vec<f64> {
    y.iter()
        .zip(x.iter())
        .map(|(&yi, &xi)| {
            let mu = (p.intercept + p.slope * xi).exp();
            let r = pearson_residual(yi, mu, p.theta);
            match bound {
                Some(b) if r.is_finite() => r.clamp(-b, b),
                _ => r,
            }
        })
        .collect()
}

/// Pearson residuals of every gene, in parallel over genes
pub fn compute_residuals(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    params: &[GeneRegularizedParams],
    residual_params: &ResidualParams,
) -> Result<ResidualSummary> {
    check_lengths(counts, cell_attr, params)?;
    let n_genes = counts.n_genes();
    let n_cells = counts.n_cells();
    let bound = residual_params.bound(n_cells);
    let x = cell_attr.latent();

    let rows: Vec<(Vec<f64>, f64, f64, usize)> = (0..n_genes)
        .into_par_iter()
        .map(|g| {
            let y = counts.gene_counts(g);
            let r = gene_residuals(&y, x, &params[g], bound);
            let bad = r.iter().filter(|v| !v.is_finite()).count();
            let (mean, variance) = finite_mean_variance(&r);
            (r, mean, variance, bad)
        })
        .collect();

    let n_non_finite: usize = rows.iter().map(|r| r.3).sum();
    if n_non_finite > 0 {
        log::warn!("{} residuals could not be computed and were set to NaN", n_non_finite);
    }

    let mean = rows.iter().map(|r| r.1).collect();
    let variance = rows.iter().map(|r| r.2).collect();
    let residuals = if residual_params.return_residuals {
        let flat: Vec<f64> = rows.into_iter().flat_map(|r| r.0).collect();
        let matrix = Array2::from_shape_vec((n_genes, n_cells), flat).map_err(|e| VstError::NumericOverflow {
            operation: "residual matrix".to_string(),
            details: e.to_string(),
        })?;
        Some(matrix)
    } else {
        None
    };

    Ok(ResidualSummary {
        residuals,
        mean,
        variance,
        n_non_finite,
    })
}

/// Counts every cell would show at the median covariate:
/// `max(0, round(mu_med + r * sd_med))`. A NaN residual or non-finite
/// parameters stay NaN.
pub fn correct_counts(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    params: &[GeneRegularizedParams],
    residuals: &Array2<f64>,
) -> Result<Array2<f64>> {
    check_lengths(counts, cell_attr, params)?;
    if residuals.dim() != (counts.n_genes(), counts.n_cells()) {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} x {} residuals", counts.n_genes(), counts.n_cells()),
            got: format!("{} x {}", residuals.nrows(), residuals.ncols()),
        });
    }
    let median_x = cell_attr.median_latent();
    let n_cells = counts.n_cells();

    let flat: Vec<f64> = (0..counts.n_genes())
        .into_par_iter()
        .flat_map(|g| {
            let p = params[g];
            let mu = (p.intercept + p.slope * median_x).exp();
            let sd = (mu + mu * mu / p.theta).sqrt();
            (0..n_cells)
                .map(|c| {
                    let v = mu + residuals[[g, c]] * sd;
                    if v.is_finite() {
                        v.round().max(0.0)
                    } else {
                        f64::NAN
                    }
                })
                .collect::<Vec<f64>>()
        })
        .collect();

    Array2::from_shape_vec((counts.n_genes(), n_cells), flat).map_err(|e| VstError::NumericOverflow {
        operation: "corrected counts".to_string(),
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{simulate_counts, SimulationParams};
    use ndarray::array;

    fn simulated() -> (CountMatrix, CellAttributes, Vec<GeneRegularizedParams>) {
        let sim = simulate_counts(&SimulationParams {
            n_genes: 4,
            n_cells: 3000,
            log10_fraction_range: (-2.5, -1.5),
            ..Default::default()
        })
        .unwrap();
        let attr = CellAttributes::from_counts(&sim.counts)
            .unwrap()
            .with_latent(sim.log10_depth.clone())
            .unwrap();
        let params = sim
            .truth
            .iter()
            .map(|t| GeneRegularizedParams {
                intercept: t.intercept,
                slope: t.slope,
                theta: t.theta,
            })
            .collect();
        (sim.counts, attr, params)
    }

    #[test]
    fn test_true_model_gives_standardized_residuals() {
        let (counts, attr, params) = simulated();
        let summary = compute_residuals(&counts, &attr, &params, &ResidualParams::default()).unwrap();
        for g in 0..counts.n_genes() {
            assert!(summary.mean[g].abs() < 0.1, "gene {} mean {}", g, summary.mean[g]);
            assert!(
                (summary.variance[g] - 1.0).abs() < 0.2,
                "gene {} variance {}",
                g,
                summary.variance[g]
            );
        }
        assert_eq!(summary.residuals.unwrap().dim(), (4, 3000));
    }

    #[test]
    fn test_clipping() {
        let counts = CountMatrix::from_dense(
            array![[0u32, 0, 0, 1000]].view(),
            vec!["g".to_string()],
            (0..4).map(|i| format!("c{}", i)).collect(),
        )
        .unwrap();
        let attr = CellAttributes::from_umi(vec![100.0; 4]).unwrap();
        let params = vec![GeneRegularizedParams {
            intercept: 0.0,
            slope: 0.0,
            theta: 100.0,
        }];
        let clipped = compute_residuals(&counts, &attr, &params, &ResidualParams::default()).unwrap();
        let r = clipped.residuals.unwrap();
        assert_eq!(r[[0, 3]], 2.0);

        let raw = ResidualParams {
            clip_residuals: false,
            ..Default::default()
        };
        let r = compute_residuals(&counts, &attr, &params, &raw).unwrap().residuals.unwrap();
        assert!(r[[0, 3]] > 100.0);
    }

    #[test]
    fn test_overflow_becomes_nan() {
        assert!(pearson_residual(1.0, f64::INFINITY, 10.0).is_nan());
        assert!((pearson_residual(3.0, 1.0, f64::INFINITY) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_params_give_nan_moments() {
        let (counts, attr, mut params) = simulated();
        params[1] = GeneRegularizedParams::missing();
        let summary = compute_residuals(
            &counts,
            &attr,
            &params,
            &ResidualParams {
                return_residuals: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(summary.mean[1].is_nan());
        assert!(summary.residuals.is_none());
        assert_eq!(summary.n_non_finite, 3000);
    }

    #[test]
    fn test_corrected_counts_are_non_negative_integers() {
        let (counts, attr, params) = simulated();
        let summary = compute_residuals(&counts, &attr, &params, &ResidualParams::default()).unwrap();
        let corrected = correct_counts(&counts, &attr, &params, summary.residuals.as_ref().unwrap()).unwrap();
        assert!(corrected.iter().all(|&v| v >= 0.0 && v.fract() == 0.0));
    }

    #[test]
    fn test_corrected_counts_keep_nan() {
        let (counts, attr, mut params) = simulated();
        let summary = compute_residuals(&counts, &attr, &params, &ResidualParams::default()).unwrap();
        let mut residuals = summary.residuals.unwrap();
        residuals[[0, 7]] = f64::NAN;
        params[3] = GeneRegularizedParams::missing();
        let corrected = correct_counts(&counts, &attr, &params, &residuals).unwrap();
        assert!(corrected[[0, 7]].is_nan());
        assert!(corrected[[0, 8]] >= 0.0);
        assert!(corrected.row(3).iter().all(|v| v.is_nan()));
        assert!(corrected.row(1).iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_dimension_mismatch() {
        let (counts, attr, mut params) = simulated();
        params.pop();
        assert!(matches!(
            compute_residuals(&counts, &attr, &params, &ResidualParams::default()),
            Err(VstError::DimensionMismatch { .. })
        ));
    }
}
