//! A single theta shared by every gene, estimated from well-detected genes

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{theta_ml, ThetaParams};
use crate::data::{CellAttributes, CountMatrix, GeneStats};
use crate::error::{Result, VstError};
use crate::glm::{fit_irls, GlmFamily, IrlsParams};
use crate::rng::MersenneTwister;

/// Parameters of the shared theta estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedThetaParams {
    /// Number of most highly expressed genes considered
    pub n_genes: usize,
    /// Minimum detection rate of a gene to be used
    pub min_detection_rate: f64,
    /// Number of cells drawn for the per-gene estimates (all cells if fewer)
    pub n_cells_subsample: usize,
    pub seed: u32,
}

impl Default for SharedThetaParams {
    fn default() -> Self {
        Self {
            n_genes: 250,
            min_detection_rate: 0.5,
            n_cells_subsample: 5000,
            seed: 1448145,
        }
    }
}

/// Genes used for the shared estimate: the top `n_genes` by mean, then
/// filtered by detection rate. Returned in descending mean order.
pub fn select_shared_theta_genes(stats: &[GeneStats], params: &SharedThetaParams) -> Vec<usize> {
    let mut order: Vec<usize> = (0..stats.len()).collect();
    order.sort_by(|&a, &b| {
        stats[b]
            .mean
            .partial_cmp(&stats[a].mean)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    order
        .into_iter()
        .take(params.n_genes)
        .filter(|&g| stats[g].detection_rate >= params.min_detection_rate)
        .collect()
}

/// Mean of per-gene ML thetas over a seeded cell subsample.
///
/// Each selected gene gets a Poisson fit on the subsample followed by an ML
/// theta on its fitted means; genes whose theta does not converge are skipped.
pub fn estimate_shared_theta(
    counts: &CountMatrix,
    cell_attr: &CellAttributes,
    stats: &[GeneStats],
    params: &SharedThetaParams,
    theta_params: &ThetaParams,
) -> Result<f64> {
    if params.n_cells_subsample == 0 {
        return Err(VstError::InvalidInput {
            reason: "n_cells_subsample must be positive".to_string(),
        });
    }
    if stats.len() != counts.n_genes() {
        return Err(VstError::DimensionMismatch {
            expected: format!("{} gene statistics", counts.n_genes()),
            got: format!("{} gene statistics", stats.len()),
        });
    }

    let genes = select_shared_theta_genes(stats, params);
    if genes.is_empty() {
        return Err(VstError::InsufficientData {
            reason: format!(
                "no gene among the top {} has detection rate >= {}",
                params.n_genes, params.min_detection_rate
            ),
        });
    }

    let mut rng = MersenneTwister::new(params.seed);
    let mut cells = rng.sample_without_replacement(counts.n_cells(), params.n_cells_subsample);
    cells.sort_unstable();
    let sub_attr = cell_attr.subset(&cells);
    let x = sub_attr.latent();

    log::debug!(
        "Shared theta: {} genes, {} of {} cells",
        genes.len(),
        cells.len(),
        counts.n_cells()
    );

    let irls = IrlsParams::default();
    let per_gene: Vec<Option<f64>> = genes
        .par_iter()
        .map(|&g| {
            let y = counts.gene_counts_subset(g, &cells);
            if y.iter().all(|&v| v == 0.0) {
                return None;
            }
            let fit = fit_irls(&y, x, GlmFamily::Poisson, None, &irls);
            if !fit.intercept.is_finite() || !fit.slope.is_finite() {
                return None;
            }
            theta_ml(&y, &fit.mu, theta_params).ok()
        })
        .collect();

    // Sum in gene order so the result does not depend on scheduling
    let thetas: Vec<f64> = per_gene.into_iter().flatten().collect();
    if thetas.is_empty() {
        return Err(VstError::InsufficientData {
            reason: "theta did not converge for any gene selected for the shared estimate".to_string(),
        });
    }
    let shared = thetas.iter().sum::<f64>() / thetas.len() as f64;
    log::info!("Shared theta {:.4} from {} genes", shared, thetas.len());
    Ok(shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{simulate_counts, SimulationParams};

    fn dataset() -> (CountMatrix, CellAttributes, Vec<GeneStats>) {
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
        (sim.counts, attr, stats)
    }

    #[test]
    fn test_selection_respects_top_k_and_detection() {
        let stats = vec![
            GeneStats { mean: 5.0, geometric_mean: 1.0, variance: 1.0, detection_rate: 0.9, n_detected: 9 },
            GeneStats { mean: 9.0, geometric_mean: 1.0, variance: 1.0, detection_rate: 0.2, n_detected: 2 },
            GeneStats { mean: 7.0, geometric_mean: 1.0, variance: 1.0, detection_rate: 0.6, n_detected: 6 },
            GeneStats { mean: 1.0, geometric_mean: 1.0, variance: 1.0, detection_rate: 1.0, n_detected: 10 },
        ];
        let params = SharedThetaParams { n_genes: 3, ..Default::default() };
        assert_eq!(select_shared_theta_genes(&stats, &params), vec![2, 0]);
    }

    #[test]
    fn test_same_seed_bit_identical() {
        let (counts, attr, stats) = dataset();
        let params = SharedThetaParams {
            n_cells_subsample: 150,
            seed: 99,
            ..Default::default()
        };
        let a = estimate_shared_theta(&counts, &attr, &stats, &params, &ThetaParams::default()).unwrap();
        let b = estimate_shared_theta(&counts, &attr, &stats, &params, &ThetaParams::default()).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
        assert!(a > 0.0 && a.is_finite());
    }

    #[test]
    fn test_subsample_larger_than_cells_uses_all() {
        let (counts, attr, stats) = dataset();
        let small = SharedThetaParams { n_cells_subsample: 400, seed: 1, ..Default::default() };
        let large = SharedThetaParams { n_cells_subsample: 100_000, seed: 2, ..Default::default() };
        let a = estimate_shared_theta(&counts, &attr, &stats, &small, &ThetaParams::default()).unwrap();
        let b = estimate_shared_theta(&counts, &attr, &stats, &large, &ThetaParams::default()).unwrap();
        // Both use every cell, so the seed no longer matters
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn test_no_detected_genes_is_insufficient() {
        let (counts, attr, stats) = dataset();
        let params = SharedThetaParams { min_detection_rate: 1.1, ..Default::default() };
        let result = estimate_shared_theta(&counts, &attr, &stats, &params, &ThetaParams::default());
        assert!(matches!(result, Err(VstError::InsufficientData { .. })));
    }
}
