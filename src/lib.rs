//! rust_sctransform: regularized negative binomial variance stabilization
//!
//! Fits a model of count versus sequencing depth for every gene of a
//! single-cell count matrix, regularizes the per-gene parameters across genes
//! of similar mean expression, and returns Pearson residuals. Several fitting
//! methods can be run against the same matrix for comparison.
//!
//! # Example
//!
//! ```ignore
//! use rust_sctransform::prelude::*;
//!
//! let sim = simulate_counts(&SimulationParams::default())?;
//! let cell_attr = CellAttributes::from_counts(&sim.counts)?;
//!
//! let result = run_vst(&sim.counts, &cell_attr, FitMethod::Poisson, &VstParams::default())?;
//! println!("median residual variance {}", result.median_residual_variance());
//! ```

pub mod cli;
pub mod data;
pub mod error;
pub mod glm;
pub mod model;
pub mod regularize;
pub mod residuals;
pub mod rng;
pub mod stats;
pub mod theta;
pub mod vst;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::data::{simulate_counts, CellAttributes, CountMatrix, GeneStats, SimulatedData, SimulationParams};
    pub use crate::error::{Result, VstError};
    pub use crate::model::{FitError, FitMethod, GeneRawParams, ModelFitParams};
    pub use crate::regularize::{regularize, BandwidthRule, GeneRegularizedParams, RegularizeParams, ThetaRegularization};
    pub use crate::residuals::{compute_residuals, correct_counts, ResidualParams, ResidualSummary};
    pub use crate::theta::{estimate_shared_theta, SharedThetaParams, ThetaEstimation, ThetaParams, ThetaStrategy};
    pub use crate::vst::{
        run_methods, run_vst, run_vst_with_cancel, CancelToken, ConvergencePolicy, GeneAttr, MethodResult,
        TimingRecord, VstParams,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_full_pipeline() {
        let sim = simulate_counts(&SimulationParams {
            n_genes: 80,
            n_cells: 500,
            ..Default::default()
        })
        .unwrap();
        let umi = sim.log10_depth.iter().map(|d| 10f64.powf(*d)).collect();
        let cell_attr = CellAttributes::from_umi(umi).unwrap();

        let result = run_vst(&sim.counts, &cell_attr, FitMethod::Poisson, &VstParams::default()).unwrap();
        assert_eq!(result.residuals.as_ref().unwrap().nrows(), result.n_genes());

        // residuals under the regularized model are roughly standardized
        let v = result.median_residual_variance();
        assert!(v > 0.5 && v < 1.5, "median residual variance {}", v);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"method\":\"poisson\""));
    }

    #[test]
    fn test_user_covariate() {
        let sim = simulate_counts(&SimulationParams {
            n_genes: 30,
            n_cells: 300,
            ..Default::default()
        })
        .unwrap();
        let cell_attr = CellAttributes::from_counts(&sim.counts)
            .unwrap()
            .with_latent(sim.log10_depth.clone())
            .unwrap();
        assert!(cell_attr.has_user_latent());
        let result = run_vst(&sim.counts, &cell_attr, FitMethod::NbFast, &VstParams::default()).unwrap();
        assert_eq!(result.n_genes(), 30);
        for (g, attr) in result.gene_attr.iter().enumerate() {
            if !attr.fit_converged {
                continue;
            }
            let p = result.regularized_params[g];
            assert!((p.slope - sim.truth[g].slope).abs() < 0.5, "gene {} slope {}", g, p.slope);
        }
    }
}
