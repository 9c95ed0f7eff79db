//! Per-cell attributes: sequencing depth and the latent regression covariate

use serde::{Deserialize, Serialize};

use super::CountMatrix;
use crate::error::{Result, VstError};
use crate::stats::median;

/// Per-cell depth information shared read-only by every gene fit.
///
/// `latent` is the regression covariate. It defaults to `log10(umi)`, so that a
/// slope of `ln(10)` means the expected count scales linearly with UMI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellAttributes {
    umi: Vec<f64>,
    latent: Vec<f64>,
    user_latent: bool,
}

impl CellAttributes {
    /// Derive depth from the column sums of the count matrix
    pub fn from_counts(counts: &CountMatrix) -> Result<Self> {
        Self::from_umi(counts.cell_totals())
    }

    /// Build from precomputed per-cell totals
    pub fn from_umi(umi: Vec<f64>) -> Result<Self> {
        if umi.is_empty() {
            return Err(VstError::InvalidInput {
                reason: "No cells supplied".to_string(),
            });
        }
        if let Some(pos) = umi.iter().position(|&u| !u.is_finite() || u <= 0.0) {
            return Err(VstError::InvalidInput {
                reason: format!(
                    "Cell {} has total count {}; every cell needs a positive total",
                    pos, umi[pos]
                ),
            });
        }
        let latent = umi.iter().map(|&u| u.log10()).collect();
        Ok(Self {
            umi,
            latent,
            user_latent: false,
        })
    }

    /// Replace the default covariate with a user-supplied one
    pub fn with_latent(mut self, latent: Vec<f64>) -> Result<Self> {
        if latent.len() != self.umi.len() {
            return Err(VstError::DimensionMismatch {
                expected: format!("{} latent values", self.umi.len()),
                got: format!("{} latent values", latent.len()),
            });
        }
        if latent.iter().any(|v| !v.is_finite()) {
            return Err(VstError::InvalidInput {
                reason: "Latent covariate must be finite".to_string(),
            });
        }
        self.latent = latent;
        self.user_latent = true;
        Ok(self)
    }

    pub fn n_cells(&self) -> usize {
        self.umi.len()
    }

    /// Total UMI per cell
    pub fn umi(&self) -> &[f64] {
        &self.umi
    }

    /// Regression covariate per cell
    pub fn latent(&self) -> &[f64] {
        &self.latent
    }

    pub fn has_user_latent(&self) -> bool {
        self.user_latent
    }

    /// Arithmetic mean of the linear-scale UMI
    pub fn mean_umi(&self) -> f64 {
        self.umi.iter().sum::<f64>() / self.umi.len() as f64
    }

    /// Median of the covariate
    pub fn median_latent(&self) -> f64 {
        median(&self.latent)
    }

    /// Restrict to a subset of cells, in the given order
    pub fn subset(&self, cells: &[usize]) -> Self {
        Self {
            umi: cells.iter().map(|&c| self.umi[c]).collect(),
            latent: cells.iter().map(|&c| self.latent[c]).collect(),
            user_latent: self.user_latent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_depth_is_log10_umi() {
        let dense = array![[10u32, 90], [0, 10]];
        let counts = CountMatrix::from_dense(
            dense.view(),
            vec!["g0".into(), "g1".into()],
            vec!["c0".into(), "c1".into()],
        )
        .unwrap();
        let attr = CellAttributes::from_counts(&counts).unwrap();
        assert_eq!(attr.umi(), &[10.0, 100.0]);
        assert!((attr.latent()[0] - 1.0).abs() < 1e-12);
        assert!((attr.latent()[1] - 2.0).abs() < 1e-12);
        assert!((attr.mean_umi() - 55.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_cell_rejected() {
        let result = CellAttributes::from_umi(vec![5.0, 0.0]);
        assert!(matches!(result, Err(VstError::InvalidInput { .. })));
    }

    #[test]
    fn test_user_latent_length_checked() {
        let attr = CellAttributes::from_umi(vec![5.0, 6.0]).unwrap();
        assert!(attr.clone().with_latent(vec![1.0]).is_err());
        let attr = attr.with_latent(vec![0.1, 0.2]).unwrap();
        assert!(attr.has_user_latent());
        assert_eq!(attr.latent(), &[0.1, 0.2]);
    }
}
