//! Fixed-coefficient offset model

use super::{FitError, GeneInput, GeneRawParams};

/// Slope of the offset model: expected count proportional to UMI
pub const OFFSET_SLOPE: f64 = std::f64::consts::LN_10;

/// `ln(gene_mean) - ln(mean_umi)`
pub fn offset_intercept(gene_mean: f64, mean_umi: f64) -> f64 {
    gene_mean.ln() - mean_umi.ln()
}

/// Offset parameters; no regression is run
pub fn fit_offset(gene: &GeneInput<'_>, mean_umi: f64, theta: f64) -> Result<GeneRawParams, FitError> {
    if !(gene.mean > 0.0) || !gene.mean.is_finite() {
        return Err(gene.degenerate("gene mean is zero"));
    }
    if !(mean_umi > 0.0) || !mean_umi.is_finite() {
        return Err(gene.degenerate("mean UMI is not positive"));
    }
    if !(theta > 0.0) || !theta.is_finite() {
        return Err(gene.degenerate("theta is not a positive finite number"));
    }
    Ok(GeneRawParams {
        intercept: offset_intercept(gene.mean, mean_umi),
        slope: OFFSET_SLOPE,
        theta,
        converged: true,
    })
}
