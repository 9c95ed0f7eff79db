//! Sparse UMI count matrix for single-cell data

use std::collections::HashMap;

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};

use crate::error::{Result, VstError};

/// Deduplicate names by appending _1, _2, etc. to duplicates
fn deduplicate_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for name in &names {
        *seen.entry(name.clone()).or_insert(0) += 1;
    }
    if !seen.values().any(|&c| c > 1) {
        return names;
    }
    seen.clear();
    let mut result = Vec::with_capacity(names.len());
    for name in names {
        let count = seen.entry(name.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            result.push(name);
        } else {
            let new_name = format!("{}_{}", name, *count - 1);
            log::warn!("Duplicate gene name '{}' renamed to '{}'", name, new_name);
            result.push(new_name);
        }
    }
    result
}

/// Per-gene summary statistics over all cells
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeneStats {
    /// Arithmetic mean count
    pub mean: f64,
    /// exp(mean(ln(x + 1))) - 1
    pub geometric_mean: f64,
    /// Sample variance (n - 1 denominator)
    pub variance: f64,
    /// Fraction of cells with a non-zero count
    pub detection_rate: f64,
    /// Number of cells with a non-zero count
    pub n_detected: usize,
}

/// A UMI count matrix. Rows are genes, columns are cells.
///
/// Storage is CSR so that one gene's counts are contiguous.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts: CsMat<u32>,
    gene_ids: Vec<String>,
    cell_ids: Vec<String>,
}

impl CountMatrix {
    /// Create a count matrix from an existing sparse matrix (CSR or CSC)
    pub fn new(counts: CsMat<u32>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_cells) = counts.shape();

        if gene_ids.len() != n_genes {
            return Err(VstError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }
        if cell_ids.len() != n_cells {
            return Err(VstError::DimensionMismatch {
                expected: format!("{} cell IDs", n_cells),
                got: format!("{} cell IDs", cell_ids.len()),
            });
        }
        if n_genes == 0 || n_cells == 0 {
            return Err(VstError::InvalidInput {
                reason: "Count matrix must have at least one gene and one cell".to_string(),
            });
        }

        let counts = if counts.is_csr() { counts } else { counts.to_csr() };
        let gene_ids = deduplicate_names(gene_ids);

        Ok(Self {
            counts,
            gene_ids,
            cell_ids,
        })
    }

    /// Build from (gene, cell, count) triplets. Repeated coordinates are summed.
    pub fn from_triplets(
        n_genes: usize,
        n_cells: usize,
        triplets: &[(usize, usize, u32)],
        gene_ids: Vec<String>,
        cell_ids: Vec<String>,
    ) -> Result<Self> {
        let mut tri = TriMat::new((n_genes, n_cells));
        for &(g, c, v) in triplets {
            if g >= n_genes || c >= n_cells {
                return Err(VstError::InvalidInput {
                    reason: format!(
                        "Triplet ({}, {}) outside a {} x {} matrix",
                        g, c, n_genes, n_cells
                    ),
                });
            }
            if v > 0 {
                tri.add_triplet(g, c, v);
            }
        }
        let counts: CsMat<u32> = tri.to_csr();
        Self::new(counts, gene_ids, cell_ids)
    }

    /// Build from a dense integer matrix (genes x cells)
    pub fn from_dense(dense: ArrayView2<'_, u32>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_cells) = dense.dim();
        let mut tri = TriMat::new((n_genes, n_cells));
        for ((g, c), &v) in dense.indexed_iter() {
            if v > 0 {
                tri.add_triplet(g, c, v);
            }
        }
        let counts: CsMat<u32> = tri.to_csr();
        Self::new(counts, gene_ids, cell_ids)
    }

    /// Build from a dense floating point matrix, rejecting negative or fractional entries
    pub fn from_dense_f64(dense: ArrayView2<'_, f64>, gene_ids: Vec<String>, cell_ids: Vec<String>) -> Result<Self> {
        if dense.iter().any(|&x| !x.is_finite() || x < 0.0) {
            return Err(VstError::InvalidInput {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }
        if dense.iter().any(|&x| x != x.round() || x > u32::MAX as f64) {
            return Err(VstError::InvalidInput {
                reason: "Counts must be integers representable as u32".to_string(),
            });
        }
        let ints = dense.mapv(|x| x as u32);
        Self::from_dense(ints.view(), gene_ids, cell_ids)
    }

    /// Get the number of genes
    pub fn n_genes(&self) -> usize {
        self.counts.rows()
    }

    /// Get the number of cells
    pub fn n_cells(&self) -> usize {
        self.counts.cols()
    }

    /// Number of stored non-zero entries
    pub fn nnz(&self) -> usize {
        self.counts.nnz()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn cell_ids(&self) -> &[String] {
        &self.cell_ids
    }

    /// The underlying CSR matrix
    pub fn sparse(&self) -> &CsMat<u32> {
        &self.counts
    }

    /// Get gene index by ID
    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Dense counts of one gene across all cells
    pub fn gene_counts(&self, gene_idx: usize) -> Vec<f64> {
        let mut dense = vec![0.0; self.n_cells()];
        if let Some(row) = self.counts.outer_view(gene_idx) {
            for (cell, &v) in row.iter() {
                dense[cell] = v as f64;
            }
        }
        dense
    }

    /// Dense counts of one gene restricted to the given cells, in that order
    pub fn gene_counts_subset(&self, gene_idx: usize, cells: &[usize]) -> Vec<f64> {
        let full = self.gene_counts(gene_idx);
        cells.iter().map(|&c| full[c]).collect()
    }

    /// Total count per cell (UMI per cell)
    pub fn cell_totals(&self) -> Vec<f64> {
        let mut totals = vec![0.0; self.n_cells()];
        for row in self.counts.outer_iterator() {
            for (cell, &v) in row.iter() {
                totals[cell] += v as f64;
            }
        }
        totals
    }

    /// Summary statistics for one gene, computed from its non-zero entries
    pub fn gene_stats(&self, gene_idx: usize) -> GeneStats {
        let n = self.n_cells() as f64;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut sum_log1p = 0.0;
        let mut n_detected = 0usize;

        if let Some(row) = self.counts.outer_view(gene_idx) {
            for (_, &v) in row.iter() {
                if v == 0 {
                    continue;
                }
                let x = v as f64;
                sum += x;
                sum_sq += x * x;
                sum_log1p += x.ln_1p();
                n_detected += 1;
            }
        }

        let mean = sum / n;
        let variance = if n > 1.0 {
            ((sum_sq - n * mean * mean) / (n - 1.0)).max(0.0)
        } else {
            0.0
        };

        GeneStats {
            mean,
            geometric_mean: (sum_log1p / n).exp_m1(),
            variance,
            detection_rate: n_detected as f64 / n,
            n_detected,
        }
    }

    /// Summary statistics for every gene
    pub fn all_gene_stats(&self) -> Vec<GeneStats> {
        (0..self.n_genes())
            .into_par_iter()
            .map(|i| self.gene_stats(i))
            .collect()
    }

    /// Subset to specific genes (rows), in the given order
    pub fn subset_genes(&self, gene_indices: &[usize]) -> Result<Self> {
        let n_cells = self.n_cells();
        let mut tri = TriMat::new((gene_indices.len(), n_cells));
        for (new_row, &g) in gene_indices.iter().enumerate() {
            let row = self.counts.outer_view(g).ok_or_else(|| VstError::InvalidInput {
                reason: format!("Gene index {} out of range", g),
            })?;
            for (cell, &v) in row.iter() {
                tri.add_triplet(new_row, cell, v);
            }
        }
        let counts: CsMat<u32> = tri.to_csr();
        let gene_ids = gene_indices.iter().map(|&i| self.gene_ids[i].clone()).collect();
        Self::new(counts, gene_ids, self.cell_ids.clone())
    }

    /// Dense copy of the matrix as floats (genes x cells)
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.n_genes(), self.n_cells()));
        for (g, row) in self.counts.outer_iterator().enumerate() {
            for (c, &v) in row.iter() {
                dense[[g, c]] = v as f64;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_count_matrix_creation() {
        let dense = array![[1u32, 0, 3], [0, 0, 2]];
        let matrix = CountMatrix::from_dense(dense.view(), ids("g", 2), ids("c", 3)).unwrap();
        assert_eq!(matrix.n_genes(), 2);
        assert_eq!(matrix.n_cells(), 3);
        assert_eq!(matrix.nnz(), 3);
        assert_eq!(matrix.gene_counts(0), vec![1.0, 0.0, 3.0]);
        assert_eq!(matrix.gene_counts(1), vec![0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_negative_counts_rejected() {
        let dense = array![[10.0, -5.0], [5.0, 15.0]];
        let result = CountMatrix::from_dense_f64(dense.view(), ids("g", 2), ids("c", 2));
        assert!(matches!(result, Err(VstError::InvalidInput { .. })));
    }

    #[test]
    fn test_fractional_counts_rejected() {
        let dense = array![[1.5, 0.0]];
        let result = CountMatrix::from_dense_f64(dense.view(), ids("g", 1), ids("c", 2));
        assert!(result.is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let dense = array![[1u32, 2], [3, 4]];
        let result = CountMatrix::from_dense(dense.view(), ids("g", 3), ids("c", 2));
        assert!(matches!(result, Err(VstError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_triplets_sum_duplicates() {
        let triplets = vec![(0, 1, 2), (0, 1, 3), (1, 0, 4)];
        let matrix = CountMatrix::from_triplets(2, 2, &triplets, ids("g", 2), ids("c", 2)).unwrap();
        assert_eq!(matrix.gene_counts(0), vec![0.0, 5.0]);
        assert_eq!(matrix.cell_totals(), vec![4.0, 5.0]);
    }

    #[test]
    fn test_gene_stats() {
        let dense = array![[0u32, 1, 3, 0]];
        let matrix = CountMatrix::from_dense(dense.view(), ids("g", 1), ids("c", 4)).unwrap();
        let stats = matrix.gene_stats(0);
        assert!((stats.mean - 1.0).abs() < 1e-12);
        assert_eq!(stats.n_detected, 2);
        assert!((stats.detection_rate - 0.5).abs() < 1e-12);
        // values 0,1,3,0: var = (1 + 0 + 4 + 1) / 3
        assert!((stats.variance - 2.0).abs() < 1e-12);
        let expected_gmean = ((2.0f64.ln() + 4.0f64.ln()) / 4.0).exp() - 1.0;
        assert!((stats.geometric_mean - expected_gmean).abs() < 1e-12);
    }

    #[test]
    fn test_subset_genes() {
        let dense = array![[1u32, 0], [0, 2], [3, 4]];
        let matrix = CountMatrix::from_dense(dense.view(), ids("g", 3), ids("c", 2)).unwrap();
        let sub = matrix.subset_genes(&[2, 0]).unwrap();
        assert_eq!(sub.gene_ids(), &["g2".to_string(), "g0".to_string()]);
        assert_eq!(sub.gene_counts(0), vec![3.0, 4.0]);
        assert_eq!(sub.gene_counts(1), vec![1.0, 0.0]);
    }

    #[test]
    fn test_duplicate_gene_names_renamed() {
        let dense = array![[1u32], [2]];
        let names = vec!["a".to_string(), "a".to_string()];
        let matrix = CountMatrix::from_dense(dense.view(), names, ids("c", 1)).unwrap();
        assert_eq!(matrix.gene_ids(), &["a".to_string(), "a_1".to_string()]);
    }
}
