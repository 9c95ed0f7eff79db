//! Count matrix storage, per-cell attributes and synthetic data

mod cell_attr;
mod count_matrix;
pub mod simulate;

pub use cell_attr::CellAttributes;
pub use count_matrix::{CountMatrix, GeneStats};
pub use simulate::{simulate_counts, SimulatedData, SimulationParams};
