//! Command-line interface for rust_sctransform

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rust_sctransform")]
#[command(version)]
#[command(about = "Regularized negative binomial VST for single-cell counts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Worker threads (0 = all cores)
    #[arg(short = 't', long, global = true, default_value_t = 0)]
    pub threads: usize,
}

/// Options of the synthetic dataset
#[derive(clap::Args, Debug, Clone)]
pub struct SimulationArgs {
    /// Number of genes
    #[arg(long, default_value_t = 500)]
    pub genes: usize,

    /// Number of cells
    #[arg(long, default_value_t = 1000)]
    pub cells: usize,

    /// Seed of the simulation
    #[arg(long, default_value_t = 42)]
    pub seed: u32,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run fitting methods on a simulated dataset and compare them
    #[command(
        long_about = "Run fitting methods on a simulated dataset and compare them\n\n\
            Simulates a negative binomial count matrix, runs every selected method\n\
            against it and prints one JSON summary per method: phase timings,\n\
            failed-gene count and median residual variance.",
        after_long_help = "\
Examples:
  # All methods on the default dataset
  rust_sctransform bench

  # Two methods, 2000 genes, method-of-moments theta
  rust_sctransform bench --genes 2000 -m poisson -m nb --theta-estimation mm"
    )]
    Bench {
        #[command(flatten)]
        sim: SimulationArgs,

        /// Method to run (repeatable). Default: all
        #[arg(short, long = "method")]
        methods: Vec<String>,

        /// Theta estimator after Poisson fits: ml or mm
        #[arg(long, default_value = "ml")]
        theta_estimation: String,

        /// Theta of the offset method
        #[arg(long, default_value_t = 100.0)]
        theta_given: f64,

        /// Genes considered for the shared theta
        #[arg(long, default_value_t = 250)]
        n_genes_shared_theta: usize,

        /// Cells subsampled for the shared theta
        #[arg(long, default_value_t = 5000)]
        n_cells_subsample: usize,

        /// Seed of the shared theta subsample
        #[arg(long, default_value_t = 1448145)]
        random_seed: u32,

        /// Minimum number of cells a gene must be detected in
        #[arg(long, default_value_t = 0)]
        min_cells: usize,
    },

    /// Print summary statistics of a simulated dataset
    Simulate {
        #[command(flatten)]
        sim: SimulationArgs,
    },
}
