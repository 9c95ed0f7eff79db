//! rust_sctransform command-line interface

use clap::Parser;
use log::{error, info, LevelFilter};
use serde::Serialize;

use rust_sctransform::cli::{Cli, Commands, SimulationArgs};
use rust_sctransform::prelude::*;
use rust_sctransform::stats::median;

#[derive(Serialize)]
struct BenchSummary {
    method: FitMethod,
    n_genes: usize,
    n_failed_genes: usize,
    median_residual_variance: f64,
    theta_shared: Option<f64>,
    timing: TimingRecord,
    phase_seconds: Vec<(String, f64)>,
}

#[derive(Serialize)]
struct DatasetSummary {
    n_genes: usize,
    n_cells: usize,
    nnz: usize,
    median_umi: f64,
    median_gene_mean: f64,
    median_detection_rate: f64,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp(None)
        .init();

    let result = match cli.command {
        Commands::Bench {
            sim,
            methods,
            theta_estimation,
            theta_given,
            n_genes_shared_theta,
            n_cells_subsample,
            random_seed,
            min_cells,
        } => theta_estimation.parse::<ThetaEstimation>().and_then(|theta_estimation| {
            let params = VstParams {
                theta_estimation,
                theta_given,
                n_genes_for_shared_theta: n_genes_shared_theta,
                n_cells_subsample,
                random_seed,
                min_cells,
                n_threads: cli.threads,
                return_residuals: false,
                ..Default::default()
            };
            run_bench(&sim, &methods, &params)
        }),
        Commands::Simulate { sim } => run_simulate(&sim),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn simulate(args: &SimulationArgs) -> Result<(SimulatedData, CellAttributes)> {
    let sim = simulate_counts(&SimulationParams {
        n_genes: args.genes,
        n_cells: args.cells,
        seed: args.seed,
        ..Default::default()
    })?;
    info!(
        "Simulated {} genes x {} cells ({} non-zero)",
        sim.counts.n_genes(),
        sim.counts.n_cells(),
        sim.counts.nnz()
    );
    let cell_attr = CellAttributes::from_counts(&sim.counts)?;
    Ok((sim, cell_attr))
}

fn run_bench(args: &SimulationArgs, methods: &[String], params: &VstParams) -> Result<()> {
    let methods: Vec<FitMethod> = if methods.is_empty() {
        FitMethod::ALL.to_vec()
    } else {
        methods.iter().map(|m| m.parse()).collect::<Result<_>>()?
    };
    let (sim, cell_attr) = simulate(args)?;

    let results = run_methods(&sim.counts, &cell_attr, &methods, params)?;
    let summaries: Vec<BenchSummary> = results
        .into_iter()
        .map(|r| BenchSummary {
            method: r.method,
            n_genes: r.n_genes(),
            n_failed_genes: r.n_failed_genes,
            median_residual_variance: r.median_residual_variance(),
            theta_shared: r.theta_shared,
            phase_seconds: r.timing.phase_durations(),
            timing: r.timing,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&summaries)?);
    Ok(())
}

fn run_simulate(args: &SimulationArgs) -> Result<()> {
    let (sim, cell_attr) = simulate(args)?;
    let stats = sim.counts.all_gene_stats();
    let means: Vec<f64> = stats.iter().map(|s| s.mean).collect();
    let detection: Vec<f64> = stats.iter().map(|s| s.detection_rate).collect();

    let summary = DatasetSummary {
        n_genes: sim.counts.n_genes(),
        n_cells: sim.counts.n_cells(),
        nnz: sim.counts.nnz(),
        median_umi: median(cell_attr.umi()),
        median_gene_mean: median(&means),
        median_detection_rate: median(&detection),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
