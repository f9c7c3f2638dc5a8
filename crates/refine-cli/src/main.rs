//! # Refine CLI
//!
//! Command-line front-end for trajectory comparison, parameter-scan
//! statistics and benchmark timing analysis.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rayon::prelude::*;
use refine_benchmark::{summarize, BenchmarkSummary, BenchmarkTable};
use refine_core::{AnalysisConfig, Diagnostic, Dimension, ErrorMetrics, RunLabel};
use refine_ensemble::{
    aggregate_rows, bifurcation_cloud, ensemble_band, histogram_samples, BandPoint, Histogram,
    HistogramSelection, ScanTable, SentinelCleaner,
};
use refine_trajectory::{
    compare, compare_pair, compare_sweep_by, load_labeled, read_trajectory, PairOutcome, RunCatalog,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "refine")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Trajectory reconciliation and error-metric engine", long_about = None)]
struct Cli {
    /// Analysis parameters (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a sparser trajectory against a reference
    Compare {
        /// Reference trajectory file
        reference: PathBuf,
        /// Comparison trajectory file
        comparison: PathBuf,
    },

    /// Compare every tau found among the listed trajectory files
    Sweep {
        /// Trajectory files named with a tau<value> token
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Ensemble statistics of a parameter-scan CSV
    Scan {
        /// Scan CSV
        csv: PathBuf,
        /// R values to inspect (overrides the configured targets)
        #[arg(short, long = "target")]
        targets: Vec<f64>,
    },

    /// Reference vs parallel timing summary of a benchmark CSV
    Bench {
        /// Benchmark CSV
        csv: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(AnalysisConfig::default()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_diagnostics(skipped: &[Diagnostic]) {
    if skipped.is_empty() {
        return;
    }
    println!();
    println!("{}", "Skipped:".yellow().bold());
    for diagnostic in skipped {
        println!("  {}", diagnostic.to_string().yellow());
    }
}

fn print_metrics(metrics: &ErrorMetrics) {
    println!("  {:<4} {:>14} {:>14}", "dim", "max |err|", "L2 (RMS)");
    for dim in Dimension::ALL {
        if let Some(err) = metrics.get(dim) {
            println!(
                "  {:<4} {:>14.6e} {:>14.6e}",
                dim.name().cyan(),
                err.max_abs_error,
                err.l2_error
            );
        }
    }
}

// ============================================================================
// COMPARE
// ============================================================================

#[derive(Serialize)]
struct CompareOutput {
    reference: RunLabel,
    comparison: RunLabel,
    outcome: PairOutcome,
}

fn run_compare(reference: &Path, comparison: &Path, json: bool) -> Result<()> {
    let reference = load_labeled(reference)
        .with_context(|| format!("reading reference {}", reference.display()))?;
    let comparison = load_labeled(comparison)
        .with_context(|| format!("reading comparison {}", comparison.display()))?;

    let outcome: PairOutcome = compare(&reference.trajectory, &comparison.trajectory)?.into();
    let output = CompareOutput {
        reference: reference.label,
        comparison: comparison.label,
        outcome,
    };
    if json {
        return print_json(&output);
    }

    println!(
        "{} {} vs {}",
        "Comparing".green().bold(),
        output.reference.title(),
        output.comparison.title()
    );
    match &output.outcome {
        PairOutcome::Measured {
            metrics,
            interpolation,
            extrapolated,
        } => {
            println!("  interpolation: {:?}, extrapolated samples: {}", interpolation, extrapolated);
            print_metrics(metrics);
        }
        PairOutcome::Undefined {
            reference_samples,
            comparison_samples,
        } => {
            println!(
                "{}",
                format!(
                    "  comparison is not sparser than reference ({} vs {} samples); error undefined",
                    comparison_samples, reference_samples
                )
                .yellow()
            );
        }
    }
    Ok(())
}

// ============================================================================
// SWEEP
// ============================================================================

fn run_sweep(files: &[PathBuf], json: bool) -> Result<()> {
    let catalog = RunCatalog::from_paths(files);
    info!(files = files.len(), "starting sweep");

    let report = compare_sweep_by(&catalog, |pairs| {
        pairs
            .par_iter()
            .map(|pair| compare_pair(pair, read_trajectory))
            .collect()
    })
    .context("sweep produced no comparisons")?;

    if json {
        return print_json(&report);
    }

    println!("{}", "Error vs tau:".green().bold());
    println!(
        "  {:>6} {:>6} {:>12} {:>12} {:>12}",
        "tau", "dense", "L2 X", "L2 Y", "L2 Z"
    );
    for row in &report.rows {
        let dense = if row.dense { "yes" } else { "no" };
        match row.metrics() {
            Some(metrics) => {
                let l2 = |dim| metrics.get(dim).map_or(f64::NAN, |e| e.l2_error);
                println!(
                    "  {:>6.1} {:>6} {:>12.4e} {:>12.4e} {:>12.4e}",
                    row.tau,
                    dense,
                    l2(Dimension::X),
                    l2(Dimension::Y),
                    l2(Dimension::Z)
                );
            }
            None => println!(
                "  {:>6.1} {:>6} {}",
                row.tau,
                dense,
                "undefined (comparison not sparser)".yellow()
            ),
        }
    }
    print_diagnostics(&report.skipped);
    Ok(())
}

// ============================================================================
// SCAN
// ============================================================================

#[derive(Serialize)]
struct TargetHistogram {
    target: f64,
    r: f64,
    histogram: Option<Histogram>,
}

#[derive(Serialize)]
struct ScanOutput {
    replicas: usize,
    band: Vec<BandPoint>,
    cloud_points: usize,
    histograms: Vec<TargetHistogram>,
    skipped: Vec<Diagnostic>,
}

fn run_scan(csv: &Path, targets: &[f64], config: &AnalysisConfig, json: bool) -> Result<()> {
    let cleaner = SentinelCleaner::from_config(config)?;
    let table = ScanTable::load(csv, &cleaner)
        .with_context(|| format!("reading scan {}", csv.display()))?;

    let targets = if targets.is_empty() {
        &config.histogram_targets[..]
    } else {
        targets
    };
    let band = ensemble_band(&aggregate_rows(&table)?);
    let cloud_points = bifurcation_cloud(&table).len();
    let HistogramSelection { samples, skipped } = histogram_samples(&table, targets)?;

    let histograms = samples
        .iter()
        .map(|sample| TargetHistogram {
            target: sample.target,
            r: sample.r,
            histogram: Histogram::density(&sample.values, config.histogram_bins),
        })
        .collect();
    let mut all_skipped = table.skipped.clone();
    all_skipped.extend(skipped);

    let output = ScanOutput {
        replicas: table.replica_ids.len(),
        band,
        cloud_points,
        histograms,
        skipped: all_skipped,
    };
    if json {
        return print_json(&output);
    }

    println!(
        "{} {} rows, {} replicas, {} cloud points",
        "Scan:".green().bold(),
        table.rows.len(),
        output.replicas,
        output.cloud_points
    );
    println!("  {:>8} {:>14} {:>14}", "R", "mean <X>", "std");
    for point in &output.band {
        println!("  {:>8.3} {:>14.6} {:>14.6}", point.r, point.mean, point.std_dev);
    }
    for entry in &output.histograms {
        let Some(histogram) = &entry.histogram else {
            continue;
        };
        let total: usize = histogram.counts.iter().sum();
        println!(
            "  {} R={:.3} (target {}): {} samples in {} bins",
            "histogram".cyan(),
            entry.r,
            entry.target,
            total,
            histogram.counts.len()
        );
    }
    print_diagnostics(&output.skipped);
    Ok(())
}

// ============================================================================
// BENCH
// ============================================================================

#[derive(Serialize)]
struct BenchOutput<'a> {
    table: &'a BenchmarkTable,
    summary: BenchmarkSummary,
}

fn run_bench(csv: &Path, config: &AnalysisConfig, json: bool) -> Result<()> {
    let table = BenchmarkTable::from_csv_path(csv)
        .with_context(|| format!("reading benchmark {}", csv.display()))?;
    let summary = summarize(&table.rows, config)?;
    if json {
        return print_json(&BenchOutput {
            table: &table,
            summary,
        });
    }

    println!("{}", "Benchmark:".green().bold());
    println!(
        "  {:<10} {:>10} {:>12} {:>12} {:>8} {:>10}",
        "size", "steps", "RK4 [s]", "Parareal [s]", "speedup", "efficiency"
    );
    for (row, efficiency) in table.rows.iter().zip(&summary.efficiencies) {
        println!(
            "  {:<10} {:>10} {:>12.4} {:>12.4} {:>8.2} {:>9.1}%",
            row.problem_size,
            row.step_count,
            row.reference_time,
            row.parallel_time,
            row.speedup,
            efficiency * 100.0
        );
    }

    println!();
    println!("  mean efficiency: {:.1}%", summary.mean_efficiency * 100.0);
    println!(
        "  best speedup: {:.2}x at {} steps (tf={}, h={})",
        summary.best.speedup, summary.best.step_count, summary.best.final_time, summary.best.coarse_step
    );
    match summary.breakeven_steps {
        Some(steps) => println!("  break-even from {} steps", steps),
        None => println!("  {}", "no row beats the break-even speedup".yellow()),
    }
    if let Some(trend) = summary.efficiency_trend {
        println!("  efficiency trend: {:?}", trend);
    }
    if let Some(fit) = &summary.reference_trend {
        println!("  RK4 time fit: {:?}", fit.coefficients);
    }
    if let Some(fit) = &summary.parallel_trend {
        println!("  Parareal time fit: {:?}", fit.coefficients);
    }
    print_diagnostics(&table.skipped);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Compare {
            reference,
            comparison,
        } => run_compare(reference, comparison, cli.json),
        Commands::Sweep { files } => run_sweep(files, cli.json),
        Commands::Scan { csv, targets } => run_scan(csv, targets, &config, cli.json),
        Commands::Bench { csv } => run_bench(csv, &config, cli.json),
    }
}
