//! # Refine Benchmark
//!
//! Timing analysis of the sequential reference integrator (RK4) against the
//! parallel-in-time scheme (Parareal) across problem sizes.
//!
//! Input is the benchmark CSV written by the solver driver:
//!
//! ```text
//! problem_size,tf,h,steps,rk4_time,parareal_time
//! small,10.0,0.01,1000,0.52,0.31
//! ```
//!
//! Empty numeric cells read as `0.0`. Speedup is always derived, and is the
//! explicit sentinel `0.0` whenever either time is not positive.

use nalgebra::{DMatrix, DVector};
use refine_core::{AnalysisConfig, Diagnostic, RefineError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::debug;

pub const PROBLEM_SIZE_COLUMN: &str = "problem_size";
pub const FINAL_TIME_COLUMN: &str = "tf";
pub const COARSE_STEP_COLUMN: &str = "h";
pub const STEPS_COLUMN: &str = "steps";
pub const REFERENCE_TIME_COLUMN: &str = "rk4_time";
pub const PARALLEL_TIME_COLUMN: &str = "parareal_time";

/// Minimum rows before trend curves are fitted
pub const TREND_MIN_ROWS: usize = 4;

/// Minimum rows before the efficiency trend is judged
pub const EFFICIENCY_TREND_MIN_ROWS: usize = 3;

// ============================================================================
// ROWS
// ============================================================================

/// `reference / parallel` when both are positive, else `0.0`
pub fn speedup(reference_time: f64, parallel_time: f64) -> f64 {
    if reference_time > 0.0 && parallel_time > 0.0 {
        reference_time / parallel_time
    } else {
        0.0
    }
}

/// One benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRow {
    pub problem_size: String,
    pub step_count: u64,
    pub coarse_step: f64,
    pub final_time: f64,
    pub reference_time: f64,
    pub parallel_time: f64,
    /// Derived, never read from input
    pub speedup: f64,
}

impl BenchmarkRow {
    pub fn new(
        problem_size: &str,
        step_count: u64,
        coarse_step: f64,
        final_time: f64,
        reference_time: f64,
        parallel_time: f64,
    ) -> Self {
        Self {
            problem_size: problem_size.to_string(),
            step_count,
            coarse_step,
            final_time,
            reference_time,
            parallel_time,
            speedup: speedup(reference_time, parallel_time),
        }
    }
}

/// Benchmark rows plus the rows that could not be read
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkTable {
    pub rows: Vec<BenchmarkRow>,
    pub skipped: Vec<Diagnostic>,
}

struct ColumnMap {
    problem_size: usize,
    final_time: usize,
    coarse_step: usize,
    steps: usize,
    reference_time: usize,
    parallel_time: usize,
}

impl ColumnMap {
    fn from_headers(headers: &csv::StringRecord) -> Result<Self> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| RefineError::MissingColumn(name.to_string()))
        };
        Ok(Self {
            problem_size: find(PROBLEM_SIZE_COLUMN)?,
            final_time: find(FINAL_TIME_COLUMN)?,
            coarse_step: find(COARSE_STEP_COLUMN)?,
            steps: find(STEPS_COLUMN)?,
            reference_time: find(REFERENCE_TIME_COLUMN)?,
            parallel_time: find(PARALLEL_TIME_COLUMN)?,
        })
    }
}

/// Empty (or absent) cells are `0.0`
fn numeric_cell(record: &csv::StringRecord, idx: usize, column: &str) -> std::result::Result<f64, String> {
    let raw = record.get(idx).unwrap_or("").trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .map_err(|_| format!("column {} holds non-numeric value {:?}", column, raw))
}

fn parse_row(record: &csv::StringRecord, cols: &ColumnMap) -> std::result::Result<BenchmarkRow, String> {
    let steps = numeric_cell(record, cols.steps, STEPS_COLUMN)?;
    if !steps.is_finite() || steps < 0.0 {
        return Err(format!("column {} holds invalid step count {}", STEPS_COLUMN, steps));
    }

    Ok(BenchmarkRow::new(
        record.get(cols.problem_size).unwrap_or("").trim(),
        steps as u64,
        numeric_cell(record, cols.coarse_step, COARSE_STEP_COLUMN)?,
        numeric_cell(record, cols.final_time, FINAL_TIME_COLUMN)?,
        numeric_cell(record, cols.reference_time, REFERENCE_TIME_COLUMN)?,
        numeric_cell(record, cols.parallel_time, PARALLEL_TIME_COLUMN)?,
    ))
}

impl BenchmarkTable {
    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers = csv_reader
            .headers()
            .map_err(|e| RefineError::Table(e.to_string()))?
            .clone();
        let cols = ColumnMap::from_headers(&headers)?;

        let mut rows = Vec::new();
        let mut skipped = Vec::new();
        for (i, record) in csv_reader.records().enumerate() {
            let record = record.map_err(|e| RefineError::Table(e.to_string()))?;
            match parse_row(&record, &cols) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    let size = record.get(cols.problem_size).unwrap_or("?");
                    skipped.push(Diagnostic::skipped(
                        format!("row {} (problem_size={})", i + 1, size),
                        reason,
                    ));
                }
            }
        }

        if rows.is_empty() {
            return Err(RefineError::NoData(format!(
                "no usable benchmark rows ({} skipped)",
                skipped.len()
            )));
        }
        Ok(Self { rows, skipped })
    }

    pub fn from_csv_str(text: &str) -> Result<Self> {
        Self::from_csv_reader(text.as_bytes())
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(io::BufReader::new(file))
    }
}

// ============================================================================
// TREND FITS
// ============================================================================

/// Least-squares polynomial, coefficients highest power first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendFit {
    pub coefficients: Vec<f64>,
}

impl TrendFit {
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, c| acc * x + c)
    }
}

/// Fit a polynomial of `degree` through `(xs, ys)` via the normal equations.
///
/// Abscissae are scaled to `[-1, 1]` before solving. `None` when there are
/// too few points or the system is singular.
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Option<TrendFit> {
    if xs.len() != ys.len() || xs.len() <= degree {
        return None;
    }
    let scale = match xs.iter().fold(0.0_f64, |m, x| m.max(x.abs())) {
        s if s > 0.0 => s,
        _ => 1.0,
    };

    let power = |j: usize| (degree - j) as i32;
    let vandermonde = DMatrix::from_fn(xs.len(), degree + 1, |i, j| (xs[i] / scale).powi(power(j)));
    let rhs = DVector::from_column_slice(ys);

    let normal = vandermonde.transpose() * &vandermonde;
    let projected = vandermonde.transpose() * rhs;
    let solution = normal.lu().solve(&projected)?;
    if solution.iter().any(|c| !c.is_finite()) {
        return None;
    }

    Some(TrendFit {
        coefficients: (0..=degree)
            .map(|j| solution[j] / scale.powi(power(j)))
            .collect(),
    })
}

// ============================================================================
// SUMMARY
// ============================================================================

/// How parallel efficiency moves from the smallest to the largest problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EfficiencyTrend {
    Improving,
    Declining,
    Stable,
}

/// Row with the highest speedup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestCase {
    pub index: usize,
    pub speedup: f64,
    pub step_count: u64,
    pub final_time: f64,
    pub coarse_step: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkSummary {
    /// `speedup / processes`, one per row
    pub efficiencies: Vec<f64>,
    pub mean_efficiency: f64,
    pub best: BestCase,
    /// Smallest step count whose speedup exceeds the break-even speedup
    pub breakeven_steps: Option<u64>,
    pub efficiency_trend: Option<EfficiencyTrend>,
    /// Reference time vs steps, degree 1
    pub reference_trend: Option<TrendFit>,
    /// Parallel time vs steps, degree 2
    pub parallel_trend: Option<TrendFit>,
}

pub fn summarize(rows: &[BenchmarkRow], config: &AnalysisConfig) -> Result<BenchmarkSummary> {
    if rows.is_empty() {
        return Err(RefineError::NoData("no benchmark rows to summarize".into()));
    }
    if config.parallel_processes == 0 {
        return Err(RefineError::InvalidConfig("parallel_processes must be at least 1".into()));
    }

    let processes = config.parallel_processes as f64;
    let efficiencies = rows.iter().map(|r| r.speedup / processes).collect::<Vec<_>>();
    let mean_efficiency = efficiencies.iter().sum::<f64>() / efficiencies.len() as f64;

    let (best_idx, best_row) = rows
        .iter()
        .enumerate()
        .fold((0, &rows[0]), |best, (i, row)| {
            if row.speedup > best.1.speedup {
                (i, row)
            } else {
                best
            }
        });

    let breakeven_steps = rows
        .iter()
        .filter(|r| r.speedup > config.breakeven_speedup)
        .map(|r| r.step_count)
        .min();

    let efficiency_trend = (efficiencies.len() >= EFFICIENCY_TREND_MIN_ROWS).then(|| {
        let (first, last) = (efficiencies[0], efficiencies[efficiencies.len() - 1]);
        if last > first {
            EfficiencyTrend::Improving
        } else if last < first {
            EfficiencyTrend::Declining
        } else {
            EfficiencyTrend::Stable
        }
    });

    let (reference_trend, parallel_trend) = if rows.len() >= TREND_MIN_ROWS {
        let steps = rows.iter().map(|r| r.step_count as f64).collect::<Vec<_>>();
        let reference = rows.iter().map(|r| r.reference_time).collect::<Vec<_>>();
        let parallel = rows.iter().map(|r| r.parallel_time).collect::<Vec<_>>();
        (polyfit(&steps, &reference, 1), polyfit(&steps, &parallel, 2))
    } else {
        (None, None)
    };
    debug!(
        rows = rows.len(),
        mean_efficiency,
        fitted = reference_trend.is_some(),
        "summarized benchmark"
    );

    Ok(BenchmarkSummary {
        efficiencies,
        mean_efficiency,
        best: BestCase {
            index: best_idx,
            speedup: best_row.speedup,
            step_count: best_row.step_count,
            final_time: best_row.final_time,
            coarse_step: best_row.coarse_step,
        },
        breakeven_steps,
        efficiency_trend,
        reference_trend,
        parallel_trend,
    })
}
