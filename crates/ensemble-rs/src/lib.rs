//! # Refine Ensemble
//!
//! Cleaning and aggregation of parameter-sweep results.
//!
//! A sweep CSV holds one row per control value `R` with the asymptotic
//! average `<X>_j` of every replica `j`. The solver writes a huge sentinel
//! (or an infinity) for replicas that diverged; those become missing before
//! any statistic is computed.
//!
//! This crate provides:
//! - Numeric tables loaded from CSV
//! - Sentinel cleaning
//! - Ensemble mean and population standard deviation per `R`
//! - Bifurcation point clouds and nearest-`R` replica distributions

use refine_core::{AnalysisConfig, Diagnostic, RefineError, Result};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::debug;

// ============================================================================
// TABLES
// ============================================================================

/// One CSV cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cell {
    Number(f64),
    /// Absent value; never conflated with zero or NaN
    Missing,
    Text(String),
}

impl Cell {
    /// Empty cells and `NaN` load as missing
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return Self::Missing;
        }
        match raw.parse::<f64>() {
            Ok(v) if v.is_nan() => Self::Missing,
            Ok(v) => Self::Number(v),
            Err(_) => Self::Text(raw.to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

/// Rows of cells under named columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Result<Self> {
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(RefineError::Table(format!(
                "row {} has {} cells, header has {}",
                i + 1,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let columns = csv_reader
            .headers()
            .map_err(table_error)?
            .iter()
            .map(str::to_string)
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(table_error)?;
            rows.push(record.iter().map(Cell::parse).collect());
        }

        Self::new(columns, rows)
    }

    pub fn from_csv_str(text: &str) -> Result<Self> {
        Self::from_csv_reader(text.as_bytes())
    }

    pub fn from_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(io::BufReader::new(file))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name)
            .ok_or_else(|| RefineError::MissingColumn(name.to_string()))
    }
}

fn table_error(e: csv::Error) -> RefineError {
    RefineError::Table(e.to_string())
}

// ============================================================================
// SENTINEL CLEANING
// ============================================================================

/// Replaces solver divergence sentinels with [`Cell::Missing`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentinelCleaner {
    threshold: f64,
}

impl Default for SentinelCleaner {
    fn default() -> Self {
        Self { threshold: 1.0e30 }
    }
}

impl SentinelCleaner {
    pub fn new(threshold: f64) -> Result<Self> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(RefineError::InvalidConfig(format!(
                "sentinel threshold must be finite and positive, got {}",
                threshold
            )));
        }
        Ok(Self { threshold })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Self> {
        Self::new(config.huge_threshold)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Infinite, or at/above the threshold in magnitude
    pub fn is_sentinel(&self, value: f64) -> bool {
        value.is_infinite() || value.abs() >= self.threshold
    }

    pub fn clean_cell(&self, cell: &Cell) -> Cell {
        match cell {
            Cell::Number(v) if self.is_sentinel(*v) => Cell::Missing,
            other => other.clone(),
        }
    }

    pub fn clean(&self, table: &Table) -> Table {
        let mut cleaned = 0usize;
        let rows = table
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|cell| {
                        let out = self.clean_cell(cell);
                        if out.is_missing() && !cell.is_missing() {
                            cleaned += 1;
                        }
                        out
                    })
                    .collect()
            })
            .collect();
        debug!(cleaned, threshold = self.threshold, "replaced sentinel values");

        Table {
            columns: table.columns.clone(),
            rows,
        }
    }
}

// ============================================================================
// SCAN TABLES
// ============================================================================

pub const R_COLUMN: &str = "R";
pub const REPLICA_PREFIX: &str = "Avg_X_";
pub const ENSEMBLE_MEAN_COLUMN: &str = "Avg_X_Ensemble";
pub const ENSEMBLE_STD_COLUMN: &str = "StdDev_X_Ensemble";

/// One row of a parameter sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRow {
    #[serde(rename = "R")]
    pub r: f64,
    /// Same length for every row of a sweep; `None` = cleaned sentinel
    pub replica_averages: Vec<Option<f64>>,
    pub ensemble_mean: Option<f64>,
    pub ensemble_std_dev: Option<f64>,
}

impl ScanRow {
    pub fn present_replicas(&self) -> impl Iterator<Item = f64> + '_ {
        self.replica_averages.iter().filter_map(|v| *v)
    }
}

/// A cleaned parameter sweep
#[derive(Debug, Clone, Serialize)]
pub struct ScanTable {
    pub replica_ids: Vec<String>,
    pub rows: Vec<ScanRow>,
    /// Rows dropped while building the table
    pub skipped: Vec<Diagnostic>,
}

impl ScanTable {
    /// Interpret an already cleaned table.
    ///
    /// `R` and at least one `Avg_X_<id>` column are required; the two
    /// ensemble columns are optional and kept as reported by the solver.
    pub fn from_table(table: &Table) -> Result<Self> {
        let r_idx = table.require_column(R_COLUMN)?;
        let replica_cols = table
            .columns()
            .iter()
            .enumerate()
            .filter(|(_, name)| name.starts_with(REPLICA_PREFIX) && *name != ENSEMBLE_MEAN_COLUMN)
            .map(|(i, name)| (i, name[REPLICA_PREFIX.len()..].to_string()))
            .collect::<Vec<_>>();
        if replica_cols.is_empty() {
            return Err(RefineError::MissingColumn(format!("{}<replica-id>", REPLICA_PREFIX)));
        }
        if table.rows().is_empty() {
            return Err(RefineError::NoData("scan table has no rows".into()));
        }

        let mean_idx = table.column_index(ENSEMBLE_MEAN_COLUMN);
        let std_idx = table.column_index(ENSEMBLE_STD_COLUMN);

        let mut rows = Vec::with_capacity(table.rows().len());
        let mut skipped = Vec::new();
        for (i, cells) in table.rows().iter().enumerate() {
            let Some(r) = cells[r_idx].as_number() else {
                skipped.push(Diagnostic::skipped(
                    format!("row {}", i + 1),
                    "R is missing or non-numeric",
                ));
                continue;
            };
            let mut value =
                |j: usize| numeric_or_report(&cells[j], r, &table.columns()[j], &mut skipped);
            let replica_averages = replica_cols.iter().map(|(j, _)| value(*j)).collect();
            let ensemble_mean = mean_idx.and_then(&mut value);
            let ensemble_std_dev = std_idx.and_then(&mut value);
            rows.push(ScanRow {
                r,
                replica_averages,
                ensemble_mean,
                ensemble_std_dev,
            });
        }

        if rows.is_empty() {
            return Err(RefineError::NoData(format!(
                "none of {} scan rows has a usable R",
                table.rows().len()
            )));
        }

        Ok(Self {
            replica_ids: replica_cols.into_iter().map(|(_, id)| id).collect(),
            rows,
            skipped,
        })
    }

    /// Read, clean and interpret a sweep CSV
    pub fn load(path: &Path, cleaner: &SentinelCleaner) -> Result<Self> {
        let raw = Table::from_csv_path(path)?;
        Self::from_table(&cleaner.clean(&raw))
    }
}

/// Numeric value of a scan cell; text is reported and read as missing
fn numeric_or_report(
    cell: &Cell,
    r: f64,
    column: &str,
    skipped: &mut Vec<Diagnostic>,
) -> Option<f64> {
    if let Cell::Text(raw) = cell {
        skipped.push(Diagnostic::skipped(
            format!("R={} {}", r, column),
            format!("non-numeric value {:?} read as missing", raw),
        ));
    }
    cell.as_number()
}

// ============================================================================
// ENSEMBLE AGGREGATION
// ============================================================================

/// Mean and population standard deviation over present replicas
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplicaStats {
    pub mean: f64,
    pub std_dev: f64,
    pub valid: usize,
}

/// `None` when every replica is missing. Divides by N, not N - 1.
pub fn replica_stats(values: &[Option<f64>]) -> Option<ReplicaStats> {
    let present = values.iter().filter_map(|v| *v).collect::<Vec<_>>();
    if present.is_empty() {
        return None;
    }
    let n = present.len() as f64;
    let mean = present.iter().sum::<f64>() / n;
    let variance = present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(ReplicaStats {
        mean,
        std_dev: variance.sqrt(),
        valid: present.len(),
    })
}

/// Copy of every row with the ensemble columns recomputed from the replicas
pub fn aggregate_rows(table: &ScanTable) -> Result<Vec<ScanRow>> {
    if table.rows.is_empty() {
        return Err(RefineError::NoData("scan table has no rows".into()));
    }
    Ok(table
        .rows
        .iter()
        .map(|row| {
            let stats = replica_stats(&row.replica_averages);
            ScanRow {
                r: row.r,
                replica_averages: row.replica_averages.clone(),
                ensemble_mean: stats.map(|s| s.mean),
                ensemble_std_dev: stats.map(|s| s.std_dev),
            }
        })
        .collect())
}

/// Mean with its ±σ band at one `R`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandPoint {
    #[serde(rename = "R")]
    pub r: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Rows where both ensemble statistics are present
pub fn ensemble_band(rows: &[ScanRow]) -> Vec<BandPoint> {
    rows.iter()
        .filter_map(|row| match (row.ensemble_mean, row.ensemble_std_dev) {
            (Some(mean), Some(std_dev)) => Some(BandPoint {
                r: row.r,
                mean,
                std_dev,
            }),
            _ => None,
        })
        .collect()
}

/// `(R, <X>_j)` pair of a bifurcation diagram
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CloudPoint {
    #[serde(rename = "R")]
    pub r: f64,
    pub value: f64,
}

/// One point per present replica, in row then replica order
pub fn bifurcation_cloud(table: &ScanTable) -> Vec<CloudPoint> {
    table
        .rows
        .iter()
        .flat_map(|row| row.present_replicas().map(move |value| CloudPoint { r: row.r, value }))
        .collect()
}

/// Replica values of the row nearest to a requested `R`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSample {
    pub target: f64,
    /// `R` of the selected row
    pub r: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistogramSelection {
    pub samples: Vec<ReplicaSample>,
    pub skipped: Vec<Diagnostic>,
}

/// Index of the row whose `R` is closest to `target`; ties keep the first
pub fn nearest_row(rows: &[ScanRow], target: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, row) in rows.iter().enumerate() {
        let distance = (row.r - target).abs();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((i, distance));
        }
    }
    best.map(|(i, _)| i)
}

/// Replica samples for each target; targets whose row is fully missing are skipped.
///
/// Fails when no target yields a sample.
pub fn histogram_samples(table: &ScanTable, targets: &[f64]) -> Result<HistogramSelection> {
    if table.rows.is_empty() {
        return Err(RefineError::NoData("scan table has no rows".into()));
    }
    if let Some(bad) = targets.iter().find(|r| !r.is_finite()) {
        return Err(RefineError::InvalidConfig(format!(
            "histogram target must be finite, got {}",
            bad
        )));
    }

    let mut selection = HistogramSelection::default();
    for &target in targets {
        let Some(idx) = nearest_row(&table.rows, target) else {
            continue;
        };
        let row = &table.rows[idx];
        let values = row.present_replicas().collect::<Vec<_>>();
        if values.is_empty() {
            selection.skipped.push(Diagnostic::skipped(
                format!("R={:.3} (target {})", row.r, target),
                "no valid replica averages",
            ));
            continue;
        }
        selection.samples.push(ReplicaSample {
            target,
            r: row.r,
            values,
        });
    }

    if selection.samples.is_empty() {
        return Err(RefineError::NoData(format!(
            "no histogram target has valid replicas ({} targets, {} skipped)",
            targets.len(),
            selection.skipped.len()
        )));
    }
    Ok(selection)
}

// ============================================================================
// HISTOGRAMS
// ============================================================================

/// Equal-width histogram normalised to unit area
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `bins + 1` edges
    pub edges: Vec<f64>,
    pub counts: Vec<usize>,
    pub density: Vec<f64>,
}

impl Histogram {
    /// `None` for no values or zero bins. A degenerate range is widened by ±0.5.
    pub fn density(values: &[f64], bins: usize) -> Option<Self> {
        if values.is_empty() || bins == 0 {
            return None;
        }
        let mut lo = values.iter().copied().fold(f64::INFINITY, f64::min);
        let mut hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if lo == hi {
            lo -= 0.5;
            hi += 0.5;
        }
        let width = (hi - lo) / bins as f64;

        let mut counts = vec![0usize; bins];
        for &v in values {
            let bin = (((v - lo) / width).floor() as usize).min(bins - 1);
            counts[bin] += 1;
        }

        let norm = values.len() as f64 * width;
        Some(Self {
            edges: (0..=bins).map(|i| lo + i as f64 * width).collect(),
            density: counts.iter().map(|&c| c as f64 / norm).collect(),
            counts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SCAN_CSV: &str = "\
R,Avg_X_1,Avg_X_2,Avg_X_3,Avg_X_4,Avg_X_Ensemble,StdDev_X_Ensemble
0.5,1.0,2.0,3.0,1.0e30,2.0,0.8
1.0,inf,-inf,1.0e31,,1.0e30,1.0e30
2.0,4.0,4.0,5.0,5.0,4.5,0.5
";

    fn scan() -> ScanTable {
        let raw = Table::from_csv_str(SCAN_CSV).unwrap();
        ScanTable::from_table(&SentinelCleaner::default().clean(&raw)).unwrap()
    }

    #[test]
    fn test_cell_parsing() {
        assert_eq!(Cell::parse(" 1.5 "), Cell::Number(1.5));
        assert_eq!(Cell::parse(""), Cell::Missing);
        assert_eq!(Cell::parse("NaN"), Cell::Missing);
        assert_eq!(Cell::parse("-inf"), Cell::Number(f64::NEG_INFINITY));
        assert_eq!(Cell::parse("small"), Cell::Text("small".into()));
    }

    #[test]
    fn test_cleaner_rules_and_idempotence() {
        let table = Table::new(
            vec!["a".into(), "b".into()],
            vec![
                vec![Cell::Number(f64::INFINITY), Cell::Number(-1.0e30)],
                vec![Cell::Number(9.9e29), Cell::Text("label".into())],
                vec![Cell::Missing, Cell::Number(-3.0)],
            ],
        )
        .unwrap();
        let cleaner = SentinelCleaner::default();

        let once = cleaner.clean(&table);
        assert_eq!(once.rows()[0], vec![Cell::Missing, Cell::Missing]);
        assert_eq!(once.rows()[1], vec![Cell::Number(9.9e29), Cell::Text("label".into())]);
        assert_eq!(once.rows()[2], vec![Cell::Missing, Cell::Number(-3.0)]);

        let twice = cleaner.clean(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_cleaner_rejects_bad_threshold() {
        assert!(SentinelCleaner::new(0.0).is_err());
        assert!(SentinelCleaner::new(f64::INFINITY).is_err());
        assert_eq!(SentinelCleaner::new(1e10).unwrap().threshold(), 1e10);
    }

    #[test]
    fn test_scan_table_columns() {
        let table = scan();
        assert_eq!(table.replica_ids, vec!["1", "2", "3", "4"]);
        assert_eq!(table.rows.len(), 3);
        assert_eq!(table.rows[0].replica_averages, vec![Some(1.0), Some(2.0), Some(3.0), None]);
        assert_eq!(table.rows[1].replica_averages, vec![None; 4]);
        assert_eq!(table.rows[1].ensemble_mean, None);
        assert_eq!(table.rows[2].ensemble_mean, Some(4.5));
    }

    #[test]
    fn test_missing_columns() {
        let no_r = Table::from_csv_str("Avg_X_1\n1.0\n").unwrap();
        assert!(matches!(ScanTable::from_table(&no_r), Err(RefineError::MissingColumn(c)) if c == "R"));

        let only_ensemble = Table::from_csv_str("R,Avg_X_Ensemble\n1.0,2.0\n").unwrap();
        assert!(matches!(
            ScanTable::from_table(&only_ensemble),
            Err(RefineError::MissingColumn(_))
        ));
    }

    #[test]
    fn test_empty_scan_is_no_data() {
        let empty = Table::from_csv_str("R,Avg_X_1\n").unwrap();
        assert!(matches!(ScanTable::from_table(&empty), Err(RefineError::NoData(_))));
    }

    #[test]
    fn test_rows_without_r_are_reported() {
        let raw = Table::from_csv_str("R,Avg_X_1\n1e40,1.0\n2.0,3.0\n").unwrap();
        let table = ScanTable::from_table(&SentinelCleaner::default().clean(&raw)).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.skipped.len(), 1);
        assert_eq!(table.skipped[0].subject, "row 1");
    }

    #[test]
    fn test_text_cells_are_reported_as_missing() {
        let raw = Table::from_csv_str("R,Avg_X_1,Avg_X_2,Avg_X_Ensemble\n1.0,1.2.3,2.0,n/a\n").unwrap();
        let table = ScanTable::from_table(&SentinelCleaner::default().clean(&raw)).unwrap();

        assert_eq!(table.rows[0].replica_averages, vec![None, Some(2.0)]);
        assert_eq!(table.rows[0].ensemble_mean, None);
        assert_eq!(table.skipped.len(), 2);
        assert_eq!(table.skipped[0].subject, "R=1 Avg_X_1");
        assert!(table.skipped[0].reason.contains("1.2.3"));
        assert_eq!(table.skipped[1].subject, "R=1 Avg_X_Ensemble");
    }

    #[test]
    fn test_population_statistics() {
        let stats = replica_stats(&[Some(1.0), Some(2.0), Some(3.0), None]).unwrap();
        assert_relative_eq!(stats.mean, 2.0);
        assert_relative_eq!(stats.std_dev, (2.0_f64 / 3.0).sqrt(), epsilon = 1e-12);
        assert_relative_eq!(stats.std_dev, 0.8165, epsilon = 1e-4);
        assert_eq!(stats.valid, 3);

        assert!(replica_stats(&[None, None]).is_none());
    }

    #[test]
    fn test_aggregate_rows_and_band() {
        let rows = aggregate_rows(&scan()).unwrap();
        assert_relative_eq!(rows[0].ensemble_mean.unwrap(), 2.0);
        assert_eq!(rows[1].ensemble_mean, None);
        assert_eq!(rows[1].ensemble_std_dev, None);
        assert_relative_eq!(rows[2].ensemble_std_dev.unwrap(), 0.5);

        let band = ensemble_band(&rows);
        assert_eq!(band.len(), 2);
        assert_eq!(band[1].r, 2.0);
    }

    #[test]
    fn test_bifurcation_cloud_keeps_multiplicity() {
        let cloud = bifurcation_cloud(&scan());
        assert_eq!(cloud.len(), 7);
        assert_eq!(cloud.iter().filter(|p| p.r == 2.0 && p.value == 4.0).count(), 2);
        assert!(cloud.iter().all(|p| p.r != 1.0));
    }

    #[test]
    fn test_nearest_row_selection() {
        let rows = scan().rows;
        assert_eq!(nearest_row(&rows, 1.4), Some(1));
        assert_eq!(nearest_row(&rows, 0.75), Some(0));
        assert_eq!(nearest_row(&rows, 100.0), Some(2));
    }

    #[test]
    fn test_histogram_samples_skip_empty_rows() {
        let selection = histogram_samples(&scan(), &[0.4, 1.1, 1.9]).unwrap();
        assert_eq!(selection.samples.len(), 2);
        assert_eq!(selection.samples[0].values, vec![1.0, 2.0, 3.0]);
        assert_eq!(selection.samples[1].r, 2.0);
        assert_eq!(selection.skipped.len(), 1);
        assert!(selection.skipped[0].subject.starts_with("R=1.000"));
    }

    #[test]
    fn test_histogram_samples_without_usable_targets() {
        let raw = Table::from_csv_str("R,Avg_X_1\n1.0,1e40\n").unwrap();
        let table = ScanTable::from_table(&SentinelCleaner::default().clean(&raw)).unwrap();

        let all_skipped = histogram_samples(&table, &[1.0, 2.0]);
        assert!(matches!(all_skipped, Err(RefineError::NoData(m)) if m.contains("2 skipped")));
        assert!(matches!(histogram_samples(&table, &[]), Err(RefineError::NoData(_))));
    }

    #[test]
    fn test_histogram_samples_rejects_non_finite_target() {
        let result = histogram_samples(&scan(), &[1.5, f64::NAN]);
        assert!(matches!(result, Err(RefineError::InvalidConfig(_))));
    }

    #[test]
    fn test_histogram_density_area() {
        let values = [0.0, 0.1, 0.2, 0.9, 1.0, 1.0];
        let hist = Histogram::density(&values, 5).unwrap();
        assert_eq!(hist.edges.len(), 6);
        assert_eq!(hist.counts.iter().sum::<usize>(), values.len());
        assert_eq!(hist.counts[4], 3);

        let width = hist.edges[1] - hist.edges[0];
        let area = hist.density.iter().map(|d| d * width).sum::<f64>();
        assert_relative_eq!(area, 1.0, epsilon = 1e-12);

        let flat = Histogram::density(&[2.0, 2.0], 4).unwrap();
        assert_relative_eq!(flat.edges[0], 1.5);
        assert!(Histogram::density(&[], 4).is_none());
    }
}
