//! # Refine Trajectory
//!
//! Ingestion and reconciliation of reference (RK4) and parallel-in-time
//! (Parareal) trajectories.
//!
//! ## Capabilities
//!
//! 1. **Record parsing**: tolerant line grammar for solver text output
//! 2. **Alignment**: not-a-knot cubic (or linear) resampling onto the reference grid
//! 3. **Error metrics**: per-dimension max-abs and RMS deviation
//! 4. **Run catalog**: pairs reference and parallel runs by control parameter
//! 5. **Sweeps**: per-tau error tables, one pair resident at a time

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use refine_core::{
    AlignmentFailure, Diagnostic, Dimension, DimensionError, ErrorMetrics, Method, ParseFailure,
    RefineError, Result, RunLabel, Sampling, Time, Trajectory, TrajectoryRole,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// ============================================================================
// RECORD PARSER
// ============================================================================

/// Fixed-width overflow rendering emitted by the solver on divergence
pub const OVERFLOW_MARKER: &str = "**";

/// Minimum fields per row: t, X, Y, Z
pub const MIN_FIELDS: usize = 4;

/// Why a data line was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    Blank,
    OverflowMarker,
    NoDigits,
    NonNumericToken,
    NonFinite,
    TooFewFields,
}

/// Outcome of classifying one data line
#[derive(Debug, Clone, PartialEq)]
pub enum LineVerdict {
    Accepted(Vec<f64>),
    Skipped(SkipReason),
}

/// Classify a single data line (the header is handled by [`parse_records`]).
///
/// Rules, in order: blank, contains `**`, has no digit, any token fails to
/// parse, any value non-finite, fewer than [`MIN_FIELDS`] values.
pub fn classify_line(line: &str) -> LineVerdict {
    let line = line.trim();
    if line.is_empty() {
        return LineVerdict::Skipped(SkipReason::Blank);
    }
    if line.contains(OVERFLOW_MARKER) {
        return LineVerdict::Skipped(SkipReason::OverflowMarker);
    }
    if !line.bytes().any(|b| b.is_ascii_digit()) {
        return LineVerdict::Skipped(SkipReason::NoDigits);
    }

    let fields = match line
        .split_whitespace()
        .map(str::parse::<f64>)
        .collect::<std::result::Result<Vec<_>, _>>()
    {
        Ok(fields) => fields,
        Err(_) => return LineVerdict::Skipped(SkipReason::NonNumericToken),
    };

    if fields.iter().any(|v| !v.is_finite()) {
        return LineVerdict::Skipped(SkipReason::NonFinite);
    }
    if fields.len() < MIN_FIELDS {
        return LineVerdict::Skipped(SkipReason::TooFewFields);
    }
    LineVerdict::Accepted(fields)
}

/// One accepted data row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRecord {
    /// 1-based line number in the source text
    pub line_number: usize,
    /// Every numeric field of the line, trailing extras included
    pub fields: Vec<f64>,
}

impl ParsedRecord {
    pub fn time(&self) -> Time {
        self.fields[0]
    }
}

/// Accepted rows plus per-reason skip counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedRecords {
    pub records: Vec<ParsedRecord>,
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl ParsedRecords {
    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    /// Build a trajectory from the first four fields of every record.
    ///
    /// Rows are stable-sorted by time when the source went backwards.
    pub fn into_trajectory(mut self, origin: &str) -> Result<Trajectory> {
        if self.records.is_empty() {
            return Err(RefineError::Parse {
                origin: origin.to_string(),
                kind: ParseFailure::EmptyResult,
            });
        }

        if self.records.windows(2).any(|w| w[1].time() < w[0].time()) {
            debug!(origin, "time column not monotonic, sorting rows");
            self.records.sort_by(|a, b| a.time().total_cmp(&b.time()));
        }

        let n = self.records.len();
        let time = self.records.iter().map(ParsedRecord::time).collect::<Array1<_>>();
        let mut states = Array2::zeros((n, Trajectory::STATE_DIM));
        for (i, record) in self.records.iter().enumerate() {
            for j in 0..Trajectory::STATE_DIM {
                states[[i, j]] = record.fields[j + 1];
            }
        }
        Trajectory::new(time, states)
    }
}

/// Apply the line grammar to raw text. The first line is always a header.
pub fn parse_records(text: &str) -> ParsedRecords {
    let mut parsed = ParsedRecords::default();

    for (idx, line) in text.lines().enumerate().skip(1) {
        match classify_line(line) {
            LineVerdict::Accepted(fields) => parsed.records.push(ParsedRecord {
                line_number: idx + 1,
                fields,
            }),
            LineVerdict::Skipped(reason) => *parsed.skipped.entry(reason).or_insert(0) += 1,
        }
    }

    parsed
}

/// Parse trajectory text; `origin` names the source in errors and logs
pub fn parse_trajectory(origin: &str, text: &str) -> Result<Trajectory> {
    let parsed = parse_records(text);
    debug!(
        origin,
        accepted = parsed.records.len(),
        skipped = parsed.skipped_total(),
        "parsed trajectory text"
    );
    parsed.into_trajectory(origin)
}

/// Read and parse a trajectory file
pub fn read_trajectory(path: &Path) -> Result<Trajectory> {
    let text = std::fs::read_to_string(path)?;
    parse_trajectory(&path.display().to_string(), &text)
}

/// A trajectory together with the label derived from its file name
#[derive(Debug, Clone)]
pub struct LabeledTrajectory {
    pub label: RunLabel,
    pub trajectory: Trajectory,
}

/// Read a trajectory and label it from its path
pub fn load_labeled(path: &Path) -> Result<LabeledTrajectory> {
    Ok(LabeledTrajectory {
        label: RunLabel::from_identifier(&path.to_string_lossy()),
        trajectory: read_trajectory(path)?,
    })
}

// ============================================================================
// INTERPOLATION
// ============================================================================

/// Interpolant family used for a resampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterpolationKind {
    /// Not-a-knot cubic spline (4 or more knots)
    Cubic,
    /// Piecewise linear (2 or 3 knots)
    Linear,
}

/// Minimum knots for a well-posed not-a-knot cubic
pub const CUBIC_MIN_KNOTS: usize = 4;

/// Piecewise interpolant over strictly increasing knots.
///
/// Outside the knot span the end pieces are extended (extrapolation).
#[derive(Debug, Clone)]
pub struct Interpolant {
    kind: InterpolationKind,
    knots: Vec<f64>,
    values: Vec<f64>,
    /// Spline second derivatives at the knots (empty for linear)
    curvature: Vec<f64>,
}

impl Interpolant {
    pub fn fit(knots: &[f64], values: &[f64]) -> Result<Self> {
        if knots.len() != values.len() {
            return Err(AlignmentFailure::LengthMismatch {
                reference: knots.len(),
                comparison: values.len(),
            }
            .into());
        }
        if knots.len() < 2 {
            return Err(AlignmentFailure::InsufficientSamples {
                role: TrajectoryRole::Comparison,
                samples: knots.len(),
            }
            .into());
        }
        if knots.windows(2).any(|w| w[1] <= w[0]) {
            return Err(RefineError::InvalidTrajectory(
                "interpolation knots must be strictly increasing".into(),
            ));
        }

        let (kind, curvature) = if knots.len() >= CUBIC_MIN_KNOTS {
            (InterpolationKind::Cubic, not_a_knot_curvature(knots, values)?)
        } else {
            (InterpolationKind::Linear, Vec::new())
        };

        Ok(Self {
            kind,
            knots: knots.to_vec(),
            values: values.to_vec(),
            curvature,
        })
    }

    pub fn kind(&self) -> InterpolationKind {
        self.kind
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        let n = self.knots.len();
        let idx = self.knots.partition_point(|&k| k < x);
        if idx < n && self.knots[idx] == x {
            return self.values[idx];
        }
        let i = idx.saturating_sub(1).min(n - 2);

        let (x0, x1) = (self.knots[i], self.knots[i + 1]);
        let (y0, y1) = (self.values[i], self.values[i + 1]);
        let h = x1 - x0;

        match self.kind {
            InterpolationKind::Linear => y0 + (y1 - y0) * (x - x0) / h,
            InterpolationKind::Cubic => {
                let (m0, m1) = (self.curvature[i], self.curvature[i + 1]);
                let a = x1 - x;
                let b = x - x0;
                m0 * a.powi(3) / (6.0 * h)
                    + m1 * b.powi(3) / (6.0 * h)
                    + (y0 / h - m0 * h / 6.0) * a
                    + (y1 / h - m1 * h / 6.0) * b
            }
        }
    }
}

/// Second derivatives of the not-a-knot cubic spline (n >= 4).
///
/// The two end conditions are folded into the first and last interior rows,
/// leaving a tridiagonal system in M_1..M_{n-2}.
fn not_a_knot_curvature(x: &[f64], y: &[f64]) -> Result<Vec<f64>> {
    let n = x.len();
    let h = x.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
    let slope = (0..n - 1).map(|i| (y[i + 1] - y[i]) / h[i]).collect::<Vec<_>>();

    let m = n - 2;
    let mut sub = vec![0.0; m];
    let mut diag = vec![0.0; m];
    let mut sup = vec![0.0; m];
    let mut rhs = vec![0.0; m];
    for k in 0..m {
        let i = k + 1;
        sub[k] = h[i - 1];
        diag[k] = 2.0 * (h[i - 1] + h[i]);
        sup[k] = h[i];
        rhs[k] = 6.0 * (slope[i] - slope[i - 1]);
    }

    let (h0, h1) = (h[0], h[1]);
    diag[0] = (h0 + h1) * (h0 + 2.0 * h1) / h1;
    sup[0] = (h1 * h1 - h0 * h0) / h1;

    let (a, b) = (h[n - 3], h[n - 2]);
    sub[m - 1] = (a * a - b * b) / a;
    diag[m - 1] = (a + b) * (2.0 * a + b) / a;

    let interior = solve_tridiagonal(&sub, &diag, &sup, &rhs).ok_or_else(|| {
        RefineError::InvalidTrajectory("spline system is singular".into())
    })?;

    let mut curvature = Vec::with_capacity(n);
    curvature.push(((h0 + h1) * interior[0] - h0 * interior[1]) / h1);
    curvature.extend_from_slice(&interior);
    curvature.push(((a + b) * interior[m - 1] - b * interior[m - 2]) / a);
    Ok(curvature)
}

/// Thomas algorithm; `None` on a vanishing pivot
fn solve_tridiagonal(sub: &[f64], diag: &[f64], sup: &[f64], rhs: &[f64]) -> Option<Vec<f64>> {
    let n = diag.len();
    let mut c = vec![0.0; n];
    let mut d = vec![0.0; n];

    for k in 0..n {
        let (prev_c, prev_d) = if k == 0 { (0.0, 0.0) } else { (c[k - 1], d[k - 1]) };
        let lower = if k == 0 { 0.0 } else { sub[k] };
        let pivot = diag[k] - lower * prev_c;
        if pivot.abs() < 1e-300 {
            return None;
        }
        c[k] = sup[k] / pivot;
        d[k] = (rhs[k] - lower * prev_d) / pivot;
    }

    let mut x = vec![0.0; n];
    x[n - 1] = d[n - 1];
    for k in (0..n - 1).rev() {
        x[k] = d[k] - c[k] * x[k + 1];
    }
    Some(x)
}

/// Knots with duplicate time stamps collapsed onto their last sample
fn distinct_knots(time: ArrayView1<'_, Time>, values: ArrayView1<'_, f64>) -> (Vec<f64>, Vec<f64>) {
    let mut knots: Vec<f64> = Vec::with_capacity(time.len());
    let mut ys: Vec<f64> = Vec::with_capacity(time.len());
    for (&t, &v) in time.iter().zip(values.iter()) {
        match knots.last() {
            Some(&last) if last == t => {
                if let Some(y) = ys.last_mut() {
                    *y = v;
                }
            }
            _ => {
                knots.push(t);
                ys.push(v);
            }
        }
    }
    (knots, ys)
}

// ============================================================================
// ALIGNMENT
// ============================================================================

/// Sampling density of the comparison relative to the reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingRelation {
    /// Comparison has strictly fewer samples: resample it
    Sparser,
    /// Comparison has as many or more samples: no meaningful alignment
    NotSparser,
}

pub fn classify_sampling(reference_samples: usize, comparison_samples: usize) -> SamplingRelation {
    if comparison_samples < reference_samples {
        SamplingRelation::Sparser
    } else {
        SamplingRelation::NotSparser
    }
}

/// A trajectory evaluated on foreign time stamps
#[derive(Debug, Clone, Serialize)]
pub struct Resampled {
    pub kind: InterpolationKind,
    /// Rows follow the target time stamps, columns are X, Y, Z
    pub values: Array2<f64>,
    /// Target time stamps outside the source span
    pub extrapolated: usize,
}

/// Evaluate `trajectory` at `timestamps`, one interpolant per dimension
pub fn resample_onto(trajectory: &Trajectory, timestamps: ArrayView1<'_, Time>) -> Result<Resampled> {
    if trajectory.len() < 2 {
        return Err(AlignmentFailure::InsufficientSamples {
            role: TrajectoryRole::Comparison,
            samples: trajectory.len(),
        }
        .into());
    }

    let mut values = Array2::zeros((timestamps.len(), Trajectory::STATE_DIM));
    let mut kind = InterpolationKind::Linear;
    for dim in Dimension::ALL {
        let (knots, ys) = distinct_knots(trajectory.time(), trajectory.component(dim));
        let interpolant = Interpolant::fit(&knots, &ys)?;
        kind = interpolant.kind();
        for (row, &t) in timestamps.iter().enumerate() {
            values[[row, dim.index()]] = interpolant.evaluate(t);
        }
    }

    let (start, end) = trajectory.time_span();
    let extrapolated = timestamps.iter().filter(|&&t| t < start || t > end).count();
    if extrapolated > 0 {
        debug!(extrapolated, start, end, "resampling extrapolates beyond source span");
    }

    Ok(Resampled {
        kind,
        values,
        extrapolated,
    })
}

/// Result of bringing a comparison onto the reference time grid
#[derive(Debug, Clone, Serialize)]
pub enum Alignment {
    Resampled(Resampled),
    NotSparser {
        reference_samples: usize,
        comparison_samples: usize,
    },
}

pub fn align(reference: &Trajectory, comparison: &Trajectory) -> Result<Alignment> {
    for (role, traj) in [
        (TrajectoryRole::Reference, reference),
        (TrajectoryRole::Comparison, comparison),
    ] {
        if traj.len() < 2 {
            return Err(AlignmentFailure::InsufficientSamples {
                role,
                samples: traj.len(),
            }
            .into());
        }
    }

    match classify_sampling(reference.len(), comparison.len()) {
        SamplingRelation::Sparser => Ok(Alignment::Resampled(resample_onto(
            comparison,
            reference.time(),
        )?)),
        SamplingRelation::NotSparser => {
            debug!(
                reference = reference.len(),
                comparison = comparison.len(),
                "comparison is not sparser than reference, metrics undefined"
            );
            Ok(Alignment::NotSparser {
                reference_samples: reference.len(),
                comparison_samples: comparison.len(),
            })
        }
    }
}

/// Errors of a successfully aligned comparison
#[derive(Debug, Clone, Serialize)]
pub struct MeasuredComparison {
    pub metrics: ErrorMetrics,
    /// |reference - resampled| per reference sample, columns X, Y, Z
    pub pointwise: Array2<f64>,
    pub interpolation: InterpolationKind,
    pub extrapolated: usize,
}

/// Comparison outcome. `Undefined` is never reported as zero error.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum Comparison {
    Measured(MeasuredComparison),
    Undefined {
        reference_samples: usize,
        comparison_samples: usize,
    },
}

impl Comparison {
    pub fn metrics(&self) -> Option<&ErrorMetrics> {
        match self {
            Self::Measured(m) => Some(&m.metrics),
            Self::Undefined { .. } => None,
        }
    }

    pub fn is_defined(&self) -> bool {
        matches!(self, Self::Measured(_))
    }
}

/// Align `comparison` onto `reference` and measure the deviation
pub fn compare(reference: &Trajectory, comparison: &Trajectory) -> Result<Comparison> {
    match align(reference, comparison)? {
        Alignment::Resampled(resampled) => {
            let metrics = error_metrics(reference.states(), resampled.values.view())?;
            let pointwise = (&reference.states() - &resampled.values).mapv(f64::abs);
            Ok(Comparison::Measured(MeasuredComparison {
                metrics,
                pointwise,
                interpolation: resampled.kind,
                extrapolated: resampled.extrapolated,
            }))
        }
        Alignment::NotSparser {
            reference_samples,
            comparison_samples,
        } => Ok(Comparison::Undefined {
            reference_samples,
            comparison_samples,
        }),
    }
}

// ============================================================================
// ERROR METRICS
// ============================================================================

/// max |a_i - b_i| and sqrt(mean((a_i - b_i)^2)) over equal-length sequences
pub fn dimension_error(
    reference: ArrayView1<'_, f64>,
    comparison: ArrayView1<'_, f64>,
) -> Result<DimensionError> {
    if reference.len() != comparison.len() || reference.is_empty() {
        return Err(AlignmentFailure::LengthMismatch {
            reference: reference.len(),
            comparison: comparison.len(),
        }
        .into());
    }

    let (max_abs_error, sum_sq) = reference
        .iter()
        .zip(comparison.iter())
        .map(|(a, b)| (a - b).abs())
        .fold((0.0_f64, 0.0_f64), |(max, sum), d| (max.max(d), sum + d * d));

    Ok(DimensionError {
        max_abs_error,
        l2_error: (sum_sq / reference.len() as f64).sqrt(),
    })
}

/// Per-dimension metrics for two `n x 3` state matrices
pub fn error_metrics(
    reference: ArrayView2<'_, f64>,
    resampled: ArrayView2<'_, f64>,
) -> Result<ErrorMetrics> {
    if reference.dim() != resampled.dim() || reference.ncols() != Trajectory::STATE_DIM {
        return Err(AlignmentFailure::LengthMismatch {
            reference: reference.nrows(),
            comparison: resampled.nrows(),
        }
        .into());
    }

    let per_dimension = Dimension::ALL
        .iter()
        .map(|&dim| {
            dimension_error(reference.column(dim.index()), resampled.column(dim.index()))
                .map(|err| (dim, err))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    Ok(ErrorMetrics { per_dimension })
}

// ============================================================================
// RUN CATALOG
// ============================================================================

/// Control parameters match when equal at one decimal
pub fn tau_key(tau: f64) -> i64 {
    (tau * 10.0).round() as i64
}

/// A labelled trajectory file
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub path: PathBuf,
    pub label: RunLabel,
}

/// Reference and parallel runs sharing a control parameter
#[derive(Debug, Clone, Serialize)]
pub struct RunPair {
    pub tau: f64,
    pub reference: CatalogEntry,
    pub comparison: CatalogEntry,
}

impl RunPair {
    pub fn is_dense(&self) -> bool {
        self.comparison.label.sampling == Sampling::Dense
    }
}

/// Explicitly listed trajectory files, labelled once
#[derive(Debug, Clone, Default)]
pub struct RunCatalog {
    entries: Vec<CatalogEntry>,
    unlabeled: Vec<Diagnostic>,
}

impl RunCatalog {
    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut catalog = Self::default();
        for path in paths {
            let path = path.as_ref();
            let label = RunLabel::from_identifier(&path.to_string_lossy());
            if label.control_param.is_none() {
                catalog.unlabeled.push(Diagnostic::skipped(
                    label.source_name.clone(),
                    "no tau<value> token in file name",
                ));
                continue;
            }
            catalog.entries.push(CatalogEntry {
                path: path.to_path_buf(),
                label,
            });
        }
        catalog
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn unlabeled(&self) -> &[Diagnostic] {
        &self.unlabeled
    }

    /// Distinct control parameters, ascending
    pub fn taus(&self) -> Vec<f64> {
        let mut by_key = BTreeMap::new();
        for tau in self.entries.iter().filter_map(|e| e.label.control_param) {
            by_key.entry(tau_key(tau)).or_insert(tau);
        }
        by_key.into_values().collect()
    }

    /// Pair for one tau; a dense parallel run wins over a standard one
    pub fn pair_for(&self, tau: f64) -> Result<RunPair> {
        let key = tau_key(tau);
        let matching = || {
            self.entries
                .iter()
                .filter(move |e| e.label.control_param.map(tau_key) == Some(key))
        };

        let reference = matching().find(|e| e.label.method == Method::Reference);
        let comparison = matching()
            .find(|e| e.label.method == Method::Parallel && e.label.sampling == Sampling::Dense)
            .or_else(|| {
                matching().find(|e| {
                    e.label.method == Method::Parallel && e.label.sampling == Sampling::Standard
                })
            });

        match (reference, comparison) {
            (Some(reference), Some(comparison)) => Ok(RunPair {
                tau,
                reference: reference.clone(),
                comparison: comparison.clone(),
            }),
            (None, _) => Err(RefineError::NoData(format!(
                "no reference run for tau={:.1}",
                tau
            ))),
            (_, None) => Err(RefineError::NoData(format!(
                "no parallel run for tau={:.1}",
                tau
            ))),
        }
    }

    /// Every complete pair, plus a diagnostic per incomplete tau
    pub fn pairs(&self) -> (Vec<RunPair>, Vec<Diagnostic>) {
        let mut pairs = Vec::new();
        let mut skipped = Vec::new();
        for tau in self.taus() {
            match self.pair_for(tau) {
                Ok(pair) => pairs.push(pair),
                Err(e) => skipped.push(Diagnostic::skipped(format!("tau={:.1}", tau), e)),
            }
        }
        (pairs, skipped)
    }
}

// ============================================================================
// SWEEPS
// ============================================================================

/// Outcome of one pair, without the pointwise matrix
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status")]
pub enum PairOutcome {
    Measured {
        metrics: ErrorMetrics,
        interpolation: InterpolationKind,
        extrapolated: usize,
    },
    Undefined {
        reference_samples: usize,
        comparison_samples: usize,
    },
}

impl From<Comparison> for PairOutcome {
    fn from(comparison: Comparison) -> Self {
        match comparison {
            Comparison::Measured(m) => Self::Measured {
                metrics: m.metrics,
                interpolation: m.interpolation,
                extrapolated: m.extrapolated,
            },
            Comparison::Undefined {
                reference_samples,
                comparison_samples,
            } => Self::Undefined {
                reference_samples,
                comparison_samples,
            },
        }
    }
}

/// One row of the per-tau error table
#[derive(Debug, Clone, Serialize)]
pub struct TauSummary {
    pub tau: f64,
    pub reference_file: String,
    pub comparison_file: String,
    pub dense: bool,
    pub outcome: PairOutcome,
}

impl TauSummary {
    pub fn metrics(&self) -> Option<&ErrorMetrics> {
        match &self.outcome {
            PairOutcome::Measured { metrics, .. } => Some(metrics),
            PairOutcome::Undefined { .. } => None,
        }
    }
}

/// Per-tau table plus everything that was skipped
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub rows: Vec<TauSummary>,
    pub skipped: Vec<Diagnostic>,
}

impl SweepReport {
    /// Fails only when no pair produced a row
    pub fn from_parts(mut rows: Vec<TauSummary>, skipped: Vec<Diagnostic>) -> Result<Self> {
        if rows.is_empty() {
            return Err(RefineError::NoData(format!(
                "no tau value produced a comparison ({} skipped)",
                skipped.len()
            )));
        }
        rows.sort_by(|a, b| a.tau.total_cmp(&b.tau));
        Ok(Self { rows, skipped })
    }
}

/// Load and compare one pair; both trajectories are dropped on return
pub fn compare_pair<F>(pair: &RunPair, load: F) -> Result<TauSummary>
where
    F: Fn(&Path) -> Result<Trajectory>,
{
    info!(tau = pair.tau, dense = pair.is_dense(), "comparing pair");
    let reference = load(&pair.reference.path)?;
    let comparison = load(&pair.comparison.path)?;
    let outcome = compare(&reference, &comparison)?.into();

    Ok(TauSummary {
        tau: pair.tau,
        reference_file: pair.reference.label.source_name.clone(),
        comparison_file: pair.comparison.label.source_name.clone(),
        dense: pair.is_dense(),
        outcome,
    })
}

/// Compare every complete pair of the catalog, in ascending tau
pub fn compare_sweep<F>(catalog: &RunCatalog, load: F) -> Result<SweepReport>
where
    F: Fn(&Path) -> Result<Trajectory>,
{
    compare_sweep_by(catalog, |pairs| {
        pairs.iter().map(|pair| compare_pair(pair, &load)).collect()
    })
}

/// Like [`compare_sweep`], with the caller choosing how the pairs are run.
///
/// `run` receives the complete pairs in ascending tau and must return one
/// result per pair, in the same order.
pub fn compare_sweep_by<R>(catalog: &RunCatalog, run: R) -> Result<SweepReport>
where
    R: FnOnce(&[RunPair]) -> Vec<Result<TauSummary>>,
{
    let (pairs, mut skipped) = catalog.pairs();
    skipped.extend_from_slice(catalog.unlabeled());

    let results = run(&pairs);
    if results.len() != pairs.len() {
        return Err(RefineError::NoData(format!(
            "sweep returned {} results for {} pairs",
            results.len(),
            pairs.len()
        )));
    }

    let mut rows = Vec::with_capacity(pairs.len());
    for (pair, result) in pairs.iter().zip(results) {
        match result {
            Ok(summary) => rows.push(summary),
            Err(e) => skipped.push(Diagnostic::skipped(format!("tau={:.1}", pair.tau), e)),
        }
    }

    SweepReport::from_parts(rows, skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::fs;

    fn smooth_trajectory(step: f64, count: usize) -> Trajectory {
        let samples = (0..count)
            .map(|i| {
                let t = i as f64 * step;
                (t, [t.sin(), t.cos(), t * t])
            })
            .collect::<Vec<_>>();
        Trajectory::from_samples(&samples).unwrap()
    }

    fn trajectory_text(traj: &Trajectory) -> String {
        let mut text = String::from("t X Y Z\n");
        for (i, t) in traj.time().iter().enumerate() {
            let s = traj.states().row(i).to_vec();
            text.push_str(&format!("{} {} {} {}\n", t, s[0], s[1], s[2]));
        }
        text
    }

    #[test]
    fn test_classify_line_grammar() {
        assert_eq!(classify_line("   "), LineVerdict::Skipped(SkipReason::Blank));
        assert_eq!(
            classify_line("0.1 ****** 2.0 3.0"),
            LineVerdict::Skipped(SkipReason::OverflowMarker)
        );
        assert_eq!(classify_line("t X Y Z"), LineVerdict::Skipped(SkipReason::NoDigits));
        assert_eq!(
            classify_line("0.1 1.0 abc2 3.0"),
            LineVerdict::Skipped(SkipReason::NonNumericToken)
        );
        assert_eq!(
            classify_line("0.1 1.0 inf 3.0"),
            LineVerdict::Skipped(SkipReason::NonFinite)
        );
        assert_eq!(classify_line("0.1 1.0 2.0"), LineVerdict::Skipped(SkipReason::TooFewFields));
        assert_eq!(
            classify_line("  0.1 1.0 2.0 3.0 9.0  "),
            LineVerdict::Accepted(vec![0.1, 1.0, 2.0, 3.0, 9.0])
        );
    }

    #[test]
    fn test_parse_records_skips_header_and_keeps_fields() {
        let text = "0.0 9.0 9.0 9.0\n0.0 1.0 2.0 3.0\n\n0.5 1.5 2.5 3.5 42.0\n0.7 ** 1 1\n";
        let parsed = parse_records(text);

        assert!(parsed.records.len() <= text.lines().count());
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].line_number, 2);
        assert_eq!(parsed.records[1].fields, vec![0.5, 1.5, 2.5, 3.5, 42.0]);
        assert_eq!(parsed.skipped[&SkipReason::Blank], 1);
        assert_eq!(parsed.skipped[&SkipReason::OverflowMarker], 1);
    }

    #[test]
    fn test_parse_trajectory_empty_result() {
        let result = parse_trajectory("broken.dat", "header\n***\nnan nan\n");
        assert!(matches!(
            result,
            Err(RefineError::Parse {
                kind: ParseFailure::EmptyResult,
                ..
            })
        ));
    }

    #[test]
    fn test_parse_trajectory_ignores_trailing_fields_and_sorts() {
        let text = "t X Y Z iter\n1.0 4 5 6 2\n0.0 1 2 3 1\n";
        let traj = parse_trajectory("t.dat", text).unwrap();
        assert_eq!(traj.time().to_vec(), vec![0.0, 1.0]);
        assert_eq!(traj.component(Dimension::Z).to_vec(), vec![3.0, 6.0]);
    }

    #[test]
    fn test_cubic_reproduces_cubic_polynomial() {
        let knots = [0.0, 1.0, 2.5, 3.0, 4.0];
        let values = knots.iter().map(|x: &f64| x.powi(3) - 2.0 * x).collect::<Vec<_>>();
        let spline = Interpolant::fit(&knots, &values).unwrap();

        assert_eq!(spline.kind(), InterpolationKind::Cubic);
        for x in [0.5, 1.7, 2.9, 3.5, 5.0, -1.0] {
            assert_abs_diff_eq!(spline.evaluate(x), x.powi(3) - 2.0 * x, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_linear_fallback_for_few_knots() {
        let spline = Interpolant::fit(&[0.0, 1.0, 3.0], &[0.0, 2.0, 0.0]).unwrap();
        assert_eq!(spline.kind(), InterpolationKind::Linear);
        assert_abs_diff_eq!(spline.evaluate(0.5), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(spline.evaluate(2.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(spline.evaluate(4.0), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_self_resampling_is_exact() {
        let traj = smooth_trajectory(0.1, 30);
        let resampled = resample_onto(&traj, traj.time()).unwrap();
        let metrics = error_metrics(traj.states(), resampled.values.view()).unwrap();

        for dim in Dimension::ALL {
            let err = metrics.get(dim).unwrap();
            assert_eq!(err.max_abs_error, 0.0);
            assert_eq!(err.l2_error, 0.0);
        }
        assert_eq!(resampled.extrapolated, 0);
    }

    #[test]
    fn test_dimension_error_values() {
        let zeros = Array1::from(vec![0.0, 0.0, 0.0]);
        let ones = Array1::from(vec![1.0, 1.0, 1.0]);

        let same = dimension_error(ones.view(), ones.view()).unwrap();
        assert_eq!(same.max_abs_error, 0.0);
        assert_eq!(same.l2_error, 0.0);

        let unit = dimension_error(zeros.view(), ones.view()).unwrap();
        assert_eq!(unit.max_abs_error, 1.0);
        assert_eq!(unit.l2_error, 1.0);

        let short = Array1::from(vec![0.0]);
        assert!(dimension_error(zeros.view(), short.view()).is_err());
    }

    #[test]
    fn test_compare_sparser_interpolates() {
        let reference = smooth_trajectory(0.01, 201);
        let comparison = smooth_trajectory(0.1, 21);

        let result = compare(&reference, &comparison).unwrap();
        let Comparison::Measured(measured) = result else {
            panic!("expected measured comparison");
        };
        assert_eq!(measured.interpolation, InterpolationKind::Cubic);
        assert_eq!(measured.pointwise.dim(), (201, 3));
        for dim in Dimension::ALL {
            let err = measured.metrics.get(dim).unwrap();
            assert!(err.max_abs_error < 1e-4, "{} error {}", dim, err.max_abs_error);
            assert!(err.l2_error <= err.max_abs_error);
        }
    }

    #[test]
    fn test_compare_not_sparser_is_undefined() {
        let reference = smooth_trajectory(0.1, 21);
        let denser = smooth_trajectory(0.05, 41);

        let same = compare(&reference, &reference).unwrap();
        assert!(!same.is_defined());
        assert!(same.metrics().is_none());

        match compare(&reference, &denser).unwrap() {
            Comparison::Undefined {
                reference_samples,
                comparison_samples,
            } => {
                assert_eq!(reference_samples, 21);
                assert_eq!(comparison_samples, 41);
            }
            Comparison::Measured(_) => panic!("denser comparison must not be measured"),
        }
    }

    #[test]
    fn test_align_insufficient_samples() {
        let single = Trajectory::from_samples(&[(0.0, [1.0, 1.0, 1.0])]).unwrap();
        let reference = smooth_trajectory(0.1, 10);

        let err = align(&reference, &single).unwrap_err();
        assert!(matches!(
            err,
            RefineError::Alignment(AlignmentFailure::InsufficientSamples {
                role: TrajectoryRole::Comparison,
                samples: 1
            })
        ));

        let err = align(&single, &reference).unwrap_err();
        assert!(matches!(
            err,
            RefineError::Alignment(AlignmentFailure::InsufficientSamples {
                role: TrajectoryRole::Reference,
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_timestamps_collapse() {
        let comparison = Trajectory::from_samples(&[
            (0.0, [0.0, 0.0, 0.0]),
            (1.0, [5.0, 5.0, 5.0]),
            (1.0, [1.0, 1.0, 1.0]),
            (2.0, [2.0, 2.0, 2.0]),
        ])
        .unwrap();
        let targets = Array1::from(vec![0.5, 1.0, 1.5]);
        let resampled = resample_onto(&comparison, targets.view()).unwrap();

        assert_eq!(resampled.kind, InterpolationKind::Linear);
        assert_abs_diff_eq!(resampled.values[[1, 0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(resampled.values[[0, 0]], 0.5, epsilon = 1e-12);

        let stalled = Trajectory::from_samples(&[(1.0, [0.0; 3]), (1.0, [1.0; 3])]).unwrap();
        assert!(resample_onto(&stalled, targets.view()).is_err());
    }

    #[test]
    fn test_extrapolation_is_counted() {
        let comparison = smooth_trajectory(0.5, 5);
        let targets = Array1::from(vec![-0.5, 0.0, 1.0, 2.0, 2.5]);
        let resampled = resample_onto(&comparison, targets.view()).unwrap();
        assert_eq!(resampled.extrapolated, 2);
    }

    #[test]
    fn test_catalog_prefers_dense() {
        let catalog = RunCatalog::from_paths([
            "out/lorenz_rk4_tau5.0.dat",
            "out/lorenz_parareal_tau5.0.dat",
            "out/lorenz_parareal_dense_tau5.0.dat",
            "out/lorenz_rk4_tau1.0.dat",
            "out/lorenz_parareal_tau1.0.dat",
            "out/notes.dat",
        ]);

        assert_eq!(catalog.taus(), vec![1.0, 5.0]);
        assert_eq!(catalog.unlabeled().len(), 1);

        let pair = catalog.pair_for(5.0).unwrap();
        assert!(pair.is_dense());
        assert_eq!(pair.reference.label.source_name, "lorenz_rk4_tau5.0.dat");

        let pair = catalog.pair_for(1.0).unwrap();
        assert!(!pair.is_dense());
        assert_eq!(pair.comparison.label.source_name, "lorenz_parareal_tau1.0.dat");

        assert!(matches!(catalog.pair_for(2.0), Err(RefineError::NoData(_))));
    }

    #[test]
    fn test_sweep_streams_pairs_and_reports_skips() {
        let dir = tempfile::tempdir().unwrap();
        let reference = trajectory_text(&smooth_trajectory(0.01, 101));
        let sparse = trajectory_text(&smooth_trajectory(0.1, 11));

        fs::write(dir.path().join("lorenz_rk4_tau1.0.dat"), &reference).unwrap();
        fs::write(dir.path().join("lorenz_parareal_tau1.0.dat"), &sparse).unwrap();
        fs::write(dir.path().join("lorenz_rk4_tau2.0.dat"), &sparse).unwrap();
        fs::write(dir.path().join("lorenz_parareal_tau2.0.dat"), &reference).unwrap();
        fs::write(dir.path().join("lorenz_rk4_tau3.0.dat"), &reference).unwrap();
        fs::write(dir.path().join("lorenz_parareal_tau3.0.dat"), "header only\n").unwrap();
        fs::write(dir.path().join("lorenz_rk4_tau4.0.dat"), &reference).unwrap();

        let mut paths = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        paths.sort();

        let catalog = RunCatalog::from_paths(&paths);
        let report = compare_sweep(&catalog, read_trajectory).unwrap();

        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0].tau, 1.0);
        assert!(report.rows[0].metrics().is_some());
        assert!(report.rows[1].metrics().is_none());
        assert_eq!(report.skipped.len(), 2);
        assert!(report.skipped.iter().any(|d| d.subject == "tau=3.0"));
        assert!(report.skipped.iter().any(|d| d.subject == "tau=4.0"));
    }

    #[test]
    fn test_sweep_by_keeps_pair_order_for_diagnostics() {
        let catalog = RunCatalog::from_paths([
            "lorenz_rk4_tau2.0.dat",
            "lorenz_parareal_tau2.0.dat",
            "lorenz_rk4_tau1.0.dat",
            "lorenz_parareal_tau1.0.dat",
        ]);

        let report = compare_sweep_by(&catalog, |pairs| {
            pairs
                .iter()
                .map(|pair| {
                    if pair.tau == 1.0 {
                        Err(RefineError::NoData("unreadable".into()))
                    } else {
                        let reference = smooth_trajectory(0.01, 101);
                        let comparison = smooth_trajectory(0.1, 11);
                        compare_pair(pair, |path: &Path| {
                            if path == pair.reference.path {
                                Ok(reference.clone())
                            } else {
                                Ok(comparison.clone())
                            }
                        })
                    }
                })
                .collect()
        })
        .unwrap();

        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.rows[0].tau, 2.0);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].subject, "tau=1.0");

        let short = compare_sweep_by(&catalog, |_| Vec::new());
        assert!(matches!(short, Err(RefineError::NoData(_))));
    }

    #[test]
    fn test_sweep_without_pairs_is_no_data() {
        let catalog = RunCatalog::from_paths(["a_rk4_tau1.0.dat"]);
        let result = compare_sweep(&catalog, read_trajectory);
        assert!(matches!(result, Err(RefineError::NoData(_))));
    }
}
