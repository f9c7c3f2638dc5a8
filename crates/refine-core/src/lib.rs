//! # Refine Core
//!
//! Shared types for reconciling reference and parallel-in-time trajectories.
//!
//! ## Data Flow
//!
//! | Stage | Crate | Produces |
//! |-------|-------|----------|
//! | Ingestion | `refine-trajectory`, `refine-ensemble` | [`Trajectory`], scan tables |
//! | Labelling | `refine-core` | [`RunLabel`] |
//! | Alignment + metrics | `refine-trajectory` | [`ErrorMetrics`] |
//! | Aggregation | `refine-ensemble`, `refine-benchmark` | statistics, point clouds |
//!
//! ## Design Philosophy
//!
//! 1. Labels are derived once at ingestion, never re-parsed downstream
//! 2. Missing data is `Option<f64>`, never zero or NaN
//! 3. Every operation is a pure function of its inputs

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Time point
pub type Time = f64;

// ============================================================================
// ERRORS
// ============================================================================

/// Why a whole input could not be parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("no valid data rows survived filtering")]
    EmptyResult,
}

/// Which side of a comparison a trajectory plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrajectoryRole {
    Reference,
    Comparison,
}

impl fmt::Display for TrajectoryRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reference => write!(f, "reference"),
            Self::Comparison => write!(f, "comparison"),
        }
    }
}

/// Why two trajectories could not be aligned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AlignmentFailure {
    #[error("{role} trajectory has {samples} usable samples, at least 2 are required")]
    InsufficientSamples { role: TrajectoryRole, samples: usize },

    #[error("sequence lengths differ or are empty: reference {reference}, comparison {comparison}")]
    LengthMismatch { reference: usize, comparison: usize },
}

/// Common errors
#[derive(Debug, Error)]
pub enum RefineError {
    #[error("Parse error in {origin}: {kind}")]
    Parse { origin: String, kind: ParseFailure },

    #[error("Alignment error: {0}")]
    Alignment(AlignmentFailure),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Missing column: {0}")]
    MissingColumn(String),

    #[error("Invalid trajectory: {0}")]
    InvalidTrajectory(String),

    #[error("Malformed table: {0}")]
    Table(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AlignmentFailure> for RefineError {
    fn from(failure: AlignmentFailure) -> Self {
        Self::Alignment(failure)
    }
}

pub type Result<T> = std::result::Result<T, RefineError>;

/// A recovered, non-fatal failure: the named input was skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// File name, tau value or row parameter that was skipped
    pub subject: String,
    /// Human-readable cause
    pub reason: String,
}

impl Diagnostic {
    /// Record a skip and log it
    pub fn skipped(subject: impl Into<String>, reason: impl fmt::Display) -> Self {
        let diagnostic = Self {
            subject: subject.into(),
            reason: reason.to_string(),
        };
        warn!(subject = %diagnostic.subject, reason = %diagnostic.reason, "skipped input");
        diagnostic
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.reason)
    }
}

// ============================================================================
// TRAJECTORY
// ============================================================================

/// State component of a three-dimensional trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Dimension {
    X,
    Y,
    Z,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::X, Dimension::Y, Dimension::Z];

    /// Column index in a trajectory's state matrix
    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::Z => "Z",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Time-ordered samples of a three-dimensional state
///
/// Invariants (checked on construction): at least one sample, time
/// non-decreasing, every value finite, exactly three state columns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trajectory {
    time: Array1<Time>,
    states: Array2<f64>,
}

impl Trajectory {
    /// Number of state components
    pub const STATE_DIM: usize = 3;

    pub fn new(time: Array1<Time>, states: Array2<f64>) -> Result<Self> {
        if time.is_empty() {
            return Err(RefineError::InvalidTrajectory("no samples".into()));
        }
        if states.nrows() != time.len() || states.ncols() != Self::STATE_DIM {
            return Err(RefineError::InvalidTrajectory(format!(
                "state matrix is {}x{}, expected {}x{}",
                states.nrows(),
                states.ncols(),
                time.len(),
                Self::STATE_DIM
            )));
        }
        if time.iter().chain(states.iter()).any(|v| !v.is_finite()) {
            return Err(RefineError::InvalidTrajectory("non-finite value".into()));
        }
        if let Some(i) = (1..time.len()).find(|&i| time[i] < time[i - 1]) {
            return Err(RefineError::InvalidTrajectory(format!(
                "time decreases at sample {} ({} < {})",
                i,
                time[i],
                time[i - 1]
            )));
        }
        Ok(Self { time, states })
    }

    /// Build from `(t, [x, y, z])` samples
    pub fn from_samples(samples: &[(Time, [f64; 3])]) -> Result<Self> {
        let time = samples.iter().map(|(t, _)| *t).collect::<Array1<_>>();
        let flat = samples
            .iter()
            .flat_map(|(_, s)| s.iter().copied())
            .collect::<Vec<_>>();
        let states = Array2::from_shape_vec((samples.len(), Self::STATE_DIM), flat)
            .map_err(|e| RefineError::InvalidTrajectory(e.to_string()))?;
        Self::new(time, states)
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn time(&self) -> ArrayView1<'_, Time> {
        self.time.view()
    }

    /// Rows are samples, columns are X, Y, Z
    pub fn states(&self) -> ArrayView2<'_, f64> {
        self.states.view()
    }

    pub fn component(&self, dim: Dimension) -> ArrayView1<'_, f64> {
        self.states.column(dim.index())
    }

    /// First and last time stamp
    pub fn time_span(&self) -> (Time, Time) {
        (self.time[0], self.time[self.time.len() - 1])
    }
}

// ============================================================================
// ERROR METRICS
// ============================================================================

/// Deviation statistics for one state component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionError {
    /// max |a_i - b_i|
    pub max_abs_error: f64,
    /// sqrt(mean((a_i - b_i)^2)), a root-mean-square deviation
    pub l2_error: f64,
}

/// Per-dimension deviation between a reference and a resampled comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub per_dimension: BTreeMap<Dimension, DimensionError>,
}

impl ErrorMetrics {
    pub fn get(&self, dim: Dimension) -> Option<&DimensionError> {
        self.per_dimension.get(&dim)
    }
}

// ============================================================================
// RUN LABELS
// ============================================================================

/// Integration scheme that produced a trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    /// Sequential fine integrator (RK4)
    Reference,
    /// Parallel-in-time scheme (Parareal)
    Parallel,
}

impl Method {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Reference => "RK4",
            Self::Parallel => "Parareal",
        }
    }
}

/// How a parallel-method trajectory was written out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sampling {
    /// Coarse-grid points only
    Standard,
    /// Densely resampled output
    Dense,
}

/// Run metadata, derived once from a trajectory's source identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLabel {
    pub method: Method,
    /// `None` means unlabeled, not zero
    pub control_param: Option<f64>,
    pub sampling: Sampling,
    /// File name the label was derived from
    pub source_name: String,
}

impl RunLabel {
    /// Derive a label from a file path or name.
    ///
    /// Only the final path component is inspected:
    /// - `parareal` (any case) marks the parallel method
    /// - `dense` (any case) marks densely resampled output
    /// - `tau<digits>.<digits>` carries the control parameter
    pub fn from_identifier(identifier: &str) -> Self {
        let source_name = Path::new(identifier)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(identifier)
            .to_string();
        let lower = source_name.to_lowercase();

        let method = if lower.contains("parareal") {
            Method::Parallel
        } else {
            Method::Reference
        };
        let sampling = if lower.contains("dense") {
            Sampling::Dense
        } else {
            Sampling::Standard
        };

        Self {
            method,
            control_param: extract_control_param(&source_name),
            sampling,
            source_name,
        }
    }

    /// Caption such as `Parareal (τ=5.0)` or `RK4: run.dat`
    pub fn title(&self) -> String {
        match self.control_param {
            Some(tau) => format!("{} (τ={:.1})", self.method.display_name(), tau),
            None => format!("{}: {}", self.method.display_name(), self.source_name),
        }
    }
}

impl fmt::Display for RunLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title())
    }
}

/// First `tau<digits>.<digits>` token in a file name
fn extract_control_param(name: &str) -> Option<f64> {
    name.match_indices("tau")
        .find_map(|(idx, token)| parse_decimal(&name[idx + token.len()..]))
}

/// Leading `<digits>.<digits>`; both parts are required
fn parse_decimal(s: &str) -> Option<f64> {
    let int_len = s.bytes().take_while(|b| b.is_ascii_digit()).count();
    if int_len == 0 {
        return None;
    }
    let frac = s[int_len..].strip_prefix('.')?;
    let frac_len = frac.bytes().take_while(|b| b.is_ascii_digit()).count();
    if frac_len == 0 {
        return None;
    }
    s[..int_len + 1 + frac_len].parse().ok()
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Analysis parameters (loadable from JSON, every field optional)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Magnitude at or above which a value is a solver divergence sentinel
    pub huge_threshold: f64,
    /// R values whose replica distributions are inspected
    pub histogram_targets: Vec<f64>,
    /// Bin count for replica histograms
    pub histogram_bins: usize,
    /// Worker count of the parallel method, for efficiency
    pub parallel_processes: usize,
    /// Speedup above which the parallel method pays off
    pub breakeven_speedup: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            huge_threshold: 1.0e30,
            histogram_targets: vec![0.8, 1.5, 2.5],
            histogram_bins: 15,
            parallel_processes: 4,
            breakeven_speedup: 1.0,
        }
    }
}

impl AnalysisConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.huge_threshold.is_finite() || self.huge_threshold <= 0.0 {
            return Err(RefineError::InvalidConfig(format!(
                "huge_threshold must be finite and positive, got {}",
                self.huge_threshold
            )));
        }
        if self.histogram_bins == 0 {
            return Err(RefineError::InvalidConfig("histogram_bins must be at least 1".into()));
        }
        if self.parallel_processes == 0 {
            return Err(RefineError::InvalidConfig(
                "parallel_processes must be at least 1".into(),
            ));
        }
        if self.histogram_targets.iter().any(|r| !r.is_finite()) {
            return Err(RefineError::InvalidConfig("histogram_targets must be finite".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_label_parallel_with_tau() {
        let label = RunLabel::from_identifier("output/lorenz_parareal_tau5.0.dat");
        assert_eq!(label.method, Method::Parallel);
        assert_eq!(label.control_param, Some(5.0));
        assert_eq!(label.sampling, Sampling::Standard);
        assert_eq!(label.source_name, "lorenz_parareal_tau5.0.dat");
        assert_eq!(label.title(), "Parareal (τ=5.0)");
    }

    #[test]
    fn test_label_reference_without_tau() {
        let label = RunLabel::from_identifier("rk4_run.dat");
        assert_eq!(label.method, Method::Reference);
        assert_eq!(label.control_param, None);
        assert_eq!(label.title(), "RK4: rk4_run.dat");
    }

    #[test]
    fn test_label_dense_case_insensitive() {
        let label = RunLabel::from_identifier("Lorenz_PARAREAL_Dense_tau12.5.dat");
        assert_eq!(label.method, Method::Parallel);
        assert_eq!(label.sampling, Sampling::Dense);
        assert_eq!(label.control_param, Some(12.5));
    }

    #[test]
    fn test_label_ignores_directories() {
        let label = RunLabel::from_identifier("parareal_tau9.0/rk4_tau1.0.dat");
        assert_eq!(label.method, Method::Reference);
        assert_eq!(label.control_param, Some(1.0));
    }

    #[test]
    fn test_tau_token_needs_decimal() {
        assert_eq!(extract_control_param("tau_rk4.dat"), None);
        assert_eq!(extract_control_param("rk4_tau3.dat"), None);
        assert_eq!(extract_control_param("rk4_tau7..dat"), None);
        assert_eq!(extract_control_param("taux_tau3.25.dat"), Some(3.25));
        assert_eq!(extract_control_param("tau2_tau0.5.dat"), Some(0.5));
        assert!(RunLabel::from_identifier("lorenz_parareal_tau3.dat").control_param.is_none());
    }

    #[test]
    fn test_trajectory_validation() {
        let ok = Trajectory::from_samples(&[(0.0, [1.0, 2.0, 3.0]), (0.0, [1.0, 2.0, 3.0])]);
        assert!(ok.is_ok());

        let backwards = Trajectory::from_samples(&[(1.0, [0.0; 3]), (0.5, [0.0; 3])]);
        assert!(matches!(backwards, Err(RefineError::InvalidTrajectory(_))));

        let empty = Trajectory::from_samples(&[]);
        assert!(matches!(empty, Err(RefineError::InvalidTrajectory(_))));

        let inf = Trajectory::from_samples(&[(0.0, [f64::INFINITY, 0.0, 0.0])]);
        assert!(inf.is_err());
    }

    #[test]
    fn test_trajectory_accessors() {
        let traj = Trajectory::from_samples(&[(0.0, [1.0, 2.0, 3.0]), (0.5, [4.0, 5.0, 6.0])])
            .unwrap();
        assert_eq!(traj.len(), 2);
        assert_eq!(traj.time_span(), (0.0, 0.5));
        assert_eq!(traj.component(Dimension::Y).to_vec(), vec![2.0, 5.0]);
    }

    #[test]
    fn test_config_partial_json() {
        let config = AnalysisConfig::from_json_str(r#"{ "huge_threshold": 1e20 }"#).unwrap();
        assert_eq!(config.huge_threshold, 1e20);
        assert_eq!(config.histogram_bins, 15);
        assert_eq!(config.histogram_targets, vec![0.8, 1.5, 2.5]);
    }

    #[test]
    fn test_config_rejects_bad_threshold() {
        let result = AnalysisConfig::from_json_str(r#"{ "huge_threshold": -1.0 }"#);
        assert!(matches!(result, Err(RefineError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{ "parallel_processes": 8 }}"#).unwrap();
        let config = AnalysisConfig::from_path(file.path()).unwrap();
        assert_eq!(config.parallel_processes, 8);
    }
}
