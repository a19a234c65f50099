use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::fmt;
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every function in the public Rust API returns `Result<T, EngineError>`
/// instead of panicking.  The FFI layer translates these into integer
/// return codes + a thread-local error message.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The QP sub-problem of a resolution step has no feasible point
    /// (or the solver could not reach one).  Fatal for the resolution.
    #[error("reconciliation failed ({status}) on rows {rows:?}, columns {columns:?}")]
    InfeasibleReconciliation {
        status: QpStatus,
        rows: Vec<usize>,
        columns: Vec<usize>,
    },
    /// Truncated-Gaussian rejection sampling exhausted its retry budget.
    #[error("sampling failed for variable {variable}: mean {mean}, sigma {sigma}, {retries} draws rejected")]
    SamplingFailure {
        variable: usize,
        mean: f64,
        sigma: f64,
        retries: usize,
    },
    /// Factorisation failure (matrix not positive definite, singular pivot).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),
    /// Numerical breakdown inside a solver (NaN iterate, bad pivot).
    #[error("solver error: {0}")]
    Solver(String),
    /// Shape mismatch in input data.
    #[error("shape error: {0}")]
    Shape(String),
    /// Invalid configuration value.
    #[error("config error: {0}")]
    Config(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Termination status of a QP solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QpStatus {
    Solved,
    PrimalInfeasible,
    MaxIterations,
}

impl fmt::Display for QpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Solved => write!(f, "solved"),
            Self::PrimalInfeasible => write!(f, "primal infeasible"),
            Self::MaxIterations => write!(f, "maximum iterations reached"),
        }
    }
}

/// Non-fatal failure of interval propagation.  Reported alongside the
/// fallback intervals, never in place of them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntervalFailure {
    /// A row forced a variable's interval to become empty.
    #[error("empty interval for variable {variable} at row {row}: [{min}, {max}]")]
    Contradiction {
        row: usize,
        variable: usize,
        min: f64,
        max: f64,
    },
    /// Any other failure reported by an external kernel.
    #[error("interval kernel failed: {0}")]
    Kernel(String),
}

// ─────────────────────────────────────────────────────────────
//  Variable classification
// ─────────────────────────────────────────────────────────────

/// Observability status of a single variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarClass {
    /// Measured and over-determined by the balances.
    Redundant,
    /// Measured, but no balance checks it.
    JustMeasured,
    /// Unmeasured, pinned by a single reduced row.
    Determinable,
    /// Unmeasured and not pinned; only an interval can be given.
    Free,
}

impl VarClass {
    /// Integer code used across the C ABI.
    pub fn code(self) -> i32 {
        match self {
            Self::Redundant => 0,
            Self::JustMeasured => 1,
            Self::Determinable => 2,
            Self::Free => 3,
        }
    }

    pub fn is_measured(self) -> bool {
        matches!(self, Self::Redundant | Self::JustMeasured)
    }
}

// ─────────────────────────────────────────────────────────────
//  Variable vectors  (data, sigma, lower, upper)
// ─────────────────────────────────────────────────────────────

/// The four parallel per-variable arrays.
///
/// Ordering is whatever the owner says it is: inside the engine it is always
/// model order (unmeasured variables first, then measured).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableVectors {
    pub data: Vec<f64>,
    pub sigma: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
}

impl VariableVectors {
    pub fn new(data: Vec<f64>, sigma: Vec<f64>, lower: Vec<f64>, upper: Vec<f64>) -> EngineResult<Self> {
        let n = data.len();
        if sigma.len() != n || lower.len() != n || upper.len() != n {
            return Err(EngineError::Shape(format!(
                "variable vectors differ in length: data {}, sigma {}, lower {}, upper {}",
                n,
                sigma.len(),
                lower.len(),
                upper.len()
            )));
        }
        Ok(Self { data, sigma, lower, upper })
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Gather the entries at `indices` into a new set of vectors.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            data: indices.iter().map(|&i| self.data[i]).collect(),
            sigma: indices.iter().map(|&i| self.sigma[i]).collect(),
            lower: indices.iter().map(|&i| self.lower[i]).collect(),
            upper: indices.iter().map(|&i| self.upper[i]).collect(),
        }
    }

    /// Raise every sigma below `floor` to `floor`.
    pub fn apply_sigma_floor(&mut self, floor: f64) {
        for s in self.sigma.iter_mut() {
            if *s < floor {
                *s = floor;
            }
        }
    }

    /// Sigma used by both the objective weights and Monte-Carlo sampling:
    /// non-positive means "no information" → 1.
    #[inline]
    pub fn effective_sigma(&self, i: usize) -> f64 {
        let s = self.sigma[i];
        if s > 0.0 { s } else { 1.0 }
    }
}

// ─────────────────────────────────────────────────────────────
//  Variable layout  (natural order  ↔  model order)
// ─────────────────────────────────────────────────────────────

/// Maps between the caller's natural variable order and the model order
/// (all unmeasured variables first, then all measured ones, each group
/// keeping its natural relative order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLayout {
    pub is_measured: Vec<bool>,
    /// `model_to_natural[m]` = natural index of model position `m`.
    pub model_to_natural: Vec<usize>,
    pub num_unmeasured: usize,
}

impl VariableLayout {
    pub fn from_mask(is_measured: &[bool]) -> Self {
        let unmeasured = is_measured.iter().enumerate().filter(|(_, &m)| !m).map(|(i, _)| i);
        let measured = is_measured.iter().enumerate().filter(|(_, &m)| m).map(|(i, _)| i);
        let model_to_natural: Vec<usize> = unmeasured.chain(measured).collect();
        let num_unmeasured = is_measured.iter().filter(|&&m| !m).count();
        Self {
            is_measured: is_measured.to_vec(),
            model_to_natural,
            num_unmeasured,
        }
    }

    /// Layout of a model that is already in model order.
    pub fn model_ordered(num_unmeasured: usize, num_measured: usize) -> Self {
        let mut mask = vec![false; num_unmeasured];
        mask.extend(std::iter::repeat(true).take(num_measured));
        Self::from_mask(&mask)
    }

    pub fn len(&self) -> usize {
        self.is_measured.len()
    }

    pub fn is_empty(&self) -> bool {
        self.is_measured.is_empty()
    }

    pub fn num_measured(&self) -> usize {
        self.len() - self.num_unmeasured
    }

    /// Scatter a model-ordered vector back into natural order.
    pub fn to_natural<T: Clone + Default>(&self, model: &[T]) -> Vec<T> {
        let mut out = vec![T::default(); model.len()];
        for (m, value) in model.iter().enumerate() {
            out[self.model_to_natural[m]] = value.clone();
        }
        out
    }

    /// Gather a natural-ordered vector into model order.
    pub fn to_model<T: Clone>(&self, natural: &[T]) -> Vec<T> {
        self.model_to_natural.iter().map(|&n| natural[n].clone()).collect()
    }

    pub fn vectors_to_model(&self, natural: &VariableVectors) -> VariableVectors {
        natural.select(&self.model_to_natural)
    }
}

// ─────────────────────────────────────────────────────────────
//  Constraint model
// ─────────────────────────────────────────────────────────────

/// Linear balance model in model order.
///
/// `matrix` has `n_total + 2` columns: one coefficient column per variable
/// (unmeasured first), then the row bounds `li` and `ui`.  Rows are balanced
/// as equalities at `li`; a row with `ui != li` is accepted with a warning.
#[derive(Debug, Clone)]
pub struct ConstraintModel {
    pub matrix: CsMat<f64>,
    pub num_unmeasured: usize,
    pub num_measured: usize,
    pub layout: VariableLayout,
}

impl ConstraintModel {
    /// Wrap a matrix whose columns are already in model order.
    pub fn new(matrix: CsMat<f64>, num_measured: usize) -> EngineResult<Self> {
        if matrix.cols() < 2 {
            return Err(EngineError::Shape(format!(
                "constraint matrix needs two bound columns, got {} columns",
                matrix.cols()
            )));
        }
        let n_total = matrix.cols() - 2;
        if num_measured > n_total {
            return Err(EngineError::Shape(format!(
                "{num_measured} measured variables but only {n_total} variable columns"
            )));
        }
        let num_unmeasured = n_total - num_measured;
        Ok(Self {
            matrix: matrix.to_csr(),
            num_unmeasured,
            num_measured,
            layout: VariableLayout::model_ordered(num_unmeasured, num_measured),
        })
    }

    /// Build from a matrix in natural variable order plus a measured mask;
    /// the variable columns are permuted into model order.
    pub fn from_natural(matrix: &CsMat<f64>, is_measured: &[bool]) -> EngineResult<Self> {
        let n_total = is_measured.len();
        if matrix.cols() != n_total + 2 {
            return Err(EngineError::Shape(format!(
                "matrix has {} columns, expected {} variables + 2 bound columns",
                matrix.cols(),
                n_total
            )));
        }
        let layout = VariableLayout::from_mask(is_measured);
        let mut natural_to_model = vec![0usize; n_total];
        for (m, &n) in layout.model_to_natural.iter().enumerate() {
            natural_to_model[n] = m;
        }

        let mut tri = TriMat::new((matrix.rows(), matrix.cols()));
        for (&v, (r, c)) in matrix.iter() {
            let col = if c < n_total { natural_to_model[c] } else { c };
            tri.add_triplet(r, col, v);
        }
        let reordered: CsMat<f64> = tri.to_csr();

        Ok(Self {
            matrix: reordered,
            num_unmeasured: layout.num_unmeasured,
            num_measured: layout.num_measured(),
            layout,
        })
    }

    pub fn num_variables(&self) -> usize {
        self.num_unmeasured + self.num_measured
    }

    pub fn num_rows(&self) -> usize {
        self.matrix.rows()
    }
}

// ─────────────────────────────────────────────────────────────
//  Options
// ─────────────────────────────────────────────────────────────

/// Rank-revealing reduction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionOptions {
    /// Coefficients with |a| below this are exact zeros, everywhere.
    pub tolerance: f64,
}

impl Default for ReductionOptions {
    fn default() -> Self {
        Self { tolerance: 1e-6 }
    }
}

/// ADMM settings for the QP solver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpSettings {
    /// Initial step size ρ for inequality rows.
    pub rho: f64,
    /// Multiplier on ρ for equality rows.
    pub equality_rho_scale: f64,
    /// Proximal regularisation σ (keeps the KKT matrix definite).
    pub sigma: f64,
    /// Over-relaxation α ∈ (0, 2).
    pub alpha: f64,
    pub eps_abs: f64,
    pub eps_rel: f64,
    /// Tolerance of the primal-infeasibility certificate.
    pub eps_prim_inf: f64,
    pub max_iterations: usize,
    /// Residuals are evaluated every `check_interval` iterations.
    pub check_interval: usize,
    pub adaptive_rho: bool,
    pub adaptive_rho_interval: usize,
    /// ρ is only refactored when it moves by more than this factor.
    pub adaptive_rho_tolerance: f64,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            rho: 0.1,
            equality_rho_scale: 1e3,
            sigma: 1e-6,
            alpha: 1.6,
            eps_abs: 1e-8,
            eps_rel: 1e-8,
            eps_prim_inf: 1e-5,
            max_iterations: 50_000,
            check_interval: 10,
            adaptive_rho: true,
            adaptive_rho_interval: 50,
            adaptive_rho_tolerance: 5.0,
        }
    }
}

/// Determinability fixed-point settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// A derived value may undershoot its lower bound by this much.
    pub bound_tolerance: f64,
    /// Also pull variables that overshoot their upper bound into the QP.
    pub check_upper_bound: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            bound_tolerance: 0.01,
            check_upper_bound: true,
        }
    }
}

/// Fixed-point interval kernel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelOptions {
    pub max_sweeps: usize,
    /// Minimum movement of a bound that counts as tightening.
    pub tolerance: f64,
    /// Relative slack before min > max is called a contradiction.
    pub feasibility_tolerance: f64,
}

impl Default for KernelOptions {
    fn default() -> Self {
        Self {
            max_sweeps: 500,
            tolerance: 1e-9,
            feasibility_tolerance: 1e-6,
        }
    }
}

/// Monte-Carlo driver settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonteCarloOptions {
    pub realizations: usize,
    pub seed: u64,
    /// Lower clamp applied to every sigma once, before sampling.
    pub sigma_floor: Option<f64>,
    /// Truncation half-width in standard deviations.
    pub n_sigmas: f64,
    pub max_draw_retries: usize,
    /// Skip keeping the model-order solved vector per realization.
    pub downscale: bool,
    pub parallel: bool,
}

impl Default for MonteCarloOptions {
    fn default() -> Self {
        Self {
            realizations: 100,
            seed: 0,
            sigma_floor: None,
            n_sigmas: 3.0,
            max_draw_retries: 10_000,
            downscale: false,
            parallel: true,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub reduction: ReductionOptions,
    pub qp: QpSettings,
    pub resolver: ResolverOptions,
    pub kernel: KernelOptions,
    pub montecarlo: MonteCarloOptions,
}

impl EngineConfig {
    pub fn validate(&self) -> EngineResult<()> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(EngineError::Config(format!("{name} must be positive and finite, got {v}")))
            }
        };
        positive("reduction.tolerance", self.reduction.tolerance)?;
        positive("qp.rho", self.qp.rho)?;
        positive("qp.equality_rho_scale", self.qp.equality_rho_scale)?;
        positive("qp.sigma", self.qp.sigma)?;
        positive("qp.eps_prim_inf", self.qp.eps_prim_inf)?;
        if !(self.qp.alpha > 0.0 && self.qp.alpha < 2.0) {
            return Err(EngineError::Config(format!("qp.alpha must lie in (0, 2), got {}", self.qp.alpha)));
        }
        if self.qp.eps_abs < 0.0 || self.qp.eps_rel < 0.0 || self.qp.eps_abs + self.qp.eps_rel == 0.0 {
            return Err(EngineError::Config("qp.eps_abs / qp.eps_rel must be non-negative and not both zero".into()));
        }
        if self.qp.max_iterations == 0 || self.qp.check_interval == 0 || self.qp.adaptive_rho_interval == 0 {
            return Err(EngineError::Config("qp iteration counts must be at least 1".into()));
        }
        if self.resolver.bound_tolerance < 0.0 {
            return Err(EngineError::Config("resolver.bound_tolerance must be non-negative".into()));
        }
        if self.kernel.max_sweeps == 0 {
            return Err(EngineError::Config("kernel.max_sweeps must be at least 1".into()));
        }
        positive("montecarlo.n_sigmas", self.montecarlo.n_sigmas)?;
        if self.montecarlo.max_draw_retries == 0 {
            return Err(EngineError::Config("montecarlo.max_draw_retries must be at least 1".into()));
        }
        if let Some(floor) = self.montecarlo.sigma_floor {
            positive("montecarlo.sigma_floor", floor)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Sparse helpers
// ─────────────────────────────────────────────────────────────

/// Row-wise `(column, value)` lists of any sparse matrix, CSR or CSC.
pub fn rows_of(mat: &CsMat<f64>) -> Vec<Vec<(usize, f64)>> {
    let mut rows = vec![Vec::new(); mat.rows()];
    for (&v, (r, c)) in mat.iter() {
        rows[r].push((c, v));
    }
    for row in rows.iter_mut() {
        row.sort_unstable_by_key(|&(c, _)| c);
    }
    rows
}

/// Select rows and columns (in the given order) into a new CSR matrix.
pub fn select_submatrix(mat: &CsMat<f64>, rows: &[usize], cols: &[usize]) -> CsMat<f64> {
    let mut row_map = vec![None; mat.rows()];
    for (new_r, &old_r) in rows.iter().enumerate() {
        row_map[old_r] = Some(new_r);
    }
    let mut col_map = vec![None; mat.cols()];
    for (new_c, &old_c) in cols.iter().enumerate() {
        col_map[old_c] = Some(new_c);
    }

    let mut tri = TriMat::new((rows.len(), cols.len()));
    for (&v, (r, c)) in mat.iter() {
        if let (Some(nr), Some(nc)) = (row_map[r], col_map[c]) {
            tri.add_triplet(nr, nc, v);
        }
    }
    tri.to_csr()
}

/// Entry `(row, col)` or 0 if structurally absent.
#[inline]
pub fn entry(mat: &CsMat<f64>, row: usize, col: usize) -> f64 {
    mat.get(row, col).copied().unwrap_or(0.0)
}
