//! Convex quadratic programming by operator splitting (ADMM).
//!
//! Solves
//!
//! ```text
//!   minimise    ½ xᵀ P x + qᵀ x
//!   subject to  row_lower ≤ A x ≤ row_upper
//!               lower     ≤   x ≤ upper
//! ```
//!
//! The general rows and the box rows are stacked into `C = [A; I]`.  Each
//! iteration solves the reduced KKT system
//!
//! ```text
//!   (P + σI + Cᵀ R C) x̃ = σ xₖ − q + Cᵀ (R zₖ − yₖ)
//! ```
//!
//! which is symmetric positive definite for σ > 0, so it is factorised once
//! with `sprs-ldl` and re-factorised only when the step sizes R change.
//! Equality rows get a larger step size than inequality rows; rows without
//! finite bounds get a tiny one.

use crate::types::{rows_of, EngineError, EngineResult, QpSettings, QpStatus};
use sprs::{CsMat, FillInReduction, SymmetryCheck, TriMat};
use sprs_ldl::{Ldl, LdlNumeric};

const RHO_MIN: f64 = 1e-6;
const RHO_MAX: f64 = 1e6;
const DIVISION_TOL: f64 = 1e-12;

// ─────────────────────────────────────────────────────────────
//  Problem / solution
// ─────────────────────────────────────────────────────────────

/// A convex QP.  `p` must be symmetric positive semi-definite and stored
/// with both triangles.
#[derive(Debug, Clone)]
pub struct QpProblem {
    pub p: CsMat<f64>,
    pub q: Vec<f64>,
    pub a: CsMat<f64>,
    pub row_lower: Vec<f64>,
    pub row_upper: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Starting point (projected onto the box before use).
    pub warm_start: Option<Vec<f64>>,
}

impl QpProblem {
    pub fn num_variables(&self) -> usize {
        self.q.len()
    }

    pub fn num_rows(&self) -> usize {
        self.row_lower.len()
    }

    fn check_shapes(&self) -> EngineResult<()> {
        let n = self.num_variables();
        let m = self.num_rows();
        let ok = self.p.rows() == n
            && self.p.cols() == n
            && self.a.rows() == m
            && self.a.cols() == n
            && self.row_upper.len() == m
            && self.lower.len() == n
            && self.upper.len() == n
            && self.warm_start.as_ref().map_or(true, |w| w.len() == n);
        if ok {
            Ok(())
        } else {
            Err(EngineError::Shape(format!(
                "inconsistent QP: {n} variables, {m} rows, P {}×{}, A {}×{}",
                self.p.rows(),
                self.p.cols(),
                self.a.rows(),
                self.a.cols()
            )))
        }
    }

    /// First general row or variable whose range `[lo, hi]` is empty.
    fn empty_range(&self) -> Option<String> {
        let empty = |(l, u): (&f64, &f64)| !(l <= u);
        if let Some(r) = self.row_lower.iter().zip(&self.row_upper).position(empty) {
            return Some(format!("row {r} range [{}, {}]", self.row_lower[r], self.row_upper[r]));
        }
        self.lower
            .iter()
            .zip(&self.upper)
            .position(empty)
            .map(|j| format!("variable {j} box [{}, {}]", self.lower[j], self.upper[j]))
    }
}

#[derive(Debug, Clone)]
pub struct QpSolution {
    pub x: Vec<f64>,
    pub status: QpStatus,
    pub iterations: usize,
    pub primal_residual: f64,
    pub dual_residual: f64,
}

/// Generic convex QP back-end.  Implementations must be deterministic for a
/// fixed input.
pub trait QpSolver: Send + Sync {
    fn solve(&self, problem: &QpProblem) -> EngineResult<QpSolution>;
}

// ─────────────────────────────────────────────────────────────
//  KKT factorisation
// ─────────────────────────────────────────────────────────────

/// LDLᵀ factorisation of the reduced KKT matrix, validated positive
/// definite (all D > 0).
struct KktFactor(LdlNumeric<f64, usize>);

impl KktFactor {
    fn new(k: &CsMat<f64>) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(k.view())?;
        for (i, &di) in ldl.d().iter().enumerate() {
            if di <= 0.0 {
                return Err(sprs::errors::LinalgError::SingularMatrix(
                    sprs::errors::SingularMatrixInfo {
                        index: i,
                        reason: "D <= 0 in KKT factorization (not SPD)",
                    },
                ));
            }
        }
        Ok(Self(ldl))
    }

    fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        self.0.solve(rhs)
    }
}

/// Assemble  P + σI + Aᵀ diag(ρ_a) A + diag(ρ_b)  in CSC.
fn assemble_kkt(
    p: &CsMat<f64>,
    a_rows: &[Vec<(usize, f64)>],
    rho_a: &[f64],
    rho_b: &[f64],
    sigma: f64,
) -> CsMat<f64> {
    let n = rho_b.len();
    let mut tri = TriMat::new((n, n));
    for (&v, (r, c)) in p.iter() {
        tri.add_triplet(r, c, v);
    }
    for (j, &rho) in rho_b.iter().enumerate() {
        tri.add_triplet(j, j, sigma + rho);
    }
    for (row, &rho) in a_rows.iter().zip(rho_a) {
        for &(c1, v1) in row {
            for &(c2, v2) in row {
                tri.add_triplet(c1, c2, rho * v1 * v2);
            }
        }
    }
    tri.to_csc()
}

// ─────────────────────────────────────────────────────────────
//  Dense helpers
// ─────────────────────────────────────────────────────────────

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0_f64, |m, &x| m.max(x.abs()))
}

fn mat_vec(rows: &[Vec<(usize, f64)>], x: &[f64]) -> Vec<f64> {
    rows.iter()
        .map(|row| row.iter().map(|&(c, v)| v * x[c]).sum())
        .collect()
}

/// out = Aᵀ y
fn mat_t_vec(rows: &[Vec<(usize, f64)>], y: &[f64], n: usize) -> Vec<f64> {
    let mut out = vec![0.0; n];
    for (row, &yr) in rows.iter().zip(y) {
        for &(c, v) in row {
            out[c] += v * yr;
        }
    }
    out
}

#[inline]
fn clamp(v: f64, lo: f64, hi: f64) -> f64 {
    v.max(lo).min(hi)
}

fn step_size(lo: f64, hi: f64, rho: f64, eq_scale: f64) -> f64 {
    if lo.is_infinite() && hi.is_infinite() {
        RHO_MIN
    } else if lo == hi {
        rho * eq_scale
    } else {
        rho
    }
}

// ─────────────────────────────────────────────────────────────
//  ADMM solver
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct AdmmSolver {
    pub settings: QpSettings,
}

impl AdmmSolver {
    pub fn new(settings: QpSettings) -> Self {
        Self { settings }
    }
}

/// ADMM iterate: primal `x`, split variables `z`, duals `y`, for the
/// general rows (`_a`) and the box rows (`_b`).
struct Iterate {
    x: Vec<f64>,
    z_a: Vec<f64>,
    z_b: Vec<f64>,
    y_a: Vec<f64>,
    y_b: Vec<f64>,
}

struct Residuals {
    primal: f64,
    dual: f64,
    eps_primal: f64,
    eps_dual: f64,
    /// Scaled primal / dual residuals for the ρ update.
    primal_scaled: f64,
    dual_scaled: f64,
}

impl QpSolver for AdmmSolver {
    fn solve(&self, problem: &QpProblem) -> EngineResult<QpSolution> {
        problem.check_shapes()?;
        let s = &self.settings;
        let n = problem.num_variables();
        let m = problem.num_rows();

        if let Some(range) = problem.empty_range() {
            log::debug!("qp: {range} is empty");
            return Ok(QpSolution {
                x: problem.warm_start.clone().unwrap_or_else(|| vec![0.0; n]),
                status: QpStatus::PrimalInfeasible,
                iterations: 0,
                primal_residual: f64::INFINITY,
                dual_residual: 0.0,
            });
        }

        if n == 0 {
            // Only rows of the form  l ≤ 0 ≤ u  remain.
            let feasible = problem
                .row_lower
                .iter()
                .zip(&problem.row_upper)
                .all(|(&l, &u)| l <= s.eps_abs.max(1e-9) && u >= -s.eps_abs.max(1e-9));
            return Ok(QpSolution {
                x: Vec::new(),
                status: if feasible { QpStatus::Solved } else { QpStatus::PrimalInfeasible },
                iterations: 0,
                primal_residual: 0.0,
                dual_residual: 0.0,
            });
        }

        let a_rows = rows_of(&problem.a);
        let p_rows = rows_of(&problem.p);

        let mut rho = s.rho;
        let rho_vectors = |rho: f64| -> (Vec<f64>, Vec<f64>) {
            let ra = problem
                .row_lower
                .iter()
                .zip(&problem.row_upper)
                .map(|(&l, &u)| step_size(l, u, rho, s.equality_rho_scale))
                .collect();
            let rb = problem
                .lower
                .iter()
                .zip(&problem.upper)
                .map(|(&l, &u)| step_size(l, u, rho, s.equality_rho_scale))
                .collect();
            (ra, rb)
        };
        let (mut rho_a, mut rho_b) = rho_vectors(rho);
        let mut factor = KktFactor::new(&assemble_kkt(&problem.p, &a_rows, &rho_a, &rho_b, s.sigma))?;

        // ── Initial iterate ──
        let x0: Vec<f64> = match &problem.warm_start {
            Some(w) => w.clone(),
            None => vec![0.0; n],
        };
        let x0: Vec<f64> = x0
            .iter()
            .enumerate()
            .map(|(j, &v)| clamp(v, problem.lower[j], problem.upper[j]))
            .collect();
        let ax0 = mat_vec(&a_rows, &x0);
        let mut it = Iterate {
            z_a: (0..m).map(|r| clamp(ax0[r], problem.row_lower[r], problem.row_upper[r])).collect(),
            z_b: x0.clone(),
            x: x0,
            y_a: vec![0.0; m],
            y_b: vec![0.0; n],
        };

        let alpha = s.alpha;
        let mut last = None;
        for iter in 1..=s.max_iterations {
            // ── x̃ from the KKT system ──
            let mut rhs = mat_t_vec(
                &a_rows,
                &(0..m).map(|r| rho_a[r] * it.z_a[r] - it.y_a[r]).collect::<Vec<_>>(),
                n,
            );
            for j in 0..n {
                rhs[j] += s.sigma * it.x[j] - problem.q[j] + rho_b[j] * it.z_b[j] - it.y_b[j];
            }
            let x_tilde = factor.solve(&rhs);
            if x_tilde.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::Solver(format!("non-finite ADMM iterate at iteration {iter}")));
            }
            let z_tilde_a = mat_vec(&a_rows, &x_tilde);

            // ── Relaxed updates ──
            let mut dy_a = vec![0.0; m];
            for r in 0..m {
                let relaxed = alpha * z_tilde_a[r] + (1.0 - alpha) * it.z_a[r];
                let z_new = clamp(relaxed + it.y_a[r] / rho_a[r], problem.row_lower[r], problem.row_upper[r]);
                dy_a[r] = rho_a[r] * (relaxed - z_new);
                it.y_a[r] += dy_a[r];
                it.z_a[r] = z_new;
            }
            let mut dy_b = vec![0.0; n];
            for j in 0..n {
                let relaxed = alpha * x_tilde[j] + (1.0 - alpha) * it.z_b[j];
                let z_new = clamp(relaxed + it.y_b[j] / rho_b[j], problem.lower[j], problem.upper[j]);
                dy_b[j] = rho_b[j] * (relaxed - z_new);
                it.y_b[j] += dy_b[j];
                it.z_b[j] = z_new;
            }
            for j in 0..n {
                it.x[j] = alpha * x_tilde[j] + (1.0 - alpha) * it.x[j];
            }

            if iter % s.check_interval != 0 && iter != s.max_iterations {
                continue;
            }

            // ── Termination ──
            let res = residuals(problem, &a_rows, &p_rows, &it, s);
            last = Some((res.primal, res.dual));
            if res.primal <= res.eps_primal && res.dual <= res.eps_dual {
                log::debug!("qp: solved in {iter} iterations (r_prim {:.2e}, r_dual {:.2e})", res.primal, res.dual);
                return Ok(finish(problem, it.x, QpStatus::Solved, iter, res.primal, res.dual));
            }
            if primal_infeasible(problem, &a_rows, &dy_a, &dy_b, s.eps_prim_inf) {
                log::debug!("qp: primal infeasibility certificate at iteration {iter}");
                return Ok(finish(problem, it.x, QpStatus::PrimalInfeasible, iter, res.primal, res.dual));
            }

            // ── Step-size adaptation ──
            if s.adaptive_rho && iter % s.adaptive_rho_interval == 0 {
                let ratio = (res.primal_scaled / (res.dual_scaled + DIVISION_TOL)).sqrt();
                let rho_new = clamp(rho * ratio, RHO_MIN, RHO_MAX);
                if rho_new > rho * s.adaptive_rho_tolerance || rho_new < rho / s.adaptive_rho_tolerance {
                    log::trace!("qp: rho {rho:.3e} -> {rho_new:.3e} at iteration {iter}");
                    rho = rho_new;
                    let (ra, rb) = rho_vectors(rho);
                    rho_a = ra;
                    rho_b = rb;
                    factor = KktFactor::new(&assemble_kkt(&problem.p, &a_rows, &rho_a, &rho_b, s.sigma))?;
                }
            }
        }

        let (primal, dual) = last.unwrap_or((f64::INFINITY, f64::INFINITY));
        log::debug!("qp: no convergence after {} iterations (r_prim {primal:.2e}, r_dual {dual:.2e})", s.max_iterations);
        Ok(finish(problem, it.x, QpStatus::MaxIterations, s.max_iterations, primal, dual))
    }
}

fn finish(problem: &QpProblem, x: Vec<f64>, status: QpStatus, iterations: usize, primal: f64, dual: f64) -> QpSolution {
    // Residuals are below ε when solved; projecting removes the last bit of
    // box violation.
    let x = x
        .iter()
        .enumerate()
        .map(|(j, &v)| clamp(v, problem.lower[j], problem.upper[j]))
        .collect();
    QpSolution {
        x,
        status,
        iterations,
        primal_residual: primal,
        dual_residual: dual,
    }
}

fn residuals(
    problem: &QpProblem,
    a_rows: &[Vec<(usize, f64)>],
    p_rows: &[Vec<(usize, f64)>],
    it: &Iterate,
    s: &QpSettings,
) -> Residuals {
    let n = it.x.len();
    let ax = mat_vec(a_rows, &it.x);

    let mut primal = 0.0_f64;
    for (r, &v) in ax.iter().enumerate() {
        primal = primal.max((v - it.z_a[r]).abs());
    }
    for j in 0..n {
        primal = primal.max((it.x[j] - it.z_b[j]).abs());
    }
    let cx_norm = inf_norm(&ax).max(inf_norm(&it.x));
    let z_norm = inf_norm(&it.z_a).max(inf_norm(&it.z_b));

    let px = mat_vec(p_rows, &it.x);
    let mut cty = mat_t_vec(a_rows, &it.y_a, n);
    for j in 0..n {
        cty[j] += it.y_b[j];
    }
    let dual = (0..n)
        .map(|j| (px[j] + problem.q[j] + cty[j]).abs())
        .fold(0.0_f64, f64::max);

    let primal_scale = cx_norm.max(z_norm);
    let dual_scale = inf_norm(&px).max(inf_norm(&cty)).max(inf_norm(&problem.q));
    Residuals {
        primal,
        dual,
        eps_primal: s.eps_abs + s.eps_rel * primal_scale,
        eps_dual: s.eps_abs + s.eps_rel * dual_scale,
        primal_scaled: primal / (primal_scale + DIVISION_TOL),
        dual_scaled: dual / (dual_scale + DIVISION_TOL),
    }
}

/// Primal infeasibility certificate from the dual increment δy:
///
///   ‖Cᵀ δy‖∞ ≤ ε ‖δy‖∞   and   uᵀ δy₊ + lᵀ δy₋ < −ε ‖δy‖∞
///
/// after projecting δy onto the polar of the recession cone of [l, u]
/// (components pushing against an infinite bound are dropped).
fn primal_infeasible(
    problem: &QpProblem,
    a_rows: &[Vec<(usize, f64)>],
    dy_a: &[f64],
    dy_b: &[f64],
    eps: f64,
) -> bool {
    let project = |d: f64, lo: f64, hi: f64| -> f64 {
        match (lo.is_infinite(), hi.is_infinite()) {
            (true, true) => 0.0,
            (false, true) => d.min(0.0),
            (true, false) => d.max(0.0),
            (false, false) => d,
        }
    };
    let da: Vec<f64> = (0..dy_a.len())
        .map(|r| project(dy_a[r], problem.row_lower[r], problem.row_upper[r]))
        .collect();
    let db: Vec<f64> = (0..dy_b.len())
        .map(|j| project(dy_b[j], problem.lower[j], problem.upper[j]))
        .collect();

    let norm = inf_norm(&da).max(inf_norm(&db));
    if norm < DIVISION_TOL {
        return false;
    }

    let support = |d: f64, lo: f64, hi: f64| -> f64 {
        if d > 0.0 {
            hi * d
        } else if d < 0.0 {
            lo * d
        } else {
            0.0
        }
    };
    let mut bound_term = 0.0;
    for (r, &d) in da.iter().enumerate() {
        bound_term += support(d, problem.row_lower[r], problem.row_upper[r]);
    }
    for (j, &d) in db.iter().enumerate() {
        bound_term += support(d, problem.lower[j], problem.upper[j]);
    }
    if bound_term >= -eps * norm {
        return false;
    }

    let mut cty = mat_t_vec(a_rows, &da, db.len());
    for (j, &d) in db.iter().enumerate() {
        cty[j] += d;
    }
    inf_norm(&cty) <= eps * norm
}
