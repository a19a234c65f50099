//! Observability classification by rank-revealing row reduction.
//!
//! The constraint matrix is brought to reduced row-echelon form with the
//! unmeasured columns first.  Because pivots are taken left to right, every
//! row with a pivot in the unmeasured block precedes every row without one:
//!
//! ```text
//!          unmeasured   measured    li  ui
//!        ┌───────────┬───────────┬───┬───┐
//!   0..L │  B (rank L)│    ·      │ · │ · │   determinable / free rows
//!        ├───────────┼───────────┼───┼───┤
//!   L..M │     0     │    A′     │ · │ · │   measured-only rows (redundancy)
//!        └───────────┴───────────┴───┴───┘
//! ```
//!
//! A row of `B` with a single non-zero pins one unmeasured variable
//! (determinable); columns of `A′` with any non-zero are redundant
//! measurements.

use crate::types::{
    rows_of, ConstraintModel, EngineError, EngineResult, ReductionOptions, VarClass,
};
use ndarray::Array2;
use sprs::{CsMat, TriMat};
use std::collections::BTreeMap;
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  Reduction result
// ─────────────────────────────────────────────────────────────

/// Output of [`classify`]; built once per model and shared read-only by
/// every resolution and every Monte-Carlo realization.
#[derive(Debug, Clone)]
pub struct Reduction {
    /// Reduced row-echelon form, zero rows dropped, `n_total + 2` columns.
    pub arref: CsMat<f64>,
    pub num_unmeasured: usize,
    pub num_measured: usize,
    /// `L`: rank of the unmeasured block = number of leading rows touching it.
    pub rank_unmeasured: usize,
    /// Determinable variable → the row of `arref` that pins it.
    pub determinable: BTreeMap<usize, usize>,
    /// Measured variables untouched by the measured-only rows.
    pub just_measured: Vec<usize>,
    pub classification: Vec<VarClass>,
}

impl Reduction {
    pub fn num_variables(&self) -> usize {
        self.num_unmeasured + self.num_measured
    }

    /// `M`: independent rows left after reduction.
    pub fn num_rows(&self) -> usize {
        self.arref.rows()
    }

    /// `H = M − L`.
    pub fn degree_of_redundancy(&self) -> usize {
        self.num_rows() - self.rank_unmeasured
    }

    pub fn indices_of(&self, class: VarClass) -> Vec<usize> {
        self.classification
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == class)
            .map(|(i, _)| i)
            .collect()
    }

    /// Variables whose value a resolution produces: determinable + measured.
    pub fn known_indices(&self) -> Vec<usize> {
        self.determinable
            .keys()
            .copied()
            .chain(self.num_unmeasured..self.num_variables())
            .collect()
    }

    /// Row bounds `(li, ui)` of every reduced row.  [`classify`] leaves them
    /// equal.
    pub fn row_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        let n = self.num_variables();
        let m = self.num_rows();
        let mut li = vec![0.0; m];
        let mut ui = vec![0.0; m];
        for (&v, (r, c)) in self.arref.iter() {
            if c == n {
                li[r] = v;
            } else if c == n + 1 {
                ui[r] = v;
            }
        }
        (li, ui)
    }
}

// ─────────────────────────────────────────────────────────────
//  Reduced row-echelon form
// ─────────────────────────────────────────────────────────────

/// Gauss–Jordan elimination over the first `n_vars` columns with partial
/// pivoting.  Any further columns are carried along as right-hand sides, so
/// the input rows must be equalities.  Coefficients below `tol` are stored as
/// exact zeros.
pub fn reduced_row_echelon(matrix: &CsMat<f64>, n_vars: usize, tol: f64) -> Array2<f64> {
    let m = matrix.rows();
    let n = matrix.cols();

    let mut a = Array2::<f64>::zeros((m, n));
    for (&v, (r, c)) in matrix.iter() {
        a[[r, c]] += v;
    }
    chop(&mut a, n_vars, tol);

    let mut pivot_row = 0;
    for col in 0..n_vars {
        if pivot_row == m {
            break;
        }

        // Partial pivot
        let mut best = pivot_row;
        let mut best_val = a[[pivot_row, col]].abs();
        for r in (pivot_row + 1)..m {
            let v = a[[r, col]].abs();
            if v > best_val {
                best = r;
                best_val = v;
            }
        }
        if best_val < tol {
            for r in pivot_row..m {
                a[[r, col]] = 0.0;
            }
            continue;
        }

        if best != pivot_row {
            for j in 0..n {
                a.swap([pivot_row, j], [best, j]);
            }
        }

        // Normalise the pivot row
        let p = a[[pivot_row, col]];
        for j in 0..n {
            a[[pivot_row, j]] /= p;
        }
        a[[pivot_row, col]] = 1.0;

        // Eliminate above and below
        for r in 0..m {
            if r == pivot_row {
                continue;
            }
            let factor = a[[r, col]];
            if factor == 0.0 {
                continue;
            }
            for j in 0..n {
                a[[r, j]] -= factor * a[[pivot_row, j]];
            }
            a[[r, col]] = 0.0;
        }
        chop(&mut a, n_vars, tol);

        pivot_row += 1;
    }

    a
}

fn chop(a: &mut Array2<f64>, n_vars: usize, tol: f64) {
    for ((_, c), v) in a.indexed_iter_mut() {
        if c < n_vars && v.abs() < tol {
            *v = 0.0;
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Classification
// ─────────────────────────────────────────────────────────────

/// Reduce `model.matrix` and classify every variable.
pub fn classify(model: &ConstraintModel, options: &ReductionOptions) -> EngineResult<Reduction> {
    classify_matrix(&model.matrix, model.num_measured, options)
}

/// Reduce a model-ordered constraint matrix (unmeasured columns, measured
/// columns, `li`, `ui`) and classify every variable.
///
/// Every balance is read as the equality `a·x = li`; the reduced matrix has
/// `ui == li` on every row.
pub fn classify_matrix(
    matrix: &CsMat<f64>,
    num_measured: usize,
    options: &ReductionOptions,
) -> EngineResult<Reduction> {
    let t0 = Instant::now();
    if matrix.cols() < 2 || num_measured > matrix.cols() - 2 {
        return Err(EngineError::Shape(format!(
            "cannot classify {} measured variables in a matrix with {} columns",
            num_measured,
            matrix.cols()
        )));
    }
    let tol = options.tolerance;
    let n_total = matrix.cols() - 2;
    let n_u = n_total - num_measured;

    log::info!("classification: reducing {} × {} constraint matrix", matrix.rows(), matrix.cols());
    let dense = reduced_row_echelon(&as_equalities(matrix, n_total), n_total, tol);

    // ── 1. Drop rows that vanished in the variable columns ──
    let mut kept = Vec::new();
    for r in 0..dense.nrows() {
        let nonzero = (0..n_total).any(|c| dense[[r, c]] != 0.0);
        if nonzero {
            kept.push(r);
        } else {
            let rhs = dense[[r, n_total]];
            if rhs.abs() > tol {
                log::warn!("classification: balance row reduces to 0 = {rhs}; the model is inconsistent");
            }
        }
    }

    let mut tri = TriMat::new((kept.len(), n_total + 2));
    for (new_r, &r) in kept.iter().enumerate() {
        for c in 0..(n_total + 2) {
            let v = dense[[r, c]];
            if v != 0.0 {
                tri.add_triplet(new_r, c, v);
            }
        }
    }
    let arref: CsMat<f64> = tri.to_csr();
    log::info!("classification: matrix reduction done in {:.2?}", t0.elapsed());

    // ── 2. Unmeasured block: rank and single-entry rows ──
    let rows = rows_of(&arref);
    let mut rank = 0;
    let mut determinable = BTreeMap::new();
    for (r, row) in rows.iter().enumerate() {
        let unmeasured: Vec<usize> = row.iter().map(|&(c, _)| c).filter(|&c| c < n_u).collect();
        if unmeasured.is_empty() {
            continue;
        }
        rank += 1;
        if unmeasured.len() == 1 {
            determinable.insert(unmeasured[0], r);
        }
    }

    // ── 3. Measured block below L: redundancy ──
    let mut touched = vec![false; num_measured];
    for row in rows.iter().skip(rank) {
        for &(c, _) in row {
            if c >= n_u && c < n_total {
                touched[c - n_u] = true;
            }
        }
    }

    let mut classification = vec![VarClass::Free; n_total];
    for &col in determinable.keys() {
        classification[col] = VarClass::Determinable;
    }
    let mut just_measured = Vec::new();
    for (k, &t) in touched.iter().enumerate() {
        let col = n_u + k;
        if t {
            classification[col] = VarClass::Redundant;
        } else {
            classification[col] = VarClass::JustMeasured;
            just_measured.push(col);
        }
    }

    let reduction = Reduction {
        arref,
        num_unmeasured: n_u,
        num_measured,
        rank_unmeasured: rank,
        determinable,
        just_measured,
        classification,
    };
    log_summary(&reduction);
    log::info!("classification: done in {:.2?}", t0.elapsed());
    Ok(reduction)
}

/// Copy of `matrix` with `ui` replaced by `li` on every row.
fn as_equalities(matrix: &CsMat<f64>, n_total: usize) -> CsMat<f64> {
    let m = matrix.rows();
    let mut li = vec![0.0; m];
    let mut ui = vec![0.0; m];
    let mut tri = TriMat::new((m, n_total + 2));
    for (&v, (r, c)) in matrix.iter() {
        if c < n_total {
            tri.add_triplet(r, c, v);
        } else if c == n_total {
            li[r] += v;
        } else {
            ui[r] += v;
        }
    }
    for r in 0..m {
        if li[r] != ui[r] {
            log::warn!(
                "classification: row {r} has range [{}, {}]; it is reconciled as an equality at {}",
                li[r],
                ui[r],
                li[r]
            );
        }
        if li[r] != 0.0 {
            tri.add_triplet(r, n_total, li[r]);
            tri.add_triplet(r, n_total + 1, li[r]);
        }
    }
    tri.to_csr()
}

fn log_summary(r: &Reduction) {
    let l = r.rank_unmeasured;
    if l < r.num_rows() {
        log::debug!("    measured variables cannot all be arbitrary (reconciliation needed)");
    } else {
        log::debug!("    measured variables can be arbitrary");
    }
    if l < r.num_unmeasured {
        log::debug!("    non-unique solution for some unmeasured variables");
    } else {
        log::debug!("    unique solution for all unmeasured variables");
    }
    log::info!("    degree of redundancy (H = M - L): {}", r.degree_of_redundancy());
    log::info!("    redundant vars: {}", r.indices_of(VarClass::Redundant).len());
    log::info!("    just-measured vars: {}", r.just_measured.len());
    log::info!("    determinable vars: {}", r.determinable.len());
    log::info!("    free vars: {}", r.indices_of(VarClass::Free).len());
}
