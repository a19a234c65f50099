//! Determinability fixed point.
//!
//! Reconcile the measured-only rows, derive every determinable variable from
//! its pinning row, and whenever a derived value leaves its bounds pull that
//! variable (and its row) into the optimisation and start over:
//!
//! ```text
//!   fixed = ∅
//!   loop {
//!       x      = reconcile(rows ≥ L ∪ rows(fixed),  columns fixed ∪ measured)
//!       derive = { (li − Σ a·x) / pivot  for each determinable ∉ fixed }
//!       bad    = { j : derive_j < lower_j − tol  (or > upper_j + tol) }
//!       if bad = ∅ { converged }
//!       fixed ← fixed ∪ bad
//!   }
//! ```
//!
//! `fixed` only grows and is bounded by the number of determinable variables,
//! so the loop runs at most `|determinable| + 1` reconciliations.

use crate::qp::QpSolver;
use crate::reconcile::{reconcile, SubSystem};
use crate::reduction::Reduction;
use crate::types::{rows_of, EngineError, EngineResult, ResolverOptions, VariableVectors};
use std::time::Instant;

/// Outcome of a converged resolution, in model order.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Reconciled or derived value per variable; `None` for free variables.
    pub solved: Vec<Option<f64>>,
    /// Raw QP output of the last step (fixed columns, then measured).
    pub reconciled: Vec<f64>,
    /// Determinable variables that ended up inside the optimisation.
    pub fixed: Vec<usize>,
    /// The fixed set at the start of each step.
    pub fixed_history: Vec<Vec<usize>>,
    pub iterations: usize,
}

impl Resolution {
    pub fn known_indices(&self) -> Vec<usize> {
        self.solved
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Run the fixed point for one set of variable vectors (model order).
pub fn resolve(
    reduction: &Reduction,
    vectors: &VariableVectors,
    solver: &dyn QpSolver,
    options: &ResolverOptions,
) -> EngineResult<Resolution> {
    let n_total = reduction.num_variables();
    if vectors.len() != n_total {
        return Err(EngineError::Shape(format!(
            "{} variable values for a model of {} variables",
            vectors.len(),
            n_total
        )));
    }
    let n_u = reduction.num_unmeasured;
    let rank = reduction.rank_unmeasured;
    let rows = rows_of(&reduction.arref);
    let (li, _) = reduction.row_bounds();

    let mut fixed: Vec<usize> = Vec::new();
    let mut history = Vec::new();

    loop {
        let tk = Instant::now();
        history.push(fixed.clone());

        let sub_rows: Vec<usize> = fixed
            .iter()
            .map(|c| reduction.determinable[c])
            .chain(rank..reduction.num_rows())
            .collect();
        let sub_cols: Vec<usize> = fixed.iter().copied().chain(n_u..n_total).collect();
        let sub = SubSystem::extract(&reduction.arref, vectors, sub_rows, sub_cols, fixed.len())?;

        let reconciled = reconcile(&sub, solver).map_err(|e| {
            log::error!("resolution: reconciliation failed at step {}: {e}", history.len());
            e
        })?;
        log::debug!(
            "resolution: step {} reconciled {} variables in {:.2?}",
            history.len(),
            reconciled.len(),
            tk.elapsed()
        );

        let mut solved: Vec<Option<f64>> = vec![None; n_total];
        for (&c, &v) in sub.columns.iter().zip(&reconciled) {
            solved[c] = Some(v);
        }

        // ── Derive the remaining determinable variables ──
        let mut violations = Vec::new();
        let mut derived = Vec::new();
        for (&col, &row) in &reduction.determinable {
            if solved[col].is_some() {
                continue;
            }
            let value = derive(&rows[row], li[row], col, &solved).ok_or_else(|| {
                EngineError::Shape(format!(
                    "row {row} pinning variable {col} references an unresolved variable"
                ))
            })?;
            let below = value - vectors.lower[col] < -options.bound_tolerance;
            let above = options.check_upper_bound && value - vectors.upper[col] > options.bound_tolerance;
            if below || above {
                log::debug!(
                    "resolution: variable {col} = {value:.6} outside [{}, {}]",
                    vectors.lower[col],
                    vectors.upper[col]
                );
                violations.push(col);
            }
            derived.push((col, value));
        }

        if violations.is_empty() {
            for (col, value) in derived {
                solved[col] = Some(value);
            }
            log::debug!("resolution: converged after {} step(s), {} fixed", history.len(), fixed.len());
            return Ok(Resolution {
                solved,
                reconciled,
                fixed,
                iterations: history.len(),
                fixed_history: history,
            });
        }

        for col in violations {
            if !fixed.contains(&col) {
                fixed.push(col);
            }
        }
    }
}

/// `(li − Σ_{c≠col} a_c x_c) / a_col`, or `None` if a needed value is missing.
fn derive(row: &[(usize, f64)], li: f64, col: usize, solved: &[Option<f64>]) -> Option<f64> {
    let mut pivot = 0.0;
    let mut acc = li;
    for &(c, a) in row {
        if c >= solved.len() {
            continue;
        }
        if c == col {
            pivot = a;
        } else {
            acc -= a * solved[c]?;
        }
    }
    if pivot == 0.0 {
        None
    } else {
        Some(acc / pivot)
    }
}
