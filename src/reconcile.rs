//! Weighted least-squares reconciliation of a sub-system.
//!
//! ```text
//!   minimise    Σⱼ ( wⱼ (xⱼ − valueⱼ) )²      wⱼ = 1/√σⱼ,  w = 0 for fixed columns
//!   subject to  A_sub x = li
//!               lower ≤ x ≤ upper
//! ```

use crate::qp::{QpProblem, QpSolver};
use crate::types::{
    entry, select_submatrix, EngineError, EngineResult, QpStatus, VariableVectors,
};
use sprs::{CsMat, TriMat};

/// Rows and columns of the reduced matrix that take part in one
/// reconciliation, with their data.
///
/// The first `num_fixed` columns are determinable variables pulled into the
/// optimisation; they carry no objective weight and are only held by their
/// rows and bounds.
#[derive(Debug, Clone)]
pub struct SubSystem {
    /// Coefficients restricted to `rows × columns`.
    pub coefficients: CsMat<f64>,
    /// Right-hand side `li` of each row.
    pub rhs: Vec<f64>,
    pub vectors: VariableVectors,
    pub num_fixed: usize,
    /// Row indices into the reduced matrix.
    pub rows: Vec<usize>,
    /// Column indices into the reduced matrix (model order).
    pub columns: Vec<usize>,
}

impl SubSystem {
    /// Cut a sub-system out of a reduced matrix with `vectors.len() + 2`
    /// columns.
    pub fn extract(
        arref: &CsMat<f64>,
        vectors: &VariableVectors,
        rows: Vec<usize>,
        columns: Vec<usize>,
        num_fixed: usize,
    ) -> EngineResult<Self> {
        let n_total = vectors.len();
        if arref.cols() != n_total + 2 {
            return Err(EngineError::Shape(format!(
                "reduced matrix has {} columns, expected {}",
                arref.cols(),
                n_total + 2
            )));
        }
        if num_fixed > columns.len()
            || rows.iter().any(|&r| r >= arref.rows())
            || columns.iter().any(|&c| c >= n_total)
        {
            return Err(EngineError::Shape(format!(
                "sub-system rows {rows:?} / columns {columns:?} out of range"
            )));
        }

        let coefficients = select_submatrix(arref, &rows, &columns);
        let rhs = rows.iter().map(|&r| entry(arref, r, n_total)).collect();
        Ok(Self {
            coefficients,
            rhs,
            vectors: vectors.select(&columns),
            num_fixed,
            rows,
            columns,
        })
    }

    pub fn num_variables(&self) -> usize {
        self.columns.len()
    }
}

/// Objective weights `wⱼ`: `1/√σ` (σ ≤ 0 counts as 1), zero for the fixed
/// columns.
pub fn weights(vectors: &VariableVectors, num_fixed: usize) -> Vec<f64> {
    (0..vectors.len())
        .map(|j| {
            if j < num_fixed {
                0.0
            } else {
                1.0 / vectors.effective_sigma(j).sqrt()
            }
        })
        .collect()
}

/// Build the QP of a sub-system.
pub fn formulate(sub: &SubSystem) -> QpProblem {
    let k = sub.num_variables();
    let w = weights(&sub.vectors, sub.num_fixed);

    // Σ w²(x − v)²  =  ½ xᵀ (2W²) x − (2W² v)ᵀ x + const
    let mut tri = TriMat::new((k, k));
    let mut q = vec![0.0; k];
    for j in 0..k {
        let w2 = 2.0 * w[j] * w[j];
        if w2 > 0.0 {
            tri.add_triplet(j, j, w2);
            q[j] = -w2 * sub.vectors.data[j];
        }
    }

    QpProblem {
        p: tri.to_csc(),
        q,
        a: sub.coefficients.clone(),
        row_lower: sub.rhs.clone(),
        row_upper: sub.rhs.clone(),
        lower: sub.vectors.lower.clone(),
        upper: sub.vectors.upper.clone(),
        warm_start: Some(sub.vectors.data.clone()),
    }
}

/// Reconcile a sub-system.  Returns the solved values of `sub.columns`, in
/// that order.
pub fn reconcile(sub: &SubSystem, solver: &dyn QpSolver) -> EngineResult<Vec<f64>> {
    let problem = formulate(sub);
    let solution = solver.solve(&problem)?;
    match solution.status {
        QpStatus::Solved => Ok(solution.x),
        status => {
            log::info!(
                "reconciliation: problem is {status} after {} iterations (r_prim {:.2e})",
                solution.iterations,
                solution.primal_residual
            );
            Err(EngineError::InfeasibleReconciliation {
                status,
                rows: sub.rows.clone(),
                columns: sub.columns.clone(),
            })
        }
    }
}
