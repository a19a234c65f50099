//! QP solver, single reconciliation and the determinability fixed point.

use approx::assert_abs_diff_eq;
use massbal::qp::{AdmmSolver, QpProblem, QpSolution, QpSolver};
use massbal::reconcile::{formulate, reconcile, weights, SubSystem};
use massbal::reduction::{classify_matrix, Reduction};
use massbal::resolve::resolve;
use massbal::types::*;
use proptest::prelude::*;
use sprs::{CsMat, TriMat};
use std::sync::atomic::{AtomicUsize, Ordering};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn model_matrix(rows: &[(Vec<f64>, f64, f64)]) -> CsMat<f64> {
    let n = rows.first().map_or(0, |r| r.0.len());
    let mut tri = TriMat::new((rows.len(), n + 2));
    for (r, (coef, li, ui)) in rows.iter().enumerate() {
        for (c, &v) in coef.iter().enumerate() {
            if v != 0.0 {
                tri.add_triplet(r, c, v);
            }
        }
        tri.add_triplet(r, n, *li);
        tri.add_triplet(r, n + 1, *ui);
    }
    tri.to_csr()
}

fn reduce(rows: &[(Vec<f64>, f64, f64)], n_measured: usize) -> Reduction {
    classify_matrix(&model_matrix(rows), n_measured, &ReductionOptions::default()).unwrap()
}

fn vectors(data: &[f64], sigma: f64, lower: f64, upper: f64) -> VariableVectors {
    let n = data.len();
    VariableVectors::new(data.to_vec(), vec![sigma; n], vec![lower; n], vec![upper; n]).unwrap()
}

fn diag(values: &[f64]) -> CsMat<f64> {
    let mut tri = TriMat::new((values.len(), values.len()));
    for (i, &v) in values.iter().enumerate() {
        tri.add_triplet(i, i, v);
    }
    tri.to_csc()
}

fn rows_matrix(rows: &[Vec<f64>], n: usize) -> CsMat<f64> {
    let mut tri = TriMat::new((rows.len(), n));
    for (r, row) in rows.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            if v != 0.0 {
                tri.add_triplet(r, c, v);
            }
        }
    }
    tri.to_csr()
}

/// Counts calls and forwards to ADMM.
struct CountingSolver {
    inner: AdmmSolver,
    calls: AtomicUsize,
}

impl QpSolver for CountingSolver {
    fn solve(&self, problem: &QpProblem) -> EngineResult<QpSolution> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.inner.solve(problem)
    }
}

// ─────────────────────────────────────────────────────────────
//  QP solver
// ─────────────────────────────────────────────────────────────

#[test]
fn qp_box_projection() {
    // min (x − 3)²  s.t.  0 ≤ x ≤ 1
    let problem = QpProblem {
        p: diag(&[2.0]),
        q: vec![-6.0],
        a: rows_matrix(&[], 1),
        row_lower: vec![],
        row_upper: vec![],
        lower: vec![0.0],
        upper: vec![1.0],
        warm_start: None,
    };
    let sol = AdmmSolver::default().solve(&problem).unwrap();
    assert_eq!(sol.status, QpStatus::Solved);
    assert_abs_diff_eq!(sol.x[0], 1.0, epsilon = 1e-6);
}

#[test]
fn qp_equality_constrained_least_squares() {
    // min (x0 − 1)² + (x1 − 2)²  s.t.  x0 + x1 = 5
    let problem = QpProblem {
        p: diag(&[2.0, 2.0]),
        q: vec![-2.0, -4.0],
        a: rows_matrix(&[vec![1.0, 1.0]], 2),
        row_lower: vec![5.0],
        row_upper: vec![5.0],
        lower: vec![f64::NEG_INFINITY; 2],
        upper: vec![f64::INFINITY; 2],
        warm_start: None,
    };
    let sol = AdmmSolver::default().solve(&problem).unwrap();
    assert_eq!(sol.status, QpStatus::Solved);
    assert_abs_diff_eq!(sol.x[0], 2.0, epsilon = 1e-5);
    assert_abs_diff_eq!(sol.x[1], 3.0, epsilon = 1e-5);
}

#[test]
fn qp_ranged_row() {
    // min (x0 − 4)² + (x1 − 4)²  s.t.  2 ≤ x0 + x1 ≤ 6
    let problem = QpProblem {
        p: diag(&[2.0, 2.0]),
        q: vec![-8.0, -8.0],
        a: rows_matrix(&[vec![1.0, 1.0]], 2),
        row_lower: vec![2.0],
        row_upper: vec![6.0],
        lower: vec![0.0; 2],
        upper: vec![10.0; 2],
        warm_start: Some(vec![4.0, 4.0]),
    };
    let sol = AdmmSolver::default().solve(&problem).unwrap();
    assert_eq!(sol.status, QpStatus::Solved);
    assert_abs_diff_eq!(sol.x[0] + sol.x[1], 6.0, epsilon = 1e-5);
    assert_abs_diff_eq!(sol.x[0], 3.0, epsilon = 1e-5);
}

#[test]
fn qp_detects_infeasible_bounds() {
    // x = 0 with x ∈ [10, 20]
    let problem = QpProblem {
        p: diag(&[2.0]),
        q: vec![-30.0],
        a: rows_matrix(&[vec![1.0]], 1),
        row_lower: vec![0.0],
        row_upper: vec![0.0],
        lower: vec![10.0],
        upper: vec![20.0],
        warm_start: None,
    };
    let sol = AdmmSolver::default().solve(&problem).unwrap();
    assert_ne!(sol.status, QpStatus::Solved);
}

#[test]
fn qp_empty_ranges_are_infeasible() {
    let mk = |row: (f64, f64), bounds: (f64, f64)| QpProblem {
        p: diag(&[2.0, 2.0]),
        q: vec![0.0, 0.0],
        a: rows_matrix(&[vec![1.0, 1.0]], 2),
        row_lower: vec![row.0],
        row_upper: vec![row.1],
        lower: vec![bounds.0, 0.0],
        upper: vec![bounds.1, 10.0],
        warm_start: None,
    };
    let solver = AdmmSolver::default();

    let sol = solver.solve(&mk((5.0, -5.0), (0.0, 10.0))).unwrap();
    assert_eq!(sol.status, QpStatus::PrimalInfeasible);
    assert_eq!(sol.iterations, 0);

    let sol = solver.solve(&mk((5.0, 5.0), (2.0, 1.0))).unwrap();
    assert_eq!(sol.status, QpStatus::PrimalInfeasible);

    let sol = solver.solve(&mk((5.0, 5.0), (f64::NAN, 1.0))).unwrap();
    assert_eq!(sol.status, QpStatus::PrimalInfeasible);
}

#[test]
fn qp_without_variables() {
    let solver = AdmmSolver::default();
    let mk = |l: f64, u: f64| QpProblem {
        p: diag(&[]),
        q: vec![],
        a: rows_matrix(&[vec![]], 0),
        row_lower: vec![l],
        row_upper: vec![u],
        lower: vec![],
        upper: vec![],
        warm_start: None,
    };
    assert_eq!(solver.solve(&mk(-1.0, 1.0)).unwrap().status, QpStatus::Solved);
    assert_eq!(solver.solve(&mk(2.0, 3.0)).unwrap().status, QpStatus::PrimalInfeasible);
}

#[test]
fn qp_rejects_inconsistent_shapes() {
    let problem = QpProblem {
        p: diag(&[2.0, 2.0]),
        q: vec![0.0],
        a: rows_matrix(&[], 1),
        row_lower: vec![],
        row_upper: vec![],
        lower: vec![0.0],
        upper: vec![1.0],
        warm_start: None,
    };
    assert!(matches!(AdmmSolver::default().solve(&problem), Err(EngineError::Shape(_))));
}

// ─────────────────────────────────────────────────────────────
//  Reconciliation
// ─────────────────────────────────────────────────────────────

#[test]
fn weights_follow_sigma_and_zero_fixed_columns() {
    let v = VariableVectors::new(
        vec![1.0, 1.0, 1.0, 1.0],
        vec![4.0, 0.25, 0.0, -1.0],
        vec![0.0; 4],
        vec![10.0; 4],
    )
    .unwrap();
    let w = weights(&v, 1);
    assert_eq!(w[0], 0.0);
    assert_abs_diff_eq!(w[1], 2.0, epsilon = 1e-12);
    assert_eq!(w[2], 1.0, "σ = 0 weighs like σ = 1");
    assert_eq!(w[3], 1.0);
}

#[test]
fn fully_measured_balance_sums_to_row_bound() {
    let red = reduce(&[(vec![1.0, 1.0], 10.0, 10.0)], 2);
    let v = vectors(&[4.0, 5.0], 1.0, 0.0, 100.0);
    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();

    let x0 = res.solved[0].unwrap();
    let x1 = res.solved[1].unwrap();
    assert_abs_diff_eq!(x0 + x1, 10.0, epsilon = 1e-5);
    assert_abs_diff_eq!(x0, 4.5, epsilon = 1e-5);
    assert_abs_diff_eq!(x1, 5.5, epsilon = 1e-5);
    assert_eq!(res.iterations, 1);
}

#[test]
fn smaller_sigma_moves_less() {
    let red = reduce(&[(vec![1.0, 1.0], 10.0, 10.0)], 2);
    let v = VariableVectors::new(vec![4.0, 5.0], vec![0.01, 1.0], vec![0.0; 2], vec![100.0; 2]).unwrap();
    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();
    let x0 = res.solved[0].unwrap();
    assert!((x0 - 4.0).abs() < (res.solved[1].unwrap() - 5.0).abs(), "x0 = {x0}");
}

#[test]
fn formulate_builds_weighted_objective() {
    let red = reduce(&[(vec![1.0, 1.0], 10.0, 10.0)], 2);
    let v = vectors(&[4.0, 5.0], 4.0, 0.0, 100.0);
    let sub = SubSystem::extract(&red.arref, &v, vec![0], vec![0, 1], 0).unwrap();
    let qp = formulate(&sub);
    // w² = 1/σ = 0.25  ⇒  P = 0.5 I,  q = −0.5 v
    assert_abs_diff_eq!(qp.p.get(0, 0).copied().unwrap(), 0.5, epsilon = 1e-12);
    assert_abs_diff_eq!(qp.q[1], -2.5, epsilon = 1e-12);
    assert_eq!(qp.row_lower, vec![10.0]);
    assert_eq!(qp.warm_start, Some(vec![4.0, 5.0]));
}

#[test]
fn infeasible_reconciliation_reports_sub_problem() {
    // x0 measured in [10, 20], but the balance says x0 = 0
    let red = reduce(&[(vec![1.0], 0.0, 0.0)], 1);
    let v = vectors(&[15.0], 1.0, 10.0, 20.0);
    let sub = SubSystem::extract(&red.arref, &v, vec![0], vec![0], 0).unwrap();

    match reconcile(&sub, &AdmmSolver::default()) {
        Err(EngineError::InfeasibleReconciliation { status, rows, columns }) => {
            assert_ne!(status, QpStatus::Solved);
            assert_eq!(rows, vec![0]);
            assert_eq!(columns, vec![0]);
        }
        other => panic!("expected InfeasibleReconciliation, got {other:?}"),
    }

    let err = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap_err();
    assert!(matches!(err, EngineError::InfeasibleReconciliation { .. }));
}

#[test]
fn empty_box_fails_reconciliation() {
    // x0 + x1 = 10 with x0 ∈ [6, 5]
    let red = reduce(&[(vec![1.0, 1.0], 10.0, 10.0)], 2);
    let v = VariableVectors::new(vec![4.0, 5.0], vec![1.0; 2], vec![6.0, 0.0], vec![5.0, 100.0]).unwrap();
    match resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()) {
        Err(EngineError::InfeasibleReconciliation { status, .. }) => {
            assert_eq!(status, QpStatus::PrimalInfeasible)
        }
        other => panic!("expected InfeasibleReconciliation, got {other:?}"),
    }
}

#[test]
fn ranged_row_balances_at_its_lower_bound() {
    // x0 + x1 ∈ [0, 10] with data (4, 4) reconciles to x0 + x1 = 0
    let red = reduce(&[(vec![1.0, 1.0], 0.0, 10.0)], 2);
    let v = vectors(&[4.0, 4.0], 1.0, -100.0, 100.0);
    let sub = SubSystem::extract(&red.arref, &v, vec![0], vec![0, 1], 0).unwrap();
    let qp = formulate(&sub);
    assert_eq!(qp.row_lower, qp.row_upper);

    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();
    assert_abs_diff_eq!(res.solved[0].unwrap(), 0.0, epsilon = 1e-5);
    assert_abs_diff_eq!(res.solved[1].unwrap(), 0.0, epsilon = 1e-5);
}

// ─────────────────────────────────────────────────────────────
//  Determinability fixed point
// ─────────────────────────────────────────────────────────────

#[test]
fn determinable_chain_is_derived() {
    // x0 = x1 = x2 + x3,  x2 = 3, x3 = 4 measured
    let red = reduce(
        &[
            (vec![1.0, -1.0, 0.0, 0.0], 0.0, 0.0),
            (vec![0.0, 1.0, -1.0, -1.0], 0.0, 0.0),
        ],
        2,
    );
    let v = vectors(&[0.0, 0.0, 3.0, 4.0], 1.0, 0.0, 100.0);
    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();

    assert_abs_diff_eq!(res.solved[0].unwrap(), 7.0, epsilon = 1e-6);
    assert_abs_diff_eq!(res.solved[1].unwrap(), 7.0, epsilon = 1e-6);
    assert_abs_diff_eq!(res.solved[2].unwrap(), 3.0, epsilon = 1e-6);
    assert!(res.fixed.is_empty());
    assert_eq!(res.fixed_history, vec![Vec::<usize>::new()]);
}

#[test]
fn free_variables_stay_unsolved() {
    // x0 + x1 = x2, x2 measured
    let red = reduce(&[(vec![1.0, 1.0, -1.0], 0.0, 0.0)], 1);
    let v = vectors(&[0.0, 0.0, 10.0], 1.0, 0.0, 100.0);
    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();
    assert_eq!(res.solved[0], None);
    assert_eq!(res.solved[1], None);
    assert_abs_diff_eq!(res.solved[2].unwrap(), 10.0, epsilon = 1e-6);
    assert_eq!(res.known_indices(), vec![2]);
}

#[test]
fn negative_derivation_is_pulled_into_the_qp() {
    // x0 = x1 − x2 with x1 = 5, x2 = 8  ⇒  x0 = −3 < 0
    let red = reduce(&[(vec![1.0, -1.0, 1.0], 0.0, 0.0)], 2);
    let v = vectors(&[0.0, 5.0, 8.0], 1.0, 0.0, 100.0);
    let solver = CountingSolver {
        inner: AdmmSolver::default(),
        calls: AtomicUsize::new(0),
    };
    let res = resolve(&red, &v, &solver, &ResolverOptions::default()).unwrap();

    assert_eq!(res.fixed, vec![0]);
    assert_eq!(res.fixed_history, vec![vec![], vec![0]]);
    assert_eq!(res.iterations, 2);
    assert_eq!(solver.calls.load(Ordering::Relaxed), 2);

    assert_abs_diff_eq!(res.solved[0].unwrap(), 0.0, epsilon = 1e-4);
    assert_abs_diff_eq!(res.solved[1].unwrap(), 6.5, epsilon = 1e-4);
    assert_abs_diff_eq!(res.solved[2].unwrap(), 6.5, epsilon = 1e-4);
}

#[test]
fn upper_bound_check_is_configurable() {
    // x0 = x1 + x2 = 12 but x0 ≤ 10
    let red = reduce(&[(vec![1.0, -1.0, -1.0], 0.0, 0.0)], 2);
    let v = VariableVectors::new(
        vec![0.0, 6.0, 6.0],
        vec![1.0; 3],
        vec![0.0; 3],
        vec![10.0, 100.0, 100.0],
    )
    .unwrap();

    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();
    assert_eq!(res.fixed, vec![0]);
    assert!(res.solved[0].unwrap() <= 10.0 + 1e-6);
    assert_abs_diff_eq!(res.solved[1].unwrap(), 5.0, epsilon = 1e-4);

    let lax = ResolverOptions {
        check_upper_bound: false,
        ..ResolverOptions::default()
    };
    let res = resolve(&red, &v, &AdmmSolver::default(), &lax).unwrap();
    assert!(res.fixed.is_empty());
    assert_abs_diff_eq!(res.solved[0].unwrap(), 12.0, epsilon = 1e-6);
}

#[test]
fn fixed_set_only_grows() {
    // Two independent violating derivations
    let red = reduce(
        &[
            (vec![1.0, 0.0, -1.0, 1.0, 0.0], 0.0, 0.0),
            (vec![0.0, 1.0, 0.0, -1.0, 1.0], 0.0, 0.0),
        ],
        3,
    );
    let v = vectors(&[0.0, 0.0, 2.0, 5.0, 9.0], 1.0, 0.0, 100.0);
    let res = resolve(&red, &v, &AdmmSolver::default(), &ResolverOptions::default()).unwrap();

    for pair in res.fixed_history.windows(2) {
        assert!(pair[0].iter().all(|c| pair[1].contains(c)), "{:?} ⊄ {:?}", pair[0], pair[1]);
        assert!(pair[1].len() > pair[0].len());
    }
    assert!(res.iterations <= red.determinable.len() + 1);
    for (i, value) in res.solved.iter().enumerate() {
        let x = value.unwrap();
        assert!(x >= v.lower[i] - 0.01, "x{i} = {x} below its bound");
    }
}

// ─────────────────────────────────────────────────────────────
//  Properties
// ─────────────────────────────────────────────────────────────

/// Balances satisfied by a point inside `[0, 10]`, so every reconciliation
/// is feasible.  Yields rows, measured count and noisy data.
fn consistent_model() -> impl Strategy<Value = (Vec<(Vec<f64>, f64, f64)>, usize, Vec<f64>)> {
    (1usize..4, 1usize..6).prop_flat_map(|(m, n)| {
        (
            prop::collection::vec(prop::collection::vec((-2i32..=2).prop_map(f64::from), n), m),
            prop::collection::vec((1i32..=9).prop_map(f64::from), n),
            prop::collection::vec((-2i32..=2).prop_map(f64::from), n),
            0..=n,
        )
            .prop_map(|(coefs, point, noise, n_measured)| {
                let rows = coefs
                    .into_iter()
                    .map(|coef| {
                        let rhs: f64 = coef.iter().zip(&point).map(|(a, x)| a * x).sum();
                        (coef, rhs, rhs)
                    })
                    .collect();
                let data = point.iter().zip(&noise).map(|(x, e)| x + e).collect();
                (rows, n_measured, data)
            })
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn resolved_values_stay_within_bounds((rows, n_measured, data) in consistent_model()) {
        let red = reduce(&rows, n_measured);
        let v = vectors(&data, 1.0, 0.0, 10.0);
        let options = ResolverOptions::default();
        let solver = AdmmSolver::new(QpSettings { eps_abs: 1e-7, eps_rel: 1e-7, ..QpSettings::default() });
        let res = resolve(&red, &v, &solver, &options).unwrap();

        let slack = options.bound_tolerance + 1e-6;
        for (i, value) in res.solved.iter().enumerate() {
            if let Some(x) = *value {
                prop_assert!(x >= v.lower[i] - slack, "x{} = {} below {}", i, x, v.lower[i]);
                prop_assert!(x <= v.upper[i] + slack, "x{} = {} above {}", i, x, v.upper[i]);
            }
        }
        for &k in &red.known_indices() {
            prop_assert!(res.solved[k].is_some(), "known x{} has no value", k);
        }
    }
}
