//! Feasible intervals for the variables a resolution leaves undetermined.
//!
//! Known variables collapse to `[v, v]` and are folded into the row bounds;
//! the remaining rows only involve free variables and are handed to an
//! [`IntervalKernel`], which tightens each free variable's `[min, max]`:
//!
//! ```text
//!   li ≤ Σⱼ sⱼ cⱼ xⱼ ≤ ui   ⇒   sₖ cₖ xₖ ∈ [li − max Σ_{j≠k}, ui − min Σ_{j≠k}]
//! ```

use crate::reduction::Reduction;
use crate::resolve::Resolution;
use crate::types::{EngineError, EngineResult, IntervalFailure, KernelOptions, VariableVectors};
use serde::{Deserialize, Serialize};
use sprs::CsMat;
use std::collections::VecDeque;

// ─────────────────────────────────────────────────────────────
//  Interval / row table
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub min: f64,
    pub max: f64,
}

impl Interval {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn point(v: f64) -> Self {
        Self { min: v, max: v }
    }
}

/// One non-zero of a constraint row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowEntry {
    pub variable: usize,
    /// |a|
    pub coefficient: f64,
    /// sign(a), ±1
    pub sign: f64,
}

impl RowEntry {
    #[inline]
    pub fn value(&self) -> f64 {
        self.sign * self.coefficient
    }
}

/// Arena of row entries with explicit row offsets: row `r` is
/// `entries[offsets[r]..offsets[r + 1]]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowTable {
    entries: Vec<RowEntry>,
    offsets: Vec<usize>,
}

impl RowTable {
    /// Decompose the first `num_variables` columns of `mat` row by row.
    pub fn from_matrix(mat: &CsMat<f64>, num_variables: usize) -> Self {
        let mut per_row: Vec<Vec<RowEntry>> = vec![Vec::new(); mat.rows()];
        for (&v, (r, c)) in mat.iter() {
            if c < num_variables && v != 0.0 {
                per_row[r].push(RowEntry {
                    variable: c,
                    coefficient: v.abs(),
                    sign: v.signum(),
                });
            }
        }
        let mut table = Self {
            entries: Vec::new(),
            offsets: vec![0],
        };
        for mut row in per_row {
            row.sort_unstable_by_key(|e| e.variable);
            table.entries.extend(row);
            table.offsets.push(table.entries.len());
        }
        table
    }

    /// Same rows, keeping only the entries whose variable passes `keep`.
    pub fn restricted(&self, keep: impl Fn(usize) -> bool) -> Self {
        let mut table = Self {
            entries: Vec::new(),
            offsets: vec![0],
        };
        for r in 0..self.num_rows() {
            table.entries.extend(self.row(r).iter().filter(|e| keep(e.variable)).copied());
            table.offsets.push(table.entries.len());
        }
        table
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn row(&self, r: usize) -> &[RowEntry] {
        &self.entries[self.offsets[r]..self.offsets[r + 1]]
    }

    /// Rows in which each variable occurs.
    pub fn occurrences(&self, num_variables: usize) -> Vec<Vec<usize>> {
        let mut occ = vec![Vec::new(); num_variables];
        for r in 0..self.num_rows() {
            for e in self.row(r) {
                occ[e.variable].push(r);
            }
        }
        occ
    }
}

// ─────────────────────────────────────────────────────────────
//  Interval kernel
// ─────────────────────────────────────────────────────────────

/// Interval-reduction strategy.  `intervals` is indexed by variable and
/// holds the starting ranges on entry; implementations only tighten the
/// variables that occur in `rows`.
pub trait IntervalKernel: Send + Sync {
    fn reduce(
        &self,
        rows: &RowTable,
        row_lower: &[f64],
        row_upper: &[f64],
        intervals: &mut [Interval],
    ) -> Result<(), IntervalFailure>;
}

/// Pure fixed-point constraint propagation.  Rows wait in a queue; a row
/// is revisited only when one of its variables was tightened since its last
/// visit.  The work is capped at `max_sweeps` visits of every row.
#[derive(Debug, Clone, Default)]
pub struct FixedPointKernel {
    pub options: KernelOptions,
}

impl FixedPointKernel {
    pub fn new(options: KernelOptions) -> Self {
        Self { options }
    }
}

impl IntervalKernel for FixedPointKernel {
    fn reduce(
        &self,
        rows: &RowTable,
        row_lower: &[f64],
        row_upper: &[f64],
        intervals: &mut [Interval],
    ) -> Result<(), IntervalFailure> {
        let tol = self.options.tolerance;
        let feas = self.options.feasibility_tolerance;
        let m = rows.num_rows();
        let occurrences = rows.occurrences(intervals.len());

        let mut queue: VecDeque<usize> = (0..m).collect();
        let mut queued = vec![true; m];
        let budget = self.options.max_sweeps.saturating_mul(m);
        let mut visits = 0;

        while let Some(r) = queue.pop_front() {
            if visits == budget {
                log::debug!("intervals: sweep cap {} reached before a fixed point", self.options.max_sweeps);
                return Ok(());
            }
            visits += 1;
            queued[r] = false;

            let row = rows.row(r);
            for (k, ek) in row.iter().enumerate() {
                // Range of the rest of the row
                let (mut rest_lo, mut rest_hi) = (0.0, 0.0);
                for (j, ej) in row.iter().enumerate() {
                    if j == k {
                        continue;
                    }
                    let a = ej.value();
                    let iv = intervals[ej.variable];
                    let (t1, t2) = (a * iv.min, a * iv.max);
                    rest_lo += t1.min(t2);
                    rest_hi += t1.max(t2);
                }

                let a = ek.value();
                let (lo_s, hi_s) = (row_lower[r] - rest_hi, row_upper[r] - rest_lo);
                let (lo, hi) = if a > 0.0 { (lo_s / a, hi_s / a) } else { (hi_s / a, lo_s / a) };

                let iv = &mut intervals[ek.variable];
                let mut tightened = false;
                if lo > iv.min + tol {
                    iv.min = lo;
                    tightened = true;
                }
                if hi < iv.max - tol {
                    iv.max = hi;
                    tightened = true;
                }
                if iv.min > iv.max {
                    let slack = feas * (1.0 + iv.min.abs().max(iv.max.abs()));
                    if iv.min - iv.max > slack {
                        return Err(IntervalFailure::Contradiction {
                            row: r,
                            variable: ek.variable,
                            min: iv.min,
                            max: iv.max,
                        });
                    }
                    let mid = 0.5 * (iv.min + iv.max);
                    *iv = Interval::point(mid);
                }

                if tightened {
                    for &other in &occurrences[ek.variable] {
                        if !queued[other] {
                            queued[other] = true;
                            queue.push_back(other);
                        }
                    }
                }
            }
        }
        log::trace!("intervals: fixed point after {visits} row visit(s)");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Propagation
// ─────────────────────────────────────────────────────────────

/// Per-variable intervals (model order).
#[derive(Debug, Clone, PartialEq)]
pub struct Intervals {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
    /// Set when the kernel failed; free variables then carry their declared
    /// bounds instead of propagated ones.
    pub degraded: Option<IntervalFailure>,
}

impl Intervals {
    fn from_slice(intervals: &[Interval], degraded: Option<IntervalFailure>) -> Self {
        Self {
            min: intervals.iter().map(|iv| iv.min).collect(),
            max: intervals.iter().map(|iv| iv.max).collect(),
            degraded,
        }
    }

    pub fn get(&self, i: usize) -> Interval {
        Interval::new(self.min[i], self.max[i])
    }

    pub fn len(&self) -> usize {
        self.min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.min.is_empty()
    }
}

/// Intervals for every variable given the solved values of `known`.
///
/// `arref` has `vectors.len() + 2` columns; `solved[k]` must be `Some` for
/// every `k` in `known`.
pub fn compute_intervals(
    vectors: &VariableVectors,
    solved: &[Option<f64>],
    arref: &CsMat<f64>,
    known: &[usize],
    kernel: &dyn IntervalKernel,
) -> EngineResult<Intervals> {
    let n_total = vectors.len();
    if solved.len() != n_total || arref.cols() != n_total + 2 {
        return Err(EngineError::Shape(format!(
            "interval propagation over {} variables with {} solved values and {} matrix columns",
            n_total,
            solved.len(),
            arref.cols()
        )));
    }

    // ── 1. Starting ranges ──
    let mut is_known = vec![false; n_total];
    let mut initial: Vec<Interval> = (0..n_total)
        .map(|i| Interval::new(vectors.lower[i], vectors.upper[i]))
        .collect();
    for &k in known {
        let value = solved
            .get(k)
            .copied()
            .flatten()
            .ok_or_else(|| EngineError::Shape(format!("known variable {k} has no solved value")))?;
        is_known[k] = true;
        initial[k] = Interval::point(value);
    }

    // ── 2./3. Row table and bounds net of the known variables ──
    let table = RowTable::from_matrix(arref, n_total);
    let m = table.num_rows();
    let mut new_li = vec![0.0; m];
    let mut new_ui = vec![0.0; m];
    for (&v, (r, c)) in arref.iter() {
        if c == n_total {
            new_li[r] = v;
        } else if c == n_total + 1 {
            new_ui[r] = v;
        }
    }
    for r in 0..m {
        for e in table.row(r) {
            if is_known[e.variable] {
                let val = e.value() * initial[e.variable].min;
                new_li[r] -= val;
                new_ui[r] -= val;
            }
        }
    }
    let free_rows = table.restricted(|v| !is_known[v]);
    if free_rows.num_entries() == 0 {
        return Ok(Intervals::from_slice(&initial, None));
    }

    // ── 4. Kernel ──
    let mut reduced = initial.clone();
    match kernel.reduce(&free_rows, &new_li, &new_ui, &mut reduced) {
        Ok(()) => {
            for &k in known {
                reduced[k] = initial[k];
            }
            Ok(Intervals::from_slice(&reduced, None))
        }
        Err(failure) => {
            log::error!("intervals: inequality reduction failed: {failure}");
            Ok(Intervals::from_slice(&initial, Some(failure)))
        }
    }
}

/// Intervals for a converged resolution of `reduction`.
pub fn propagate(
    reduction: &Reduction,
    vectors: &VariableVectors,
    resolution: &Resolution,
    kernel: &dyn IntervalKernel,
) -> EngineResult<Intervals> {
    compute_intervals(
        vectors,
        &resolution.solved,
        &reduction.arref,
        &reduction.known_indices(),
        kernel,
    )
}
