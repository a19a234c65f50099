//! Monte-Carlo uncertainty propagation.
//!
//! Every realization perturbs the measured values with a truncated Gaussian,
//! runs the determinability fixed point and the interval propagation on the
//! perturbed data, and records the result in natural variable order.
//!
//! A realization is a pure function of `(seed, index)`: it draws from its own
//! `Xoshiro256PlusPlus` stream, so the rayon and the sequential loop produce
//! identical results.

use crate::intervals::{propagate, IntervalKernel};
use crate::qp::QpSolver;
use crate::reduction::Reduction;
use crate::resolve::resolve;
use crate::types::{
    EngineError, EngineResult, IntervalFailure, MonteCarloOptions, ResolverOptions,
    VariableLayout, VariableVectors,
};
use rand::Rng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  Sampling
// ─────────────────────────────────────────────────────────────

/// Draw from `N(mean, sigma)` truncated to `(0, ∞) ∩ [mean ± n_sigmas·sigma]`.
///
/// Returns `None` when `max_retries` consecutive draws were rejected, or when
/// the parameters do not describe a distribution.
pub fn truncated_gaussian_draw<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    sigma: f64,
    n_sigmas: f64,
    max_retries: usize,
) -> Option<f64> {
    let normal = Normal::new(mean, sigma).ok()?;
    let half_width = n_sigmas * sigma;
    for _ in 0..max_retries {
        let v = normal.sample(rng);
        if v > 0.0 && (v - mean).abs() <= half_width {
            return Some(v);
        }
    }
    None
}

/// Copy of `vectors` with every measured value (model positions
/// `num_unmeasured..`) replaced by a truncated-Gaussian draw with the
/// effective sigma ([`VariableVectors::effective_sigma`]), so `σ ≤ 0` draws
/// with `σ = 1` exactly as it weighs.
pub fn perturb_measured<R: Rng + ?Sized>(
    rng: &mut R,
    vectors: &VariableVectors,
    num_unmeasured: usize,
    n_sigmas: f64,
    max_retries: usize,
) -> EngineResult<VariableVectors> {
    let mut out = vectors.clone();
    for i in num_unmeasured..vectors.len() {
        let (mean, sigma) = (vectors.data[i], vectors.effective_sigma(i));
        out.data[i] = truncated_gaussian_draw(rng, mean, sigma, n_sigmas, max_retries).ok_or(
            EngineError::SamplingFailure {
                variable: i,
                mean,
                sigma,
                retries: max_retries,
            },
        )?;
    }
    Ok(out)
}

/// Independent RNG stream of realization `index`.
pub fn realization_rng(seed: u64, index: usize) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

// ─────────────────────────────────────────────────────────────
//  Results
// ─────────────────────────────────────────────────────────────

/// One completed realization; every vector is in natural order except
/// `base_solved`.
#[derive(Debug, Clone)]
pub struct Realization {
    pub index: usize,
    /// Perturbed data values.
    pub input: Vec<f64>,
    pub solved: Vec<Option<f64>>,
    pub interval_min: Vec<f64>,
    pub interval_max: Vec<f64>,
    /// Solved vector in model order; `None` when the run is downscaled.
    pub base_solved: Option<Vec<Option<f64>>>,
    pub interval_degraded: Option<IntervalFailure>,
}

#[derive(Debug)]
pub struct RealizationFailure {
    pub index: usize,
    pub error: EngineError,
}

/// Per-variable summary over all completed realizations.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableStatistics {
    /// Number of realizations in which the variable had a solved value.
    pub samples: usize,
    pub mean: Option<f64>,
    /// Sample standard deviation (0 for a single sample).
    pub std_dev: Option<f64>,
    /// Envelope of the per-realization intervals.
    pub interval_min: f64,
    pub interval_max: f64,
}

#[derive(Debug)]
pub struct MonteCarloResult {
    pub requested: usize,
    /// Completed realizations, ordered by index.
    pub realizations: Vec<Realization>,
    pub failures: Vec<RealizationFailure>,
    pub cancelled: bool,
}

impl MonteCarloResult {
    pub fn count(&self) -> usize {
        self.realizations.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty() && self.count() == self.requested
    }

    pub fn statistics(&self) -> Vec<VariableStatistics> {
        let n = match self.realizations.first() {
            Some(r) => r.solved.len(),
            None => return Vec::new(),
        };
        (0..n)
            .map(|i| {
                let values: Vec<f64> = self.realizations.iter().filter_map(|r| r.solved[i]).collect();
                let samples = values.len();
                let (mean, std_dev) = if samples == 0 {
                    (None, None)
                } else {
                    let mean = values.iter().sum::<f64>() / samples as f64;
                    let var = if samples > 1 {
                        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (samples - 1) as f64
                    } else {
                        0.0
                    };
                    (Some(mean), Some(var.sqrt()))
                };
                let interval_min = self
                    .realizations
                    .iter()
                    .map(|r| r.interval_min[i])
                    .fold(f64::INFINITY, f64::min);
                let interval_max = self
                    .realizations
                    .iter()
                    .map(|r| r.interval_max[i])
                    .fold(f64::NEG_INFINITY, f64::max);
                VariableStatistics {
                    samples,
                    mean,
                    std_dev,
                    interval_min,
                    interval_max,
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Driver
// ─────────────────────────────────────────────────────────────

/// Shared, read-only state of a Monte-Carlo run.
pub struct MonteCarlo<'a> {
    reduction: &'a Reduction,
    layout: &'a VariableLayout,
    /// Model order, sigma floor already applied.
    vectors: VariableVectors,
    solver: &'a dyn QpSolver,
    kernel: &'a dyn IntervalKernel,
    resolver: &'a ResolverOptions,
    options: MonteCarloOptions,
}

impl<'a> MonteCarlo<'a> {
    /// `vectors` are in model order.
    pub fn new(
        reduction: &'a Reduction,
        layout: &'a VariableLayout,
        vectors: &VariableVectors,
        solver: &'a dyn QpSolver,
        kernel: &'a dyn IntervalKernel,
        resolver: &'a ResolverOptions,
        options: MonteCarloOptions,
    ) -> EngineResult<Self> {
        let n = reduction.num_variables();
        if vectors.len() != n || layout.len() != n || layout.num_unmeasured != reduction.num_unmeasured {
            return Err(EngineError::Shape(format!(
                "Monte-Carlo over a {}-variable model with {} values and a {}-variable layout",
                n,
                vectors.len(),
                layout.len()
            )));
        }
        let mut vectors = vectors.clone();
        if let Some(floor) = options.sigma_floor {
            vectors.apply_sigma_floor(floor);
        }
        Ok(Self {
            reduction,
            layout,
            vectors,
            solver,
            kernel,
            resolver,
            options,
        })
    }

    pub fn options(&self) -> &MonteCarloOptions {
        &self.options
    }

    /// Run realization `index` alone.
    pub fn realization(&self, index: usize) -> EngineResult<Realization> {
        let mut rng = realization_rng(self.options.seed, index);
        let input = perturb_measured(
            &mut rng,
            &self.vectors,
            self.reduction.num_unmeasured,
            self.options.n_sigmas,
            self.options.max_draw_retries,
        )
        .map_err(|e| match e {
            EngineError::SamplingFailure { variable, mean, sigma, retries } => EngineError::SamplingFailure {
                variable: self.layout.model_to_natural[variable],
                mean,
                sigma,
                retries,
            },
            other => other,
        })?;

        let resolution = resolve(self.reduction, &input, self.solver, self.resolver)?;
        let intervals = propagate(self.reduction, &input, &resolution, self.kernel)?;

        Ok(Realization {
            index,
            input: self.layout.to_natural(&input.data),
            solved: self.layout.to_natural(&resolution.solved),
            interval_min: self.layout.to_natural(&intervals.min),
            interval_max: self.layout.to_natural(&intervals.max),
            base_solved: if self.options.downscale {
                None
            } else {
                Some(resolution.solved)
            },
            interval_degraded: intervals.degraded,
        })
    }

    pub fn run(&self) -> MonteCarloResult {
        self.run_with_cancel(&AtomicBool::new(false))
    }

    /// Run every realization; once `cancel` is set no new realization starts.
    pub fn run_with_cancel(&self, cancel: &AtomicBool) -> MonteCarloResult {
        let t0 = Instant::now();
        let n = self.options.realizations;
        let step = (n / 10).max(1);
        let done = AtomicUsize::new(0);
        log::info!(
            "monte carlo: {n} realizations ({})",
            if self.options.parallel { "parallel" } else { "sequential" }
        );

        let one = |index: usize| -> Option<Result<Realization, RealizationFailure>> {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            let outcome = self.realization(index).map_err(|error| {
                log::warn!("monte carlo: realization {index} failed: {error}");
                RealizationFailure { index, error }
            });
            let k = done.fetch_add(1, Ordering::Relaxed) + 1;
            if k % step == 0 {
                log::info!("monte carlo: {k}/{n} realizations in {:.2?}", t0.elapsed());
            }
            Some(outcome)
        };

        let outcomes: Vec<Option<Result<Realization, RealizationFailure>>> = if self.options.parallel {
            (0..n).into_par_iter().map(&one).collect()
        } else {
            (0..n).map(&one).collect()
        };

        let mut result = MonteCarloResult {
            requested: n,
            realizations: Vec::with_capacity(n),
            failures: Vec::new(),
            cancelled: false,
        };
        for outcome in outcomes {
            match outcome {
                Some(Ok(r)) => result.realizations.push(r),
                Some(Err(f)) => result.failures.push(f),
                None => result.cancelled = true,
            }
        }
        log::info!(
            "monte carlo: {} completed, {} failed{} in {:.2?}",
            result.count(),
            result.failures.len(),
            if result.cancelled { ", cancelled" } else { "" },
            t0.elapsed()
        );
        result
    }
}
