//! One-stop facade: classify once, then solve or run Monte-Carlo any number
//! of times.  Inputs and outputs are in the caller's natural variable order.

use crate::intervals::{propagate, FixedPointKernel, IntervalKernel};
use crate::montecarlo::{MonteCarlo, MonteCarloResult};
use crate::qp::{AdmmSolver, QpSolver};
use crate::reduction::{classify, Reduction};
use crate::resolve::resolve;
use crate::types::*;
use std::sync::atomic::AtomicBool;
use std::time::Instant;

/// Result of a single (unperturbed) solve, natural order.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    pub solved: Vec<Option<f64>>,
    pub interval_min: Vec<f64>,
    pub interval_max: Vec<f64>,
    pub classification: Vec<VarClass>,
    /// Determinable variables that had to be reconciled jointly.
    pub fixed: Vec<usize>,
    pub iterations: usize,
    pub degraded: Option<IntervalFailure>,
}

pub struct Engine {
    model: ConstraintModel,
    /// Model order.
    vectors: VariableVectors,
    config: EngineConfig,
    reduction: Reduction,
    solver: Box<dyn QpSolver>,
    kernel: Box<dyn IntervalKernel>,
}

impl Engine {
    /// Validate `config`, classify `model` and take `vectors` in natural order.
    pub fn new(model: ConstraintModel, vectors: VariableVectors, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        if vectors.len() != model.num_variables() {
            return Err(EngineError::Shape(format!(
                "{} variable values for a model of {} variables",
                vectors.len(),
                model.num_variables()
            )));
        }
        let reduction = classify(&model, &config.reduction)?;
        let vectors = model.layout.vectors_to_model(&vectors);
        Ok(Self {
            solver: Box::new(AdmmSolver::new(config.qp.clone())),
            kernel: Box::new(FixedPointKernel::new(config.kernel.clone())),
            model,
            vectors,
            config,
            reduction,
        })
    }

    pub fn with_solver(mut self, solver: Box<dyn QpSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_kernel(mut self, kernel: Box<dyn IntervalKernel>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn set_montecarlo_options(&mut self, options: MonteCarloOptions) -> EngineResult<()> {
        let mut config = self.config.clone();
        config.montecarlo = options;
        config.validate()?;
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn model(&self) -> &ConstraintModel {
        &self.model
    }

    pub fn reduction(&self) -> &Reduction {
        &self.reduction
    }

    pub fn num_variables(&self) -> usize {
        self.model.num_variables()
    }

    /// Classification in natural order.
    pub fn classification(&self) -> Vec<VarClass> {
        let layout = &self.model.layout;
        let mut out = vec![VarClass::Free; layout.len()];
        for (m, &class) in self.reduction.classification.iter().enumerate() {
            out[layout.model_to_natural[m]] = class;
        }
        out
    }

    /// Resolve and propagate intervals on the unperturbed data.
    pub fn solve(&self) -> EngineResult<Solution> {
        let t0 = Instant::now();
        let layout = &self.model.layout;
        let resolution = resolve(&self.reduction, &self.vectors, self.solver.as_ref(), &self.config.resolver)?;
        let intervals = propagate(&self.reduction, &self.vectors, &resolution, self.kernel.as_ref())?;
        log::info!(
            "solve: {} step(s), {} fixed, done in {:.2?}",
            resolution.iterations,
            resolution.fixed.len(),
            t0.elapsed()
        );
        Ok(Solution {
            solved: layout.to_natural(&resolution.solved),
            interval_min: layout.to_natural(&intervals.min),
            interval_max: layout.to_natural(&intervals.max),
            classification: self.classification(),
            fixed: resolution.fixed.iter().map(|&m| layout.model_to_natural[m]).collect(),
            iterations: resolution.iterations,
            degraded: intervals.degraded,
        })
    }

    pub fn monte_carlo(&self) -> EngineResult<MonteCarloResult> {
        self.monte_carlo_with_cancel(&AtomicBool::new(false))
    }

    pub fn monte_carlo_with_cancel(&self, cancel: &AtomicBool) -> EngineResult<MonteCarloResult> {
        let driver = MonteCarlo::new(
            &self.reduction,
            &self.model.layout,
            &self.vectors,
            self.solver.as_ref(),
            self.kernel.as_ref(),
            &self.config.resolver,
            self.config.montecarlo.clone(),
        )?;
        Ok(driver.run_with_cancel(cancel))
    }
}
