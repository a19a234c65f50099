//! **massbal** — mass-balance reconciliation and uncertainty propagation.
//!
//! This crate implements the complete reconciliation pipeline over a linear
//! balance model `A x = li` with measured and unmeasured variables:
//!
//! 1. **Reduction** (`reduction`): row-echelon form, observability classes.
//! 2. **QP** (`qp`): ADMM solver for the weighted least-squares sub-problems.
//! 3. **Reconciliation** (`reconcile`): build and solve one sub-problem.
//! 4. **Resolution** (`resolve`): determinability fixed point.
//! 5. **Intervals** (`intervals`): feasible ranges for free variables.
//! 6. **Monte-Carlo** (`montecarlo`): perturbed realizations on rayon.
//! 7. **Engine** (`engine`): natural-order facade over all of the above.
//! 8. **FFI** (`ffi`): C-compatible API.

pub mod types;
pub mod reduction;
pub mod qp;
pub mod reconcile;
pub mod resolve;
pub mod intervals;
pub mod montecarlo;
pub mod engine;
pub mod ffi;

pub use engine::{Engine, Solution};
pub use types::{EngineConfig, EngineError, EngineResult, VarClass};
