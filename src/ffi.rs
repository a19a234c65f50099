//! C-compatible FFI.
//!
//! All functions are `#[no_mangle] extern "C"` so they can be called from C,
//! C# P/Invoke or Python ctypes.
//!
//! Memory convention:
//!   - Caller allocates flat arrays and passes pointers + lengths.
//!   - The opaque handle (`*mut MassbalHandle`) is created by Rust and freed
//!     by Rust via `massbal_free`.
//!   - Every vector crossing the boundary is in natural variable order.
//!   - Functions returning `i32` use the codes below; the message of the last
//!     failure on the calling thread is available from `massbal_last_error`.

use crate::engine::Engine;
use crate::types::*;
use sprs::TriMat;
use std::cell::RefCell;
use std::os::raw::c_char;
use std::slice;

pub const MASSBAL_OK: i32 = 0;
pub const MASSBAL_INFEASIBLE: i32 = 1;
pub const MASSBAL_SAMPLING: i32 = 2;
pub const MASSBAL_INVALID_INPUT: i32 = 3;
pub const MASSBAL_CONFIG: i32 = 4;
pub const MASSBAL_NUMERICAL: i32 = 5;

thread_local! {
    static LAST_ERROR: RefCell<String> = RefCell::new(String::new());
}

fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = msg);
}

fn error_code(err: &EngineError) -> i32 {
    match err {
        EngineError::InfeasibleReconciliation { .. } => MASSBAL_INFEASIBLE,
        EngineError::SamplingFailure { .. } => MASSBAL_SAMPLING,
        EngineError::Shape(_) => MASSBAL_INVALID_INPUT,
        EngineError::Config(_) => MASSBAL_CONFIG,
        EngineError::Linalg(_) | EngineError::Solver(_) => MASSBAL_NUMERICAL,
    }
}

fn fail(err: EngineError) -> i32 {
    let code = error_code(&err);
    log::debug!("ffi: returning {code}: {err}");
    set_last_error(err.to_string());
    code
}

// ─────────────────────────────────────────────────────────────
//  Opaque handle
// ─────────────────────────────────────────────────────────────

/// Engine handle that owns the classified model and its data.
pub struct MassbalHandle {
    pub engine: Engine,
}

/// Create a handle from raw arrays and classify the model.
///
/// Returns null on failure; see `massbal_last_error`.
///
/// # Safety
/// All pointers must be valid for the given lengths.
#[no_mangle]
pub unsafe extern "C" fn massbal_create(
    // ── Coefficients (COO triplets, num_rows × num_vars) ──
    num_rows: usize,
    num_vars: usize,
    coo_rows: *const usize,
    coo_cols: *const usize,
    coo_vals: *const f64,
    coo_nnz: usize,
    // ── Row bounds ──
    row_lower: *const f64, // length = num_rows
    row_upper: *const f64,
    // ── Variables (length = num_vars) ──
    is_measured: *const bool,
    data: *const f64,
    sigma: *const f64,
    lower: *const f64,
    upper: *const f64,
) -> *mut MassbalHandle {
    let coo_null = coo_nnz > 0 && (coo_rows.is_null() || coo_cols.is_null() || coo_vals.is_null());
    let bounds_null = num_rows > 0 && (row_lower.is_null() || row_upper.is_null());
    let vars_null = num_vars > 0
        && (is_measured.is_null() || [data, sigma, lower, upper].iter().any(|p| p.is_null()));
    if coo_null || bounds_null || vars_null {
        set_last_error("massbal_create: null input pointer".into());
        return std::ptr::null_mut();
    }

    let rows = raw_slice(coo_rows, coo_nnz);
    let cols = raw_slice(coo_cols, coo_nnz);
    let vals = raw_slice(coo_vals, coo_nnz);
    let li = raw_slice(row_lower, num_rows);
    let ui = raw_slice(row_upper, num_rows);

    // Build [A | li | ui] from COO
    let mut tri = TriMat::new((num_rows, num_vars + 2));
    for k in 0..coo_nnz {
        if rows[k] >= num_rows || cols[k] >= num_vars {
            set_last_error(format!(
                "massbal_create: triplet {k} at ({}, {}) outside {num_rows} × {num_vars}",
                rows[k], cols[k]
            ));
            return std::ptr::null_mut();
        }
        tri.add_triplet(rows[k], cols[k], vals[k]);
    }
    for r in 0..num_rows {
        tri.add_triplet(r, num_vars, li[r]);
        tri.add_triplet(r, num_vars + 1, ui[r]);
    }
    let matrix = tri.to_csr();

    let built = ConstraintModel::from_natural(&matrix, raw_slice(is_measured, num_vars))
        .and_then(|model| {
            let vectors = VariableVectors::new(
                raw_slice(data, num_vars).to_vec(),
                raw_slice(sigma, num_vars).to_vec(),
                raw_slice(lower, num_vars).to_vec(),
                raw_slice(upper, num_vars).to_vec(),
            )?;
            Engine::new(model, vectors, EngineConfig::default())
        });

    match built {
        Ok(engine) => Box::into_raw(Box::new(MassbalHandle { engine })),
        Err(e) => {
            fail(e);
            std::ptr::null_mut()
        }
    }
}

/// Free a handle.
///
/// # Safety
/// `handle` must be a pointer returned by `massbal_create`.
#[no_mangle]
pub unsafe extern "C" fn massbal_free(handle: *mut MassbalHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Number of variables of the model, 0 for a null handle.
///
/// # Safety
/// `handle` is null or valid.
#[no_mangle]
pub unsafe extern "C" fn massbal_num_variables(handle: *const MassbalHandle) -> usize {
    match handle.as_ref() {
        Some(h) => h.engine.num_variables(),
        None => 0,
    }
}

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

/// Configure the Monte-Carlo run.  `sigma_floor ≤ 0` disables the floor.
///
/// # Safety
/// Valid handle.
#[no_mangle]
pub unsafe extern "C" fn massbal_set_montecarlo(
    handle: *mut MassbalHandle,
    realizations: usize,
    seed: u64,
    n_sigmas: f64,
    sigma_floor: f64,
    parallel: bool,
) -> i32 {
    let Some(h) = handle.as_mut() else {
        set_last_error("massbal_set_montecarlo: null handle".into());
        return MASSBAL_INVALID_INPUT;
    };
    let options = MonteCarloOptions {
        realizations,
        seed,
        n_sigmas,
        sigma_floor: (sigma_floor > 0.0).then_some(sigma_floor),
        parallel,
        downscale: true,
        ..h.engine.config().montecarlo.clone()
    };
    match h.engine.set_montecarlo_options(options) {
        Ok(()) => MASSBAL_OK,
        Err(e) => fail(e),
    }
}

// ─────────────────────────────────────────────────────────────
//  Classification / solve
// ─────────────────────────────────────────────────────────────

/// Write the class code of every variable (0 redundant, 1 just measured,
/// 2 determinable, 3 free).
///
/// # Safety
/// Valid handle; `out_classes` has `num_variables` entries.
#[no_mangle]
pub unsafe extern "C" fn massbal_classify(handle: *const MassbalHandle, out_classes: *mut i32) -> i32 {
    let Some(h) = handle.as_ref() else {
        set_last_error("massbal_classify: null handle".into());
        return MASSBAL_INVALID_INPUT;
    };
    if out_classes.is_null() {
        set_last_error("massbal_classify: null output buffer".into());
        return MASSBAL_INVALID_INPUT;
    }
    let classes = h.engine.classification();
    let out = slice::from_raw_parts_mut(out_classes, classes.len());
    for (o, c) in out.iter_mut().zip(&classes) {
        *o = c.code();
    }
    MASSBAL_OK
}

/// Reconcile the unperturbed data.  Free variables get `NaN` in `out_solved`
/// and `false` in `out_known`.
///
/// # Safety
/// Valid handle; every output buffer has `num_variables` entries.
#[no_mangle]
pub unsafe extern "C" fn massbal_solve(
    handle: *const MassbalHandle,
    out_solved: *mut f64,
    out_known: *mut bool,
    out_min: *mut f64,
    out_max: *mut f64,
    out_iterations: *mut usize,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        set_last_error("massbal_solve: null handle".into());
        return MASSBAL_INVALID_INPUT;
    };
    if out_solved.is_null() || out_known.is_null() || out_min.is_null() || out_max.is_null() || out_iterations.is_null() {
        set_last_error("massbal_solve: null output buffer".into());
        return MASSBAL_INVALID_INPUT;
    }

    match h.engine.solve() {
        Ok(solution) => {
            let n = solution.solved.len();
            write_solved(&solution.solved, slice::from_raw_parts_mut(out_solved, n));
            let known = slice::from_raw_parts_mut(out_known, n);
            for (k, v) in known.iter_mut().zip(&solution.solved) {
                *k = v.is_some();
            }
            slice::from_raw_parts_mut(out_min, n).copy_from_slice(&solution.interval_min);
            slice::from_raw_parts_mut(out_max, n).copy_from_slice(&solution.interval_max);
            *out_iterations = solution.iterations;
            if let Some(failure) = solution.degraded {
                set_last_error(failure.to_string());
            }
            MASSBAL_OK
        }
        Err(e) => fail(e),
    }
}

// ─────────────────────────────────────────────────────────────
//  Monte-Carlo
// ─────────────────────────────────────────────────────────────

/// Run the configured Monte-Carlo.  Completed realizations are written in
/// index order, row-major `realizations × num_variables`; `out_count` gets
/// the number written.
///
/// Returns `MASSBAL_OK` when every realization completed, otherwise the code
/// of the first failed one (the completed rows are still written).
///
/// # Safety
/// Valid handle; every matrix buffer has `realizations × num_variables`
/// entries.
#[no_mangle]
pub unsafe extern "C" fn massbal_montecarlo(
    handle: *const MassbalHandle,
    out_input: *mut f64,
    out_solved: *mut f64,
    out_min: *mut f64,
    out_max: *mut f64,
    out_count: *mut usize,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        set_last_error("massbal_montecarlo: null handle".into());
        return MASSBAL_INVALID_INPUT;
    };
    if out_input.is_null() || out_solved.is_null() || out_min.is_null() || out_max.is_null() || out_count.is_null() {
        set_last_error("massbal_montecarlo: null output buffer".into());
        return MASSBAL_INVALID_INPUT;
    }

    let result = match h.engine.monte_carlo() {
        Ok(r) => r,
        Err(e) => return fail(e),
    };
    let n = h.engine.num_variables();
    let total = result.requested * n;
    let input = slice::from_raw_parts_mut(out_input, total);
    let solved = slice::from_raw_parts_mut(out_solved, total);
    let mins = slice::from_raw_parts_mut(out_min, total);
    let maxs = slice::from_raw_parts_mut(out_max, total);

    for (k, r) in result.realizations.iter().enumerate() {
        let span = k * n..(k + 1) * n;
        input[span.clone()].copy_from_slice(&r.input);
        write_solved(&r.solved, &mut solved[span.clone()]);
        mins[span.clone()].copy_from_slice(&r.interval_min);
        maxs[span].copy_from_slice(&r.interval_max);
    }
    *out_count = result.count();

    match result.failures.into_iter().next() {
        Some(failure) => fail(failure.error),
        None => MASSBAL_OK,
    }
}

// ─────────────────────────────────────────────────────────────
//  Errors
// ─────────────────────────────────────────────────────────────

/// Copy the last error message of this thread into `buf` (NUL-terminated,
/// truncated to `len`).  Returns the full message length in bytes.
///
/// # Safety
/// `buf` is null or valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn massbal_last_error(buf: *mut c_char, len: usize) -> usize {
    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        let bytes = msg.as_bytes();
        if !buf.is_null() && len > 0 {
            let n = bytes.len().min(len - 1);
            let out = slice::from_raw_parts_mut(buf as *mut u8, len);
            out[..n].copy_from_slice(&bytes[..n]);
            out[n] = 0;
        }
        bytes.len()
    })
}

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// Slice from a possibly-null pointer; null or zero length gives `&[]`.
unsafe fn raw_slice<'a, T>(ptr: *const T, len: usize) -> &'a [T] {
    if ptr.is_null() || len == 0 {
        &[]
    } else {
        slice::from_raw_parts(ptr, len)
    }
}

fn write_solved(solved: &[Option<f64>], out: &mut [f64]) {
    for (o, v) in out.iter_mut().zip(solved) {
        *o = v.unwrap_or(f64::NAN);
    }
}
