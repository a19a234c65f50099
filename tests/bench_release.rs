//! Release-mode benchmarks for the reconciliation engine.
//!
//! Run with:   cargo test --release --test bench_release -- --nocapture
//!
//! These are not criterion benchmarks (to avoid an extra dependency);
//! instead they time key operations using `std::time::Instant` and print
//! the results.

use massbal::engine::Engine;
use massbal::reduction::classify;
use massbal::types::*;
use sprs::TriMat;
use std::time::Instant;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

/// A cascade of `n` splitter units.
///
/// Unit `k` takes stream `s_k` and splits it into `s_{k+1}` and a product
/// `p_k`:  `s_k − s_{k+1} − p_k = 0`.  Every stream is measured except every
/// third product, which then has to be derived.
fn make_cascade(n: usize) -> (ConstraintModel, VariableVectors) {
    // variables: s_0..s_n (n + 1), then p_0..p_{n-1} (n)
    let num_vars = 2 * n + 1;
    let s = |k: usize| k;
    let p = |k: usize| n + 1 + k;

    let mut tri = TriMat::new((n, num_vars + 2));
    for k in 0..n {
        tri.add_triplet(k, s(k), 1.0);
        tri.add_triplet(k, s(k + 1), -1.0);
        tri.add_triplet(k, p(k), -1.0);
    }
    let matrix = tri.to_csr();

    let mut is_measured = vec![true; num_vars];
    for k in (0..n).step_by(3) {
        is_measured[p(k)] = false;
    }

    // Consistent flows: s_0 = 1000, each unit sends 10 % to the product
    let mut data = vec![0.0; num_vars];
    data[s(0)] = 1000.0;
    for k in 0..n {
        data[p(k)] = 0.1 * data[s(k)];
        data[s(k + 1)] = data[s(k)] - data[p(k)];
    }
    // 1 % noise pattern on the measured values
    for (i, v) in data.iter_mut().enumerate() {
        if is_measured[i] {
            *v *= 1.0 + 0.01 * ((i % 7) as f64 - 3.0) / 3.0;
        }
    }
    let sigma: Vec<f64> = data.iter().map(|v| (0.02 * v).max(1e-3)).collect();

    let model = ConstraintModel::from_natural(&matrix, &is_measured).unwrap();
    let vectors = VariableVectors::new(data, sigma, vec![0.0; num_vars], vec![1e4; num_vars]).unwrap();
    (model, vectors)
}

const CASCADE_SIZES: &[usize] = &[10, 30, 100, 300];

fn fmt_time(us: f64) -> String {
    if us >= 1_000_000.0 { format!("{:.2} s",  us / 1e6) }
    else if us >= 1_000.0 { format!("{:.2} ms", us / 1e3) }
    else { format!("{:.1} μs", us) }
}

// ─────────────────────────────────────────────────────────────
//  Benchmarks
// ─────────────────────────────────────────────────────────────

#[test]
fn bench_classification_scaling() {
    eprintln!("\n┌───────────────────────────────────────────────────────┐");
    eprintln!("│         CLASSIFICATION  (row reduction + classes)     │");
    eprintln!("├──────────┬──────────┬───────────┬─────────────────────┤");
    eprintln!("│  units   │  vars    │  per-run  │  total (iters)      │");
    eprintln!("├──────────┼──────────┼───────────┼─────────────────────┤");

    for &n in CASCADE_SIZES {
        let (model, _) = make_cascade(n);
        let opts = ReductionOptions::default();
        let iters: usize = if n < 50 { 200 } else if n < 200 { 20 } else { 3 };

        let start = Instant::now();
        for _ in 0..iters {
            let red = classify(&model, &opts).unwrap();
            assert_eq!(red.num_variables(), model.num_variables());
        }
        let elapsed = start.elapsed();
        let per_us = elapsed.as_micros() as f64 / iters as f64;

        eprintln!(
            "│  {:<7} │ {:>8} │ {:>9} │  {:.2} ms  ({} iters)",
            n,
            model.num_variables(),
            fmt_time(per_us),
            elapsed.as_secs_f64() * 1000.0,
            iters,
        );
    }
    eprintln!("└──────────┴──────────┴───────────┴─────────────────────┘\n");
}

#[test]
fn bench_solve_scaling() {
    eprintln!("\n┌───────────────────────────────────────────────────────┐");
    eprintln!("│        SOLVE  (fixed point + interval propagation)    │");
    eprintln!("├──────────┬──────────┬───────────┬─────────────────────┤");
    eprintln!("│  units   │  steps   │  per-run  │  total (iters)      │");
    eprintln!("├──────────┼──────────┼───────────┼─────────────────────┤");

    for &n in CASCADE_SIZES {
        let (model, vectors) = make_cascade(n);
        let engine = Engine::new(model, vectors, EngineConfig::default()).unwrap();
        let warm = engine.solve().unwrap();
        assert!(warm.solved.iter().all(|v| v.is_some()), "every variable should be known");

        let iters: usize = if n < 50 { 50 } else if n < 200 { 5 } else { 2 };
        let start = Instant::now();
        for _ in 0..iters {
            engine.solve().unwrap();
        }
        let elapsed = start.elapsed();
        let per_us = elapsed.as_micros() as f64 / iters as f64;

        eprintln!(
            "│  {:<7} │ {:>8} │ {:>9} │  {:.2} ms  ({} iters)",
            n,
            warm.iterations,
            fmt_time(per_us),
            elapsed.as_secs_f64() * 1000.0,
            iters,
        );
    }
    eprintln!("└──────────┴──────────┴───────────┴─────────────────────┘\n");
}

#[test]
fn bench_montecarlo_parallel_vs_sequential() {
    eprintln!("\n┌───────────────────────────────────────────────────────┐");
    eprintln!("│        MONTE-CARLO  (64 realizations, 30 units)       │");
    eprintln!("├──────────────┬───────────┬────────────────────────────┤");
    eprintln!("│  mode        │  total    │  per realization           │");
    eprintln!("├──────────────┼───────────┼────────────────────────────┤");

    for parallel in [false, true] {
        let (model, vectors) = make_cascade(30);
        let config = EngineConfig {
            montecarlo: MonteCarloOptions {
                realizations: 64,
                seed: 1,
                parallel,
                downscale: true,
                ..MonteCarloOptions::default()
            },
            ..EngineConfig::default()
        };
        let engine = Engine::new(model, vectors, config).unwrap();

        let start = Instant::now();
        let result = engine.monte_carlo().unwrap();
        let elapsed = start.elapsed();
        assert_eq!(result.count() + result.failures.len(), 64);

        eprintln!(
            "│  {:<11} │ {:>9} │  {}",
            if parallel { "parallel" } else { "sequential" },
            fmt_time(elapsed.as_micros() as f64),
            fmt_time(elapsed.as_micros() as f64 / 64.0),
        );
    }
    eprintln!("└──────────────┴───────────┴────────────────────────────┘\n");
}
