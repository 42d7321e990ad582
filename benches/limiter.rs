//! Concurrency limiter benchmark suite.
//!
//! Measures the cost of serializing actions through one limiter:
//! - Action counts: 100, 1000, 10000
//! - Uncontended (one submitter) and contended (many submitters)
//!
//! Run with: cargo bench --bench limiter
//! Results saved to: target/criterion/

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use tokio::sync::Notify;

use wsnext::runtime::{ConcurrencyLimiter, ContextHandle};

// ============================================================================
// Benchmark Parameters
// ============================================================================

const ACTION_COUNTS: &[usize] = &[100, 1_000, 10_000];
const SUBMITTERS: usize = 8;

// ============================================================================
// Benchmark: Sequential Submission
// ============================================================================

fn bench_sequential(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("limiter_sequential");
    for &count in ACTION_COUNTS {
        group.bench_with_input(BenchmarkId::new("actions", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| run_actions(count, 1));
        });
    }
    group.finish();
}

// ============================================================================
// Benchmark: Contended Submission
// ============================================================================

fn bench_contended(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("limiter_contended");
    for &count in ACTION_COUNTS {
        group.bench_with_input(BenchmarkId::new("actions", count), &count, |b, &count| {
            b.to_async(&rt).iter(|| run_actions(count, SUBMITTERS));
        });
    }
    group.finish();
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Submits `count` actions from `submitters` tasks and waits for all of them.
async fn run_actions(count: usize, submitters: usize) {
    let limiter = ConcurrencyLimiter::new();
    let context = ContextHandle::spawn();
    let done = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(Notify::new());

    let per_submitter = count / submitters;
    let total = per_submitter * submitters;

    let mut handles = Vec::with_capacity(submitters);
    for _ in 0..submitters {
        let limiter = limiter.clone();
        let context = context.clone();
        let done = Arc::clone(&done);
        let finished = Arc::clone(&finished);
        handles.push(tokio::spawn(async move {
            for _ in 0..per_submitter {
                let done = Arc::clone(&done);
                let finished = Arc::clone(&finished);
                limiter.run(&context, move |completion| {
                    if done.fetch_add(1, Ordering::SeqCst) + 1 == total {
                        finished.notify_one();
                    }
                    completion.complete();
                });
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    finished.notified().await;
}

criterion_group!(benches, bench_sequential, bench_contended);
criterion_main!(benches);
