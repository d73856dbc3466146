use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use stockflow_core::ProductId;
use stockflow_infra::backoff::RetryPolicy;
use stockflow_infra::ledger_store::InMemoryLedgerStore;
use stockflow_infra::stock_ledger::{LedgerConfig, LockingMode, StockLedger};

const MODES: [LockingMode; 2] = [LockingMode::Optimistic, LockingMode::Pessimistic];

fn ledger(mode: LockingMode) -> StockLedger {
    let config = LedgerConfig {
        mode,
        retry: RetryPolicy::exponential(10_000, Duration::from_micros(50), Duration::from_millis(1)),
        lock_timeout: Duration::from_secs(30),
    };
    StockLedger::new(InMemoryLedgerStore::arc(), &config)
}

/// One thread, no contention: the per-call cost of each strategy.
fn bench_uncontended_decrement(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_decrement");
    group.throughput(Throughput::Elements(1));

    for mode in MODES {
        let ledger = ledger(mode);
        let product_id = ProductId::new();
        ledger.register(product_id, u64::MAX / 2).unwrap();

        group.bench_function(mode.as_str(), |b| {
            b.iter(|| black_box(ledger.decrement(product_id, 1).unwrap()));
        });
    }

    group.finish();
}

/// N threads hammering one product row.
fn bench_contended_decrement(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_decrement");
    group.sample_size(20);
    const PER_THREAD: u64 = 50;

    for threads in [2usize, 8, 32] {
        group.throughput(Throughput::Elements(threads as u64 * PER_THREAD));

        for mode in MODES {
            group.bench_with_input(BenchmarkId::new(mode.as_str(), threads), &threads, |b, &threads| {
                b.iter(|| {
                    let ledger = ledger(mode);
                    let product_id = ProductId::new();
                    ledger.register(product_id, threads as u64 * PER_THREAD).unwrap();
                    let barrier = Arc::new(Barrier::new(threads));

                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let ledger = ledger.clone();
                            let barrier = barrier.clone();
                            thread::spawn(move || {
                                barrier.wait();
                                for _ in 0..PER_THREAD {
                                    ledger.decrement(product_id, 1).unwrap();
                                }
                            })
                        })
                        .collect();
                    for handle in handles {
                        handle.join().unwrap();
                    }

                    assert_eq!(ledger.available(product_id).unwrap().quantity(), 0);
                });
            });
        }
    }

    group.finish();
}

/// Threads spread over distinct products: strategies should scale alike.
fn bench_independent_products(c: &mut Criterion) {
    let mut group = c.benchmark_group("independent_products");
    group.sample_size(20);
    const THREADS: usize = 8;
    const PER_THREAD: u64 = 100;
    group.throughput(Throughput::Elements(THREADS as u64 * PER_THREAD));

    for mode in MODES {
        group.bench_function(mode.as_str(), |b| {
            b.iter(|| {
                let ledger = ledger(mode);
                let handles: Vec<_> = (0..THREADS)
                    .map(|_| {
                        let ledger = ledger.clone();
                        let product_id = ProductId::new();
                        ledger.register(product_id, PER_THREAD).unwrap();
                        thread::spawn(move || {
                            for _ in 0..PER_THREAD {
                                ledger.decrement(product_id, 1).unwrap();
                            }
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_decrement,
    bench_contended_decrement,
    bench_independent_products
);
criterion_main!(benches);
