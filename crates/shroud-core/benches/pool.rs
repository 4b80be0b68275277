//! Buffer pool benchmarks
//!
//! Benchmarks for measuring:
//! - Pooled acquire/release hit-path overhead
//! - Unpooled (out-of-range) acquisition cost
//! - Cross-class acquisition spread
//!
//! Run with: cargo bench --bench pool -p shroud-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shroud_core::{BufferPool, Domain, PoolConfig, Sizing};

/// Benchmark the pooled hit path at different capacity classes
fn bench_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_acquire_release");

    let pool = BufferPool::new(PoolConfig::default());

    let sizes = [("1KB", 1024), ("16KB", 16 * 1024), ("64KB", 64 * 1024)];
    for (name, size) in sizes {
        // Prime the bucket so the measured path is a hit.
        drop(pool.acquire(size, Domain::Heap));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("size", name), &size, |b, &size| {
            b.iter(|| {
                let buf = pool.acquire(black_box(size), Domain::Heap);
                black_box(&buf);
                drop(buf); // Return to bucket
            })
        });
    }

    group.finish();
}

/// Benchmark the unpooled fallback for out-of-range sizes
fn bench_unpooled(c: &mut Criterion) {
    let pool = BufferPool::new(PoolConfig {
        max_capacity: 16 * 1024,
        ..PoolConfig::default()
    });

    c.bench_function("pool_unpooled_128KB", |b| {
        b.iter(|| {
            let buf = pool.acquire(black_box(128 * 1024), Domain::Heap);
            black_box(&buf);
        })
    });
}

/// Benchmark power-of-two sizing against linear sizing
fn bench_sizing(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_sizing");

    let linear = BufferPool::new(PoolConfig::default());
    let pow2 = BufferPool::new(PoolConfig {
        sizing: Sizing::PowerOfTwo,
        ..PoolConfig::default()
    });
    for size in [1500usize, 9000] {
        drop(linear.acquire(size, Domain::Heap));
        drop(pow2.acquire(size, Domain::Heap));

        group.bench_with_input(BenchmarkId::new("linear", size), &size, |b, &size| {
            b.iter(|| drop(linear.acquire(black_box(size), Domain::Heap)))
        });
        group.bench_with_input(BenchmarkId::new("pow2", size), &size, |b, &size| {
            b.iter(|| drop(pow2.acquire(black_box(size), Domain::Heap)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_acquire_release, bench_unpooled, bench_sizing);
criterion_main!(benches);
