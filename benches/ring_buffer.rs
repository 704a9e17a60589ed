//! Benchmarks for the frame-indexed ring buffer.
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_rollback::{FrameRingBuffer, IfdId, MpmcRingBuffer};

fn bench_put_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("FrameRingBuffer");

    group.bench_function("put_with_eviction", |b| {
        let mut buffer: FrameRingBuffer<IfdId, u64> = FrameRingBuffer::new(451);
        b.iter(|| {
            buffer.put(black_box(7));
        });
    });

    group.bench_function("get_hit", |b| {
        let mut buffer: FrameRingBuffer<IfdId, u64> = FrameRingBuffer::new(451);
        for i in 0..451u64 {
            buffer.put(i);
        }
        b.iter(|| buffer.get(black_box(IfdId::new(225))));
    });

    group.bench_function("get_miss", |b| {
        let mut buffer: FrameRingBuffer<IfdId, u64> = FrameRingBuffer::new(451);
        for i in 0..451u64 {
            buffer.put(i);
        }
        b.iter(|| buffer.get(black_box(IfdId::new(-5))));
    });

    group.finish();
}

fn bench_dry_put_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("FrameRingBuffer slot reuse");

    // The hot path of a warm battle: every put reuses evicted Vec storage.
    group.bench_function("dry_put_vec_reuse", |b| {
        let mut buffer: FrameRingBuffer<IfdId, Vec<u64>> = FrameRingBuffer::new(64);
        for _ in 0..64 {
            buffer.put(vec![0; 8]);
        }
        b.iter(|| {
            let (_, slot) = buffer.dry_put();
            let storage = slot.get_or_insert_with(Vec::new);
            storage.clear();
            storage.extend_from_slice(black_box(&[1, 2, 3, 4, 5, 6, 7, 8]));
        });
    });

    group.finish();
}

fn bench_mpmc_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("MpmcRingBuffer");

    for capacity in [16usize, 256] {
        group.bench_with_input(
            BenchmarkId::new("put_pop", capacity),
            &capacity,
            |b, &capacity| {
                let buffer: MpmcRingBuffer<u64> = MpmcRingBuffer::new(capacity);
                b.iter(|| {
                    let _ = buffer.try_put(black_box(42));
                    black_box(buffer.pop());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_put_get, bench_dry_put_reuse, bench_mpmc_uncontended);
criterion_main!(benches);
