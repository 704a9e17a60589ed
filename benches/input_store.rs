//! Benchmarks for input merging and prefabrication.
//!
//! Run with: cargo bench --bench input_store

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lockstep_rollback::{IfdId, InputFrameStore, JoinIndex};

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputFrameStore upsert");

    for players_cnt in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("sequential", players_cnt),
            &players_cnt,
            |b, &players_cnt| {
                let mut store = InputFrameStore::new(451, players_cnt);
                let mut id = 0;
                b.iter(|| {
                    for join in 1..=players_cnt as u32 {
                        store.upsert(
                            IfdId::new(id),
                            JoinIndex::new(join),
                            black_box(id as u64),
                            true,
                            false,
                            0,
                        );
                    }
                    id += 1;
                });
            },
        );
    }

    // Retransmits hitting already-confirmed slots must be near-free.
    group.bench_function("already_confirmed", |b| {
        let mut store = InputFrameStore::new(451, 2);
        store.upsert(IfdId::new(0), JoinIndex::new(1), 7, true, false, 0);
        b.iter(|| {
            store.upsert(
                IfdId::new(0),
                JoinIndex::new(1),
                black_box(9),
                true,
                false,
                0,
            )
        });
    });

    group.finish();
}

fn bench_gap_prefab(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputFrameStore prefab");

    for gap in [4i32, 64, 450] {
        group.bench_with_input(BenchmarkId::new("gap", gap), &gap, |b, &gap| {
            b.iter_with_setup(
                || {
                    let mut store = InputFrameStore::new(451, 4);
                    for join in 1..=4 {
                        store.upsert(IfdId::new(0), JoinIndex::new(join), 5, true, false, 0);
                    }
                    store
                },
                |mut store| {
                    store.upsert(
                        IfdId::new(black_box(gap)),
                        JoinIndex::new(1),
                        1,
                        true,
                        false,
                        0,
                    );
                    store
                },
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_upsert, bench_gap_prefab);
criterion_main!(benches);
