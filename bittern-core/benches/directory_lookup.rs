//! Directory lookup throughput: rb-tree hit/miss/put under a populated
//! directory, mirroring the teacher's `buffer_cache_bench` linear-vs-hash
//! comparison but against the real `Directory` rather than a mock.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bittern_core::config::ReplacementPolicy;
use bittern_core::directory::{AllocateAs, Directory, GetOutcome};

fn populated_directory(slot_count: u32, fill: u32) -> Directory {
    let dir = Directory::new(slot_count, ReplacementPolicy::Fifo);
    for sector in 0..fill {
        match dir.get((sector * 8) as u64, AllocateAs::CleanNoData) {
            GetOutcome::MissInvalidIdle(id) => dir.put(id, false),
            other => panic!("unexpected outcome populating directory: {other:?}"),
        }
    }
    dir
}

fn bench_hit_lookup(c: &mut Criterion) {
    let dir = populated_directory(4096, 3000);
    let mut sector = 0u64;
    c.bench_function("directory_hit_lookup", |b| {
        b.iter(|| {
            let s = (sector % 3000) * 8;
            sector += 1;
            let id = match dir.get(s, AllocateAs::CleanNoData) {
                GetOutcome::HitIdle(id) => id,
                other => panic!("unexpected outcome: {other:?}"),
            };
            dir.put(id, false);
            black_box(id)
        })
    });
}

fn bench_miss_allocate(c: &mut Criterion) {
    c.bench_function("directory_miss_allocate", |b| {
        b.iter_with_setup(
            || populated_directory(4096, 2000),
            |dir| {
                let id = match dir.get(999_999, AllocateAs::DirtyNoData) {
                    GetOutcome::MissInvalidIdle(id) => id,
                    other => panic!("unexpected outcome: {other:?}"),
                };
                dir.put(id, false);
                black_box(id)
            },
        )
    });
}

fn bench_contains_peek(c: &mut Criterion) {
    let dir = populated_directory(4096, 3000);
    let mut sector = 0u64;
    c.bench_function("directory_contains_peek", |b| {
        b.iter(|| {
            let s = (sector % 3000) * 8;
            sector += 1;
            black_box(dir.contains(s))
        })
    });
}

criterion_group!(benches, bench_hit_lookup, bench_miss_allocate, bench_contains_peek);
criterion_main!(benches);
