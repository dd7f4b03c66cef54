//! Transition-path throughput: how fast `WorkItem::advance` walks a full
//! path from start to its terminal phase, for the hot read/write-hit
//! paths and the heavier dirty-write clone path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bittern_core::statemachine::{PathKind, WorkItem};

fn drive_to_terminal(kind: PathKind) -> u32 {
    let mut item = WorkItem::new(1, kind, 1, 1, true);
    let mut steps = 0;
    while item.advance().is_some() {
        steps += 1;
    }
    steps
}

fn bench_read_hit_path(c: &mut Criterion) {
    c.bench_function("state_machine_read_hit", |b| b.iter(|| black_box(drive_to_terminal(PathKind::ReadHit))));
}

fn bench_write_hit_wb_clean_path(c: &mut Criterion) {
    c.bench_function("state_machine_write_hit_wb_clean", |b| {
        b.iter(|| black_box(drive_to_terminal(PathKind::WriteHitWbClean)))
    });
}

fn bench_write_hit_wb_dirty_clone_path(c: &mut Criterion) {
    c.bench_function("state_machine_write_hit_wb_dirty_clone", |b| {
        b.iter(|| black_box(drive_to_terminal(PathKind::WriteHitWbDirtyCloneOriginal)))
    });
}

fn bench_merge_partial_write(c: &mut Criterion) {
    use bittern_core::layout::CACHE_BLOCK_SIZE;
    use bittern_core::statemachine::merge_partial_write;

    let base = Box::new([0xABu8; CACHE_BLOCK_SIZE]);
    let data = vec![0xCDu8; 512];
    c.bench_function("state_machine_merge_partial_write", |b| {
        b.iter(|| black_box(merge_partial_write(&base, 512, &data)))
    });
}

criterion_group!(
    benches,
    bench_read_hit_path,
    bench_write_hit_wb_clean_path,
    bench_write_hit_wb_dirty_clone_path,
    bench_merge_partial_write
);
criterion_main!(benches);
