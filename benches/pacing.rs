//! Microbenchmarks for the hot pacing computations.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use dbrctl::pacing::do_pacing_curve;
use dbrctl::stats::fifo_occup_slab;

fn bench_do_pacing_curve(c: &mut Criterion) {
    c.bench_function("do_pacing_curve_sweep", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            let mut occup = 250;
            while occup < 11264 {
                acc += do_pacing_curve(black_box(occup), 250, 500, 0x7F, 11264) as u64;
                occup += 64;
            }
            acc
        })
    });
}

fn bench_fifo_occup_slab(c: &mut Criterion) {
    c.bench_function("fifo_occup_slab_sweep", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            let mut occup = 0;
            while occup < 11264 {
                acc += fifo_occup_slab(black_box(occup), 250);
                occup += 64;
            }
            acc
        })
    });
}

criterion_group!(benches, bench_do_pacing_curve, bench_fifo_occup_slab);
criterion_main!(benches);
