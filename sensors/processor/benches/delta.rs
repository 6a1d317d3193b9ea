use criterion::{black_box, criterion_group, criterion_main, Criterion};
use procsense_processor::{delta, RawSnapshot};

const PROC_STAT_LINE: &str = "cpu  4705 356 584 3699 23 23 0 0 0 0";

fn bench_delta(c: &mut Criterion) {
    let previous = RawSnapshot::new(5061, 584, 3699);
    let current = RawSnapshot::new(5161, 604, 4579);

    c.bench_function("delta_tick", |b| {
        b.iter(|| delta::tick(black_box(Some(previous)), black_box(current)));
    });

    c.bench_function("parse_proc_stat_line", |b| {
        b.iter(|| RawSnapshot::parse_from_proc_stat_line(black_box(PROC_STAT_LINE)));
    });
}

criterion_group!(benches, bench_delta);
criterion_main!(benches);
