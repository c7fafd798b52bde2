//! Device scan throughput against a sequential fold baseline.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use hindsight_harness::{BlockScheduler, device_exclusive_scan};

fn sequential_exclusive(input: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(input.len());
    let mut acc = 0_u32;
    for &x in input {
        out.push(acc);
        acc = acc.wrapping_add(x);
    }
    out
}

fn bench_exclusive_scan(c: &mut Criterion) {
    let input: Vec<u32> = (0..1 << 16).map(|i| (i * 31 + 7) as u32).collect();

    let mut group = c.benchmark_group("exclusive_scan");
    group.throughput(Throughput::Elements(input.len() as u64));

    group.bench_function("sequential_fold", |b| {
        b.iter(|| sequential_exclusive(black_box(&input)));
    });

    for workers in [1_usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("lookback_fifo", workers),
            &workers,
            |b, &workers| {
                b.iter(|| {
                    device_exclusive_scan(
                        black_box(&input),
                        0,
                        1024,
                        BlockScheduler::Fifo { workers },
                        |a, b| a.wrapping_add(b),
                    )
                    .expect("scan must run")
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_exclusive_scan);
criterion_main!(benches);
