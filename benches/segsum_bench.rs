//! Row-sum strategy benchmarks
//!
//! Runs every reduction strategy on the CPU emulator for shapes that favour
//! each of them, next to the sequential reference.
//!
//! Run with: cargo bench --bench segsum_bench
//! Without rayon: cargo bench --bench segsum_bench --no-default-features

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use segsum::kernels::reference_row_sums;
use segsum::{CpuDevice, PlanKind, RowSumEngine, SegsumConfig};

fn create_test_matrix(rows: usize, cols: usize) -> Array2<i32> {
    Array2::from_shape_fn((rows, cols), |(r, c)| ((r * 31 + c) % 1000) as i32 - 500)
}

fn bench_plans(c: &mut Criterion) {
    let mut group = c.benchmark_group("row_sums");
    group.sample_size(20);

    let shapes = [
        (100_000, 4), // many short rows
        (4096, 64),   // rows fit a group
        (256, 2048),  // one group per row
        (2, 500_000), // few long rows
    ];

    let engine = RowSumEngine::new(CpuDevice::new(), SegsumConfig::default());

    for (rows, cols) in shapes {
        let m = create_test_matrix(rows, cols);
        let label = format!("{}x{}", rows, cols);
        group.throughput(Throughput::Elements((rows * cols) as u64));

        group.bench_with_input(BenchmarkId::new("reference", &label), &m, |b, m| {
            b.iter(|| black_box(reference_row_sums(m.view())))
        });

        for kind in PlanKind::ALL {
            if kind == PlanKind::SmallComm && cols > engine.config().group_size {
                continue;
            }
            group.bench_with_input(BenchmarkId::new(kind.name(), &label), &m, |b, m| {
                b.iter(|| {
                    engine.device().clear_launch_log();
                    black_box(engine.row_sums_with(m.view(), Some(kind)).unwrap())
                })
            });
        }
    }

    group.finish();
}

fn bench_auto_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("auto_plan");
    group.sample_size(20);

    for group_size in [64, 256, 1024] {
        let config = SegsumConfig::default().with_group_size(group_size);
        let engine = RowSumEngine::new(CpuDevice::new(), config);
        let m = create_test_matrix(512, 1000);
        group.throughput(Throughput::Elements(512 * 1000));

        group.bench_with_input(BenchmarkId::new("group_size", group_size), &m, |b, m| {
            b.iter(|| {
                engine.device().clear_launch_log();
                black_box(engine.row_sums(m.view()).unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_plans, bench_auto_plan);
criterion_main!(benches);
