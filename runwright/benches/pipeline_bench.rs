//! Benchmarks for pipeline validation.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use runwright::pipeline::{validate, Step, StepDependency};

/// `layers` layers of `width` steps, each step depending on every step of
/// the previous layer.
fn layered(layers: usize, width: usize) -> (Vec<Step>, Vec<StepDependency>) {
    let name = |layer: usize, i: usize| format!("l{layer}_s{i}");
    let mut steps = Vec::with_capacity(layers * width);
    let mut deps = Vec::new();
    for layer in 0..layers {
        for i in 0..width {
            steps.push(Step::new(name(layer, i), "true"));
            if layer > 0 {
                for j in 0..width {
                    deps.push(StepDependency::new(name(layer, i), name(layer - 1, j)));
                }
            }
        }
    }
    (steps, deps)
}

fn validate_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");
    for (layers, width) in [(10, 10), (50, 20), (100, 30)] {
        let (steps, deps) = layered(layers, width);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{layers}x{width}")),
            &(steps, deps),
            |b, (steps, deps)| b.iter(|| validate(black_box(steps), black_box(deps))),
        );
    }
    group.finish();
}

criterion_group!(benches, validate_benchmark);
criterion_main!(benches);
