//! Micro-benchmarks for the matrix engine and one training step
//!
//! Run with: cargo bench -p neural
//!
//! GPU groups are skipped on machines without an adapter.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use neural::{Backend, CpuBackend, GradientDescent, Matrix, Network, NetworkConfig, Optimizer};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_matrix<B: Backend>(backend: &Arc<B>, rows: usize, columns: usize, rng: &mut StdRng) -> Matrix<B> {
    Matrix::from_fn(backend, rows, columns, |_, _| rng.random_range(-1.0..1.0)).unwrap()
}

fn bench_dot_on<B: Backend>(c: &mut Criterion, backend: Arc<B>) {
    let mut group = c.benchmark_group(format!("dot/{}", backend.name()));
    let mut rng = StdRng::seed_from_u64(0);

    for size in [64, 256, 512].iter() {
        let a = random_matrix(&backend, *size, *size, &mut rng);
        let b = random_matrix(&backend, *size, *size, &mut rng);
        let mut out = Matrix::zeros(&backend, *size, *size).unwrap();

        group.throughput(Throughput::Elements((size * size * size) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |bench, _| {
            bench.iter(|| {
                Matrix::dot(black_box(&a), black_box(&b), &mut out, false, false).unwrap();
                // reading one value forces the queued work to finish
                Matrix::sum(&out).unwrap()
            });
        });
    }

    group.finish();
}

/// Forward, backward and descend on an MNIST-shaped batch
fn bench_training_step_on<B: Backend>(c: &mut Criterion, backend: Arc<B>) {
    let mut group = c.benchmark_group(format!("training_step/{}", backend.name()));
    group.sample_size(20);
    let mut rng = StdRng::seed_from_u64(1);

    for batch in [10, 100].iter() {
        let config = NetworkConfig::new(784, 10, 100, 2).with_regularization(0.0001);
        let mut network = Network::new(&backend, config, &mut rng).unwrap();
        let x = random_matrix(&backend, 784, *batch, &mut rng);
        let y = Matrix::from_fn(&backend, 10, *batch, |r, c| (r == c % 10) as u8 as f32).unwrap();
        let mut optimizer = GradientDescent::new(0.1).unwrap();

        group.throughput(Throughput::Elements(*batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), batch, |bench, _| {
            bench.iter(|| {
                network.forward(&x).unwrap();
                network.cost_prime(&x, &y).unwrap();
                let (weights, gradients) = network.weights_and_gradients_mut();
                optimizer.descend(weights, gradients).unwrap();
                network.evaluate_cost(&x, &y).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_cpu(c: &mut Criterion) {
    let backend = Arc::new(CpuBackend::new());
    bench_dot_on(c, Arc::clone(&backend));
    bench_training_step_on(c, backend);
}

#[cfg(feature = "gpu")]
fn bench_gpu(c: &mut Criterion) {
    let Ok(ctx) = neural::GpuContext::new() else {
        eprintln!("no GPU adapter, skipping GPU benchmarks");
        return;
    };
    let backend = Arc::new(ctx);
    bench_dot_on(c, Arc::clone(&backend));
    bench_training_step_on(c, backend);
}

#[cfg(not(feature = "gpu"))]
fn bench_gpu(_: &mut Criterion) {}

criterion_group!(benches, bench_cpu, bench_gpu);
criterion_main!(benches);
