use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

use neighbor_embed::distance::pairwise_sq_distances;
use neighbor_embed::{AffinityCalibrator, SneOptimizerBuilder};

#[derive(Clone)]
pub struct EmbeddingBenchConfig {
    seed: u64,
    sizes: Vec<usize>,
    dims: usize,
    measurement_time: u64,
    sample_size: usize,
}

impl Default for EmbeddingBenchConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            sizes: vec![50, 100, 200],
            dims: 10,
            measurement_time: 10,
            sample_size: 10,
        }
    }
}

fn random_data(n: usize, dims: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, dims), |_| rng.random::<f64>() * 10.0)
}

fn bench_calibration(c: &mut Criterion) {
    let config = EmbeddingBenchConfig::default();
    let mut group = c.benchmark_group("affinity_calibration");
    group.measurement_time(Duration::from_secs(config.measurement_time));
    group.sample_size(config.sample_size);

    for &n in &config.sizes {
        let data = random_data(n, config.dims, config.seed);
        let distances = pairwise_sq_distances(data.view());
        group.bench_with_input(BenchmarkId::new("calibrate", n), &distances, |b, d| {
            b.iter(|| {
                AffinityCalibrator::new(30.0)
                    .calibrate(d.view())
                    .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_optimization(c: &mut Criterion) {
    let config = EmbeddingBenchConfig::default();
    let mut group = c.benchmark_group("embedding_optimization");
    group.measurement_time(Duration::from_secs(config.measurement_time));
    group.sample_size(config.sample_size);

    for &n in &config.sizes {
        let data = random_data(n, config.dims, config.seed);
        let distances = pairwise_sq_distances(data.view());
        let calibration = AffinityCalibrator::new(30.0)
            .calibrate(distances.view())
            .unwrap();
        group.bench_with_input(
            BenchmarkId::new("optimize_50_iters", n),
            &calibration.conditional,
            |b, p| {
                b.iter(|| {
                    SneOptimizerBuilder::new(2)
                        .iterations(50)
                        .build()
                        .optimize(p.view())
                        .unwrap()
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_calibration, bench_optimization);
criterion_main!(benches);
