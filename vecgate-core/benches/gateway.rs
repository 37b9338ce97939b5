//! Benchmarks for the per-call cost of the managed layer.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use vecgate_core::{Adoption, Index, MetricType, Runtime};

fn generate_random_vectors(n: usize, dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_flat_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("flat_search");
    let runtime = Runtime::mock().unwrap();

    for num_vectors in [1000, 10000].iter() {
        let dim = 128;
        let mut index = Index::flat(&runtime, dim, MetricType::L2).unwrap();
        index
            .add(&generate_random_vectors(*num_vectors, dim))
            .unwrap();
        let query = generate_random_vectors(1, dim);

        group.throughput(Throughput::Elements(*num_vectors as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_vectors),
            num_vectors,
            |bench, _| bench.iter(|| index.search(black_box(&query), 10).unwrap()),
        );
    }

    group.finish();
}

fn bench_range_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("range_search");
    let runtime = Runtime::mock().unwrap();
    let dim = 32;
    let mut index = Index::flat(&runtime, dim, MetricType::L2).unwrap();
    index.add(&generate_random_vectors(5000, dim)).unwrap();

    for nq in [1, 16, 64].iter() {
        let queries = generate_random_vectors(*nq, dim);
        group.throughput(Throughput::Elements(*nq as u64));
        group.bench_with_input(BenchmarkId::from_parameter(nq), nq, |bench, _| {
            bench.iter(|| index.range_search(black_box(&queries), 4.0).unwrap())
        });
    }

    group.finish();
}

fn bench_handle_lifecycle(c: &mut Criterion) {
    let runtime = Runtime::mock().unwrap();

    c.bench_function("flat_create_release", |bench| {
        bench.iter(|| {
            let index = Index::flat(&runtime, 64, MetricType::L2).unwrap();
            index.release().unwrap();
        })
    });

    c.bench_function("ivf_tree_create_release", |bench| {
        bench.iter(|| {
            let quantizer = Index::flat(&runtime, 64, MetricType::L2).unwrap();
            let ivf = Index::ivf_flat(&quantizer, 8, MetricType::L2, Adoption::Owned).unwrap();
            ivf.release().unwrap();
            black_box(quantizer.is_released())
        })
    });
}

criterion_group!(
    benches,
    bench_flat_search,
    bench_range_search,
    bench_handle_lifecycle
);
criterion_main!(benches);
