//! Criterion benchmarks for single-event and batch inference
//!
//! These benchmarks measure:
//! - Feature assembly
//! - Scaling
//! - End-to-end `InferenceContext::predict`
//! - Batch classification through the tree ensemble

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::Array2;
use quake_depth::ml::{
    DepthClass, DepthClassifier, EnsembleParams, FeatureAssembler, FeatureDefaults, FeatureSchema,
    GradientBoostedEnsemble, InferenceContext, RawInputs, StandardScaler, TrainingDataset,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

fn synthetic(n: usize) -> TrainingDataset {
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    let labels: Vec<DepthClass> = (0..n)
        .map(|i| DepthClass::from_index(i % 3).unwrap())
        .collect();
    let features = Array2::from_shape_fn((n, 10), |(i, j)| {
        let class = (i % 3) as f64;
        if j == 1 {
            class * 4.0 + rng.gen_range(-1.0..1.0)
        } else {
            rng.gen_range(-3.0..3.0)
        }
    });
    TrainingDataset::new(features, labels).unwrap()
}

fn event() -> RawInputs {
    RawInputs::from_pairs([
        ("year", 2023.0),
        ("latitude", -2.0),
        ("longitude", 120.0),
        ("mag", 5.0),
        ("gap", 100.0),
        ("dmin", 0.1),
        ("rms", 0.8),
        ("horizontalError", 5.0),
        ("depthError", 5.0),
        ("magError", 0.1),
    ])
    .unwrap()
}

fn build_context(n_estimators: usize) -> (InferenceContext, Arc<GradientBoostedEnsemble>, Array2<f64>) {
    let raw = synthetic(600);
    let scaler = StandardScaler::fit(&raw.features).unwrap();
    let scaled_features = scaler.transform_matrix(&raw.features).unwrap();
    let scaled = TrainingDataset::new(scaled_features.clone(), raw.labels.clone()).unwrap();

    let params = EnsembleParams {
        n_estimators,
        ..EnsembleParams::default()
    };
    let ensemble = Arc::new(GradientBoostedEnsemble::fit(&scaled, &params, 42).unwrap());

    let schema = FeatureSchema::canonical();
    let defaults = FeatureDefaults::from_means(&schema, scaler.mean().as_slice().unwrap()).unwrap();
    let context = InferenceContext::new(schema, defaults, Arc::new(scaler), ensemble.clone()).unwrap();
    (context, ensemble, scaled_features)
}

/// Benchmark feature assembly and scaling
fn bench_preprocessing(c: &mut Criterion) {
    let (context, _, _) = build_context(10);
    let assembler = FeatureAssembler::new(FeatureSchema::canonical(), FeatureDefaults::None);
    let raw = event();

    c.bench_function("assemble", |b| {
        b.iter(|| assembler.assemble(black_box(&raw)).unwrap());
    });

    let vector = assembler.assemble(&raw).unwrap();
    c.bench_function("scale", |b| {
        b.iter(|| context.scaler().transform(black_box(vector.values().view())).unwrap());
    });
}

/// Benchmark end-to-end prediction for different ensemble sizes
fn bench_predict(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict");
    let raw = event();

    for n_estimators in [50, 300] {
        let (context, _, _) = build_context(n_estimators);
        group.bench_with_input(
            BenchmarkId::from_parameter(n_estimators),
            &n_estimators,
            |b, _| {
                b.iter(|| context.predict(black_box(&raw)).unwrap());
            },
        );
    }
    group.finish();
}

/// Benchmark batch classification
fn bench_classify_batch(c: &mut Criterion) {
    let (_, ensemble, scaled) = build_context(300);
    let mut group = c.benchmark_group("classify_batch");
    group.throughput(Throughput::Elements(scaled.nrows() as u64));
    group.bench_function("600_rows", |b| {
        b.iter(|| ensemble.classify_batch(black_box(&scaled)).unwrap());
    });
    group.finish();
}

criterion_group!(benches, bench_preprocessing, bench_predict, bench_classify_batch);
criterion_main!(benches);
