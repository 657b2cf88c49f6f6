//! Shared fixtures for the integration tests: synthetic catalogs and
//! ready-made artifact sets.

#![allow(dead_code)]

use quake_depth::ml::{
    ArtifactManifest, ArtifactStore, EnsembleParams, FeatureSchema, RawInputs, SequenceParams,
    StandardScaler, TrainingConfig, TrainingPipeline,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CATALOG_HEADER: &str =
    "time,year,latitude,longitude,depth,mag,gap,dmin,rms,horizontalError,depthError,magError,place";

/// Write a catalog whose depth class is recoverable from latitude and
/// depthError. Returns the CSV path.
pub fn write_synthetic_catalog(dir: &Path, rows_per_class: [usize; 3], seed: u64) -> PathBuf {
    let path = dir.join("catalog.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "{}", CATALOG_HEADER).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for (class, &n) in rows_per_class.iter().enumerate() {
        for i in 0..n {
            let depth = match class {
                0 => rng.gen_range(1.0..65.0),
                1 => rng.gen_range(75.0..290.0),
                _ => rng.gen_range(310.0..650.0),
            };
            let latitude = -8.0 + class as f64 * 4.0 + rng.gen_range(-1.0..1.0);
            let depth_error = 2.0 + class as f64 * 6.0 + rng.gen_range(-1.0..1.0);
            writeln!(
                file,
                "2021-01-01T00:00:00Z,{},{:.4},{:.4},{:.2},{:.2},{:.1},{:.3},{:.3},{:.2},{:.2},{:.3},event {}-{}",
                rng.gen_range(2008..2024),
                latitude,
                rng.gen_range(95.0..141.0),
                depth,
                rng.gen_range(4.5..7.0),
                rng.gen_range(20.0..200.0),
                rng.gen_range(0.1..5.0),
                rng.gen_range(0.3..1.4),
                rng.gen_range(3.0..12.0),
                depth_error,
                rng.gen_range(0.03..0.2),
                class,
                i
            )
            .unwrap();
        }
    }
    path
}

/// Small, fast training settings
pub fn quick_training_config(dataset_path: PathBuf, with_sequence: bool) -> TrainingConfig {
    TrainingConfig {
        dataset_path,
        test_size: 0.25,
        seed: 7,
        ensemble: EnsembleParams {
            n_estimators: 30,
            max_depth: 3,
            learning_rate: 0.3,
            max_bins: 32,
            ..EnsembleParams::default()
        },
        sequence: SequenceParams {
            enabled: with_sequence,
            lstm1_units: 8,
            lstm2_units: 4,
            dense_units: 4,
            dropout: 0.0,
            epochs: 3,
            batch_size: 16,
            learning_rate: 0.01,
            patience: 2,
            ..SequenceParams::default()
        },
        ..TrainingConfig::default()
    }
}

/// Train a quick artifact set into `artifacts` from a fresh synthetic catalog
pub fn train_fixture(workdir: &Path, artifacts: &Path, with_sequence: bool) -> ArtifactManifest {
    let csv = write_synthetic_catalog(workdir, [60, 40, 30], 11);
    let pipeline = TrainingPipeline::new(
        quick_training_config(csv, with_sequence),
        FeatureSchema::canonical(),
    )
    .unwrap();
    pipeline.run(&ArtifactStore::new(artifacts)).unwrap().manifest
}

/// Scaler with known mean and standard deviation for the canonical schema
pub fn known_scaler() -> StandardScaler {
    StandardScaler::from_parts(
        vec![2021.0, 0.0, 120.0, 5.0, 90.0, 1.0, 0.9, 6.0, 5.0, 0.1],
        vec![2.0, 5.0, 10.0, 1.0, 50.0, 2.0, 0.3, 3.0, 3.0, 0.05],
    )
    .unwrap()
}

/// A complete event in catalog column names
pub fn example_event() -> RawInputs {
    RawInputs::from_pairs([
        ("year", 2023.0),
        ("latitude", -2.0),
        ("longitude", 120.0),
        ("magnitude", 5.0),
        ("gap", 100.0),
        ("dmin", 0.1),
        ("rms", 0.8),
        ("horizontalError", 5.0),
        ("depthError", 5.0),
        ("magError", 0.1),
    ])
    .unwrap()
}
