use crate::error::{AppError, Result};
use crate::metrics::{self, MODEL_TEST_ACCURACY, TRAINING_RUNS_TOTAL};
use crate::ml::artifacts::{ArtifactManifest, ArtifactSet, ArtifactStore};
use crate::ml::classifier::{evaluate, DepthClassifier};
use crate::ml::dataset::HistoricalDataset;
use crate::ml::ensemble::GradientBoostedEnsemble;
use crate::ml::models::{
    DepthClass, FeatureSchema, ModelMetadata, ModelMetrics, ModelType, RebalanceStrategy,
    TrainingConfig, TrainingDataset, NUM_CLASSES,
};
use crate::ml::scaler::StandardScaler;
use crate::ml::sequence::{self, FittedSequenceModel};
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};
use validator::Validate;

/// Balanced class weights `n / (n_present_classes * count_c)`; classes with
/// no samples get weight 0
pub fn balanced_class_weights(labels: &[DepthClass]) -> [f64; NUM_CLASSES] {
    let mut counts = [0usize; NUM_CLASSES];
    for label in labels {
        counts[label.index()] += 1;
    }
    let present = counts.iter().filter(|c| **c > 0).count();

    let mut weights = [0.0; NUM_CLASSES];
    for (w, &count) in weights.iter_mut().zip(&counts) {
        if count > 0 {
            *w = labels.len() as f64 / (present * count) as f64;
        }
    }
    weights
}

/// Apply the configured imbalance strategy to the training split
pub fn rebalance(
    dataset: TrainingDataset,
    strategy: RebalanceStrategy,
    seed: u64,
) -> Result<TrainingDataset> {
    match strategy {
        RebalanceStrategy::None => Ok(dataset),
        RebalanceStrategy::ClassWeight => {
            let class_weights = balanced_class_weights(&dataset.labels);
            info!(?class_weights, "Using balanced class weights");
            let weights: Array1<f64> = dataset
                .labels
                .iter()
                .map(|c| class_weights[c.index()])
                .collect();
            dataset.with_weights(weights)
        }
        RebalanceStrategy::Resample => {
            let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); NUM_CLASSES];
            for (i, label) in dataset.labels.iter().enumerate() {
                by_class[label.index()].push(i);
            }
            let target = by_class.iter().map(Vec::len).max().unwrap_or(0);

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut indices = Vec::with_capacity(target * NUM_CLASSES);
            for members in by_class.iter().filter(|m| !m.is_empty()) {
                indices.extend_from_slice(members);
                for _ in members.len()..target {
                    indices.push(members[rng.gen_range(0..members.len())]);
                }
            }
            indices.shuffle(&mut rng);

            info!(
                before = dataset.n_samples,
                after = indices.len(),
                "Oversampled minority classes"
            );
            let resampled = dataset.select(&indices);
            let n = resampled.n_samples;
            resampled.with_weights(Array1::ones(n))
        }
    }
}

/// Outcome of a training run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub manifest: ArtifactManifest,
    pub n_train: usize,
    pub n_test: usize,
    pub dropped_rows: usize,
    pub train_class_counts: [usize; NUM_CLASSES],
    pub ensemble_metrics: ModelMetrics,
    pub sequence_metrics: Option<ModelMetrics>,
    pub elapsed_secs: f64,
}

impl std::fmt::Display for TrainingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "artifact set {} ({})", self.manifest.id, self.manifest.schema.fingerprint())?;
        writeln!(
            f,
            "train {} / test {} rows, {} dropped, train classes {:?}",
            self.n_train, self.n_test, self.dropped_rows, self.train_class_counts
        )?;
        writeln!(f, "\n=== {} ===", ModelType::GradientBoosting)?;
        writeln!(f, "{}", self.ensemble_metrics)?;
        if let Some(metrics) = &self.sequence_metrics {
            writeln!(f, "\n=== {} ===", ModelType::SequenceModel)?;
            writeln!(f, "{}", metrics)?;
        }
        write!(f, "\ncompleted in {:.1}s", self.elapsed_secs)
    }
}

/// Offline producer of the scaler, ensemble and optional sequence model
pub struct TrainingPipeline {
    config: TrainingConfig,
    schema: FeatureSchema,
}

impl TrainingPipeline {
    pub fn new(config: TrainingConfig, schema: FeatureSchema) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, schema })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Load the configured dataset and train
    pub fn run(&self, store: &ArtifactStore) -> Result<TrainingReport> {
        let result = HistoricalDataset::from_csv(&self.config.dataset_path)
            .and_then(|dataset| self.run_on(&dataset, store));
        self.record_outcome(&result);
        result
    }

    fn record_outcome(&self, result: &Result<TrainingReport>) {
        match result {
            Ok(report) => {
                TRAINING_RUNS_TOTAL.with_label_values(&["success"]).inc();
                MODEL_TEST_ACCURACY
                    .with_label_values(&[ModelType::GradientBoosting.label()])
                    .set(report.ensemble_metrics.accuracy);
                if let Some(m) = &report.sequence_metrics {
                    MODEL_TEST_ACCURACY
                        .with_label_values(&[ModelType::SequenceModel.label()])
                        .set(m.accuracy);
                }
            }
            Err(e) => {
                TRAINING_RUNS_TOTAL.with_label_values(&["failure"]).inc();
                metrics::record_error("training", e);
            }
        }
    }

    /// Train on an already-loaded dataset and persist the artifacts
    pub fn run_on(&self, dataset: &HistoricalDataset, store: &ArtifactStore) -> Result<TrainingReport> {
        let started = Instant::now();
        let config = &self.config;

        let (data, dropped_rows) = dataset.to_training_dataset(&self.schema)?;
        let (train, test) = data.stratified_split(config.test_size, config.seed)?;
        if train.n_samples == 0 {
            return Err(AppError::Validation("training split is empty".to_string()));
        }
        info!(
            train = train.n_samples,
            test = test.n_samples,
            dropped_rows,
            "Split dataset"
        );

        // Scaler sees the training split only
        let scaler = StandardScaler::fit(&train.features)?;
        let train_scaled = TrainingDataset::new(
            scaler.transform_matrix(&train.features)?,
            train.labels.clone(),
        )?;
        let test_scaled = TrainingDataset::new(
            scaler.transform_matrix(&test.features)?,
            test.labels.clone(),
        )?;

        let train_class_counts = train_scaled.class_counts();
        let train_scaled = rebalance(train_scaled, config.rebalance, config.seed)?;

        let (ensemble, fitted_sequence) = rayon::join(
            || GradientBoostedEnsemble::fit(&train_scaled, &config.ensemble, config.seed),
            || {
                config
                    .sequence
                    .enabled
                    .then(|| sequence::fit(&train_scaled, &config.sequence, config.seed))
            },
        );
        let ensemble = ensemble?;
        let fitted_sequence = fitted_sequence.transpose()?;

        let ensemble_metrics = evaluate_on(&ensemble, &test_scaled)?;
        info!(
            accuracy = ensemble_metrics.accuracy,
            macro_f1 = ensemble_metrics.f1_score,
            "Evaluated gradient-boosted ensemble"
        );

        let sequence_metrics = match &fitted_sequence {
            Some(fitted) => {
                let metrics = evaluate_on(&fitted.classifier, &test_scaled)?;
                info!(
                    accuracy = metrics.accuracy,
                    macro_f1 = metrics.f1_score,
                    epochs = fitted.epochs_run,
                    "Evaluated sequence model"
                );
                Some(metrics)
            }
            None => None,
        };
        if test_scaled.n_samples == 0 {
            warn!("Test split is empty; reported metrics are zero");
        }

        let mut models = vec![self.ensemble_metadata(&train_scaled, &ensemble_metrics)];
        if let (Some(fitted), Some(metrics)) = (&fitted_sequence, &sequence_metrics) {
            models.push(self.sequence_metadata(&train_scaled, fitted, metrics));
        }

        let manifest = store.save(ArtifactSet {
            schema: &self.schema,
            scaler: &scaler,
            ensemble: &ensemble,
            sequence: fitted_sequence.as_ref(),
            training_means: scaler.mean().to_vec(),
            models,
        })?;

        Ok(TrainingReport {
            manifest,
            n_train: train.n_samples,
            n_test: test.n_samples,
            dropped_rows,
            train_class_counts,
            ensemble_metrics,
            sequence_metrics,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn ensemble_metadata(&self, train: &TrainingDataset, metrics: &ModelMetrics) -> ModelMetadata {
        let p = &self.config.ensemble;
        let hyperparameters = BTreeMap::from([
            ("n_estimators".to_string(), p.n_estimators.to_string()),
            ("max_depth".to_string(), p.max_depth.to_string()),
            ("learning_rate".to_string(), p.learning_rate.to_string()),
            ("subsample".to_string(), p.subsample.to_string()),
            ("colsample_bytree".to_string(), p.colsample_bytree.to_string()),
            ("lambda".to_string(), p.lambda.to_string()),
            ("min_child_weight".to_string(), p.min_child_weight.to_string()),
            ("max_bins".to_string(), p.max_bins.to_string()),
            ("objective".to_string(), format!("{:?}", p.objective)),
            ("rebalance".to_string(), self.config.rebalance.to_string()),
            ("seed".to_string(), self.config.seed.to_string()),
        ]);

        ModelMetadata {
            name: "gbt_depth_class".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_type: ModelType::GradientBoosting,
            trained_at: chrono::Utc::now(),
            n_training_samples: train.n_samples,
            n_features: train.n_features,
            test_metrics: metrics.clone(),
            hyperparameters,
        }
    }

    fn sequence_metadata(
        &self,
        train: &TrainingDataset,
        fitted: &FittedSequenceModel,
        metrics: &ModelMetrics,
    ) -> ModelMetadata {
        let p = &self.config.sequence;
        let hyperparameters = BTreeMap::from([
            ("layout".to_string(), p.layout.to_string()),
            ("lstm1_units".to_string(), p.lstm1_units.to_string()),
            ("lstm2_units".to_string(), p.lstm2_units.to_string()),
            ("dense_units".to_string(), p.dense_units.to_string()),
            ("dropout".to_string(), p.dropout.to_string()),
            ("batch_size".to_string(), p.batch_size.to_string()),
            ("learning_rate".to_string(), p.learning_rate.to_string()),
            ("epochs_run".to_string(), fitted.epochs_run.to_string()),
            ("best_val_loss".to_string(), format!("{:.6}", fitted.best_val_loss)),
            ("rebalance".to_string(), self.config.rebalance.to_string()),
        ]);

        ModelMetadata {
            name: "lstm_depth_class".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            model_type: ModelType::SequenceModel,
            trained_at: chrono::Utc::now(),
            n_training_samples: train.n_samples,
            n_features: train.n_features,
            test_metrics: metrics.clone(),
            hyperparameters,
        }
    }
}

fn evaluate_on(model: &dyn DepthClassifier, test: &TrainingDataset) -> Result<ModelMetrics> {
    let predicted: Vec<DepthClass> = model
        .classify_batch(&test.features)?
        .into_iter()
        .map(|o| o.class)
        .collect();
    evaluate(&test.labels, &predicted)
}
