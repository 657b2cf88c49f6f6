use crate::config::ArtifactConfig;
use crate::error::{AppError, Result};
use crate::metrics::{self, PREDICTIONS_TOTAL, PREDICTION_DURATION_SECONDS, SEQUENCE_MODEL_UNAVAILABLE_TOTAL};
use crate::ml::artifacts::{ArtifactManifest, ArtifactStore};
use crate::ml::classifier::{ClassifierOutput, DepthClassifier};
use crate::ml::features::{FeatureAssembler, FeatureDefaults, FeatureVector, RawInputs};
use crate::ml::models::FeatureSchema;
use crate::ml::scaler::StandardScaler;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// State of the optional secondary model
#[derive(Clone)]
pub enum SequenceSlot {
    Loaded(Arc<dyn DepthClassifier>),
    Unavailable(String),
}

/// Secondary-model part of a prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SequenceOutcome {
    Predicted { output: ClassifierOutput },
    Unavailable { reason: String },
}

impl SequenceOutcome {
    pub fn output(&self) -> Option<&ClassifierOutput> {
        match self {
            SequenceOutcome::Predicted { output } => Some(output),
            SequenceOutcome::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.output().is_some()
    }
}

/// Result of one `predict` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepthPrediction {
    /// Fingerprint of the schema the inputs were assembled for
    pub schema: String,
    /// Tree-ensemble result (always present)
    pub primary: ClassifierOutput,
    pub sequence: SequenceOutcome,
}

/// Immutable inference state: schema, scaler and classifiers.
///
/// Built once and shared across threads behind an `Arc`; `predict` takes
/// `&self` and never mutates anything.
pub struct InferenceContext {
    schema: FeatureSchema,
    assembler: FeatureAssembler,
    scaler: Arc<StandardScaler>,
    ensemble: Arc<dyn DepthClassifier>,
    sequence: SequenceSlot,
    manifest: Option<ArtifactManifest>,
}

impl InferenceContext {
    /// Wire a context from already-loaded parts
    pub fn new(
        schema: FeatureSchema,
        defaults: FeatureDefaults,
        scaler: Arc<StandardScaler>,
        ensemble: Arc<dyn DepthClassifier>,
    ) -> Result<Self> {
        if scaler.n_features() != schema.len() {
            return Err(AppError::SchemaMismatch {
                expected: schema.fingerprint(),
                actual: format!("scaler fitted on {} features", scaler.n_features()),
            });
        }
        if ensemble.n_features() != scaler.n_features() {
            return Err(AppError::DimensionMismatch {
                expected: scaler.n_features(),
                actual: ensemble.n_features(),
            });
        }

        let assembler = FeatureAssembler::new(schema.clone(), defaults)
            .with_expected_dim(scaler.n_features());

        Ok(Self {
            schema,
            assembler,
            scaler,
            ensemble,
            sequence: SequenceSlot::Unavailable("no sequence model configured".to_string()),
            manifest: None,
        })
    }

    /// Attach the secondary model
    pub fn with_sequence_model(mut self, model: Arc<dyn DepthClassifier>) -> Result<Self> {
        if model.n_features() != self.scaler.n_features() {
            return Err(AppError::DimensionMismatch {
                expected: self.scaler.n_features(),
                actual: model.n_features(),
            });
        }
        self.sequence = SequenceSlot::Loaded(model);
        Ok(self)
    }

    /// Mark the secondary model as unavailable with a reason
    pub fn with_sequence_unavailable(mut self, reason: impl Into<String>) -> Self {
        self.sequence = SequenceSlot::Unavailable(reason.into());
        self
    }

    /// Load from the configured artifact directory
    pub fn load(config: &ArtifactConfig) -> Result<Self> {
        Self::from_store(&ArtifactStore::new(&config.dir), config.load_sequence_model)
    }

    /// Load the manifest, scaler and ensemble (all required) and, when asked,
    /// the sequence model. A sequence model that fails to load leaves the
    /// context usable with the slot marked unavailable.
    pub fn from_store(store: &ArtifactStore, load_sequence: bool) -> Result<Self> {
        let manifest = store.load_manifest()?;
        let scaler = store.load_scaler(&manifest)?;
        let ensemble = store.load_ensemble(&manifest)?;

        let defaults = FeatureDefaults::from_means(&manifest.schema, &manifest.training_means)?;

        let context = Self::new(
            manifest.schema.clone(),
            defaults,
            Arc::new(scaler),
            Arc::new(ensemble),
        )?;

        let context = if !load_sequence {
            context.with_sequence_unavailable("sequence model disabled by configuration")
        } else if !manifest.has_sequence_model() {
            context.with_sequence_unavailable("artifact set has no sequence model")
        } else {
            match store.load_sequence(&manifest) {
                Ok(model) => context.with_sequence_model(Arc::new(model))?,
                Err(e) => {
                    let e = AppError::SequenceModelUnavailable(e.to_string());
                    warn!(error = %e, "Continuing with tree ensemble only");
                    metrics::record_error("artifacts", &e);
                    context.with_sequence_unavailable(e.to_string())
                }
            }
        };

        info!(
            dir = %store.dir().display(),
            schema = %manifest.schema.fingerprint(),
            artifact_set = %manifest.id,
            sequence_model = context.sequence_available(),
            "Inference context ready"
        );

        Ok(Self {
            manifest: Some(manifest),
            ..context
        })
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn manifest(&self) -> Option<&ArtifactManifest> {
        self.manifest.as_ref()
    }

    pub fn scaler(&self) -> &StandardScaler {
        &self.scaler
    }

    pub fn assembler(&self) -> &FeatureAssembler {
        &self.assembler
    }

    pub fn sequence_available(&self) -> bool {
        matches!(self.sequence, SequenceSlot::Loaded(_))
    }

    /// Assemble, scale and classify one set of raw inputs
    pub fn predict(&self, raw: &RawInputs) -> Result<DepthPrediction> {
        let result = self
            .assembler
            .assemble(raw)
            .and_then(|vector| self.predict_vector(&vector));
        if let Err(e) = &result {
            metrics::record_error("inference", e);
        }
        result
    }

    /// Scale and classify a vector assembled for this context's schema
    pub fn predict_vector(&self, vector: &FeatureVector) -> Result<DepthPrediction> {
        let started = Instant::now();

        let fingerprint = self.schema.fingerprint();
        if vector.schema_fingerprint() != fingerprint {
            return Err(AppError::SchemaMismatch {
                expected: fingerprint,
                actual: vector.schema_fingerprint().to_string(),
            });
        }

        let scaled = self.scaler.transform(vector.values().view())?;
        let primary = self.ensemble.classify(scaled.view())?;

        let primary_model = self.ensemble.model_type().label();
        PREDICTIONS_TOTAL
            .with_label_values(&[primary_model, primary.class.short_name()])
            .inc();
        PREDICTION_DURATION_SECONDS
            .with_label_values(&[primary_model])
            .observe(started.elapsed().as_secs_f64());

        let sequence = match &self.sequence {
            SequenceSlot::Loaded(model) => match model.classify(scaled.view()) {
                Ok(output) => {
                    PREDICTIONS_TOTAL
                        .with_label_values(&[model.model_type().label(), output.class.short_name()])
                        .inc();
                    SequenceOutcome::Predicted { output }
                }
                Err(e) => {
                    let e = AppError::SequenceModelUnavailable(e.to_string());
                    warn!(error = %e, "Sequence model failed, returning ensemble result only");
                    metrics::record_error("inference", &e);
                    SEQUENCE_MODEL_UNAVAILABLE_TOTAL.inc();
                    SequenceOutcome::Unavailable {
                        reason: e.to_string(),
                    }
                }
            },
            SequenceSlot::Unavailable(reason) => {
                SEQUENCE_MODEL_UNAVAILABLE_TOTAL.inc();
                SequenceOutcome::Unavailable {
                    reason: reason.clone(),
                }
            }
        };

        debug!(
            class = %primary.class,
            sequence_available = sequence.is_available(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Prediction complete"
        );

        Ok(DepthPrediction {
            schema: fingerprint,
            primary,
            sequence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::classifier::{ClassProbabilities, ProbabilityCapability};
    use crate::ml::models::{DepthClass, ModelType, SeismicFeature};
    use ndarray::{Array1, ArrayView1};

    /// Scores each class by a fixed linear map of the scaled vector
    struct LinearFake {
        weights: [[f64; 10]; 3],
        capability: ProbabilityCapability,
        model_type: ModelType,
    }

    impl DepthClassifier for LinearFake {
        fn classify(&self, scaled: ArrayView1<f64>) -> Result<ClassifierOutput> {
            let logits: Vec<f64> = self
                .weights
                .iter()
                .map(|w| Array1::from(w.to_vec()).dot(&scaled))
                .collect();
            let probs = ClassProbabilities::from_logits(&logits)?;
            match self.capability {
                ProbabilityCapability::Probabilities => ClassifierOutput::from_probabilities(probs),
                ProbabilityCapability::LabelOnly => Ok(ClassifierOutput::label_only(probs.argmax()?)),
            }
        }

        fn capability(&self) -> ProbabilityCapability {
            self.capability
        }

        fn model_type(&self) -> ModelType {
            self.model_type
        }

        fn n_features(&self) -> usize {
            10
        }
    }

    struct FailingModel;

    impl DepthClassifier for FailingModel {
        fn classify(&self, _scaled: ArrayView1<f64>) -> Result<ClassifierOutput> {
            Err(AppError::Model("forward pass failed".to_string()))
        }

        fn capability(&self) -> ProbabilityCapability {
            ProbabilityCapability::Probabilities
        }

        fn model_type(&self) -> ModelType {
            ModelType::SequenceModel
        }

        fn n_features(&self) -> usize {
            10
        }
    }

    fn fake(capability: ProbabilityCapability, model_type: ModelType) -> Arc<dyn DepthClassifier> {
        let mut weights = [[0.0; 10]; 3];
        weights[0][0] = -1.0; // year pulls towards shallow when low
        weights[2][0] = 1.0;
        weights[1][3] = 2.0; // magnitude
        Arc::new(LinearFake {
            weights,
            capability,
            model_type,
        })
    }

    fn scaler() -> Arc<StandardScaler> {
        Arc::new(
            StandardScaler::from_parts(
                vec![2021.0, 0.0, 120.0, 5.0, 90.0, 1.0, 0.9, 6.0, 5.0, 0.1],
                vec![2.0, 5.0, 10.0, 1.0, 50.0, 2.0, 0.3, 3.0, 3.0, 0.05],
            )
            .unwrap(),
        )
    }

    fn context() -> InferenceContext {
        InferenceContext::new(
            FeatureSchema::canonical(),
            FeatureDefaults::None,
            scaler(),
            fake(ProbabilityCapability::Probabilities, ModelType::GradientBoosting),
        )
        .unwrap()
    }

    fn inputs() -> RawInputs {
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

    #[test]
    fn test_context_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InferenceContext>();
    }

    #[test]
    fn test_predict_without_sequence_model() {
        let prediction = context().predict(&inputs()).unwrap();

        // scaled year = +1.0, magnitude = 0.0 → deep wins
        assert_eq!(prediction.primary.class, DepthClass::Deep);
        let probs = prediction.primary.probabilities.unwrap();
        assert!((probs.as_array().iter().sum::<f64>() - 1.0).abs() < 1e-6);
        assert!(!prediction.sequence.is_available());
    }

    #[test]
    fn test_sequence_model_result_attached() {
        let context = context()
            .with_sequence_model(fake(ProbabilityCapability::Probabilities, ModelType::SequenceModel))
            .unwrap();
        let prediction = context.predict(&inputs()).unwrap();
        assert_eq!(prediction.sequence.output().unwrap().class, DepthClass::Deep);
    }

    #[test]
    fn test_failing_sequence_model_degrades() {
        let context = context().with_sequence_model(Arc::new(FailingModel)).unwrap();
        let prediction = context.predict(&inputs()).unwrap();

        assert_eq!(prediction.primary.class, DepthClass::Deep);
        match prediction.sequence {
            SequenceOutcome::Unavailable { reason } => assert!(reason.contains("forward pass failed")),
            other => panic!("expected Unavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_label_only_capability() {
        let context = InferenceContext::new(
            FeatureSchema::canonical(),
            FeatureDefaults::None,
            scaler(),
            fake(ProbabilityCapability::LabelOnly, ModelType::GradientBoosting),
        )
        .unwrap();
        let prediction = context.predict(&inputs()).unwrap();
        assert!(prediction.primary.probabilities.is_none());
    }

    #[test]
    fn test_foreign_schema_vector_rejected() {
        use SeismicFeature::*;
        let other = FeatureSchema::new(
            "depth-input",
            1,
            vec![Year, Latitude, Longitude, Depth, Gap, Dmin, Rms, HorizontalError, DepthError, MagError],
        )
        .unwrap();
        let vector = FeatureVector::new(&other, Array1::zeros(10));

        assert!(matches!(
            context().predict_vector(&vector),
            Err(AppError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_mismatched_parts_rejected() {
        let nine = Arc::new(StandardScaler::from_parts(vec![0.0; 9], vec![1.0; 9]).unwrap());
        let result = InferenceContext::new(
            FeatureSchema::canonical(),
            FeatureDefaults::None,
            nine,
            fake(ProbabilityCapability::Probabilities, ModelType::GradientBoosting),
        );
        assert!(matches!(result, Err(AppError::SchemaMismatch { .. })));
    }

    #[test]
    fn test_missing_input_without_defaults() {
        let mut raw = RawInputs::new();
        raw.set(SeismicFeature::Year, 2020.0);
        assert!(matches!(
            context().predict(&raw),
            Err(AppError::SchemaMismatch { .. })
        ));
    }
}
