//! Depth-class inference and training.
//!
//! Inference runs raw inputs through three stages:
//! - `FeatureAssembler`: schema-ordered vector with defaults substituted
//! - `StandardScaler`: per-feature standardization fitted at training time
//! - classifiers: gradient-boosted trees (required) and an LSTM (optional)
//!
//! `TrainingPipeline` produces the artifacts that `InferenceContext` loads.

pub mod artifacts;
pub mod classifier;
pub mod dataset;
pub mod ensemble;
pub mod features;
pub mod models;
pub mod scaler;
pub mod sequence;
pub mod service;
pub mod training;

pub use artifacts::{ArtifactManifest, ArtifactSet, ArtifactStore};
pub use classifier::{
    evaluate, ClassProbabilities, ClassifierOutput, DepthClassifier, ProbabilityCapability,
};
pub use dataset::{DatasetSummary, HistoricalDataset};
pub use ensemble::{GradientBoostedEnsemble, RegressionTree, TreeNode};
pub use features::{FeatureAssembler, FeatureDefaults, FeatureVector, RawInputs};
pub use models::{
    ClassMetrics, DepthClass, EnsembleParams, FeatureSchema, ModelMetadata, ModelMetrics,
    ModelType, Objective, RebalanceStrategy, SeismicFeature, SequenceLayout, SequenceParams,
    TrainingConfig, TrainingDataset, NUM_CLASSES,
};
pub use scaler::StandardScaler;
pub use sequence::{FittedSequenceModel, SequenceArchitecture, SequenceClassifier};
pub use service::{DepthPrediction, InferenceContext, SequenceOutcome, SequenceSlot};
pub use training::{balanced_class_weights, TrainingPipeline, TrainingReport};
