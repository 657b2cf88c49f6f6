use crate::error::{AppError, Result};
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use strum::{EnumIter, EnumString, IntoEnumIterator};
use validator::Validate;

/// Number of depth classes
pub const NUM_CLASSES: usize = 3;

/// Upper bound (exclusive) of the shallow bucket, in km
pub const SHALLOW_MAX_KM: f64 = 70.0;

/// Upper bound (exclusive) of the intermediate bucket, in km
pub const INTERMEDIATE_MAX_KM: f64 = 300.0;

/// Earthquake hypocenter depth category
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum DepthClass {
    /// Shallow (< 70 km)
    #[strum(serialize = "Shallow (<70 km)")]
    Shallow,

    /// Intermediate (70-300 km)
    #[strum(serialize = "Intermediate (70-300 km)")]
    Intermediate,

    /// Deep (> 300 km)
    #[strum(serialize = "Deep (>300 km)")]
    Deep,
}

impl DepthClass {
    /// Class index used by the classifiers (0, 1, 2)
    pub fn index(self) -> usize {
        match self {
            DepthClass::Shallow => 0,
            DepthClass::Intermediate => 1,
            DepthClass::Deep => 2,
        }
    }

    /// Convert a class index back to a class
    pub fn from_index(index: usize) -> Result<Self> {
        match index {
            0 => Ok(DepthClass::Shallow),
            1 => Ok(DepthClass::Intermediate),
            2 => Ok(DepthClass::Deep),
            other => Err(AppError::LabelDerivationError(format!(
                "class index {} is outside 0..={}",
                other,
                NUM_CLASSES - 1
            ))),
        }
    }

    /// Bucket a depth in km. Bins are left-closed: exactly 70 km is
    /// intermediate and exactly 300 km is deep.
    pub fn from_depth_km(depth_km: f64) -> Result<Self> {
        if !depth_km.is_finite() {
            return Err(AppError::LabelDerivationError(format!(
                "depth {} is not a finite number",
                depth_km
            )));
        }

        Ok(if depth_km < SHALLOW_MAX_KM {
            DepthClass::Shallow
        } else if depth_km < INTERMEDIATE_MAX_KM {
            DepthClass::Intermediate
        } else {
            DepthClass::Deep
        })
    }

    /// Short name without the depth range
    pub fn short_name(self) -> &'static str {
        match self {
            DepthClass::Shallow => "shallow",
            DepthClass::Intermediate => "intermediate",
            DepthClass::Deep => "deep",
        }
    }
}

/// Seismic attributes a feature schema may reference
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    strum_macros::Display,
    strum_macros::AsRefStr,
)]
pub enum SeismicFeature {
    #[strum(serialize = "year")]
    #[serde(rename = "year")]
    Year,

    #[strum(serialize = "latitude")]
    #[serde(rename = "latitude")]
    Latitude,

    #[strum(serialize = "longitude")]
    #[serde(rename = "longitude")]
    Longitude,

    #[strum(to_string = "mag", serialize = "magnitude")]
    #[serde(rename = "mag", alias = "magnitude")]
    Magnitude,

    #[strum(serialize = "gap")]
    #[serde(rename = "gap")]
    Gap,

    #[strum(serialize = "dmin")]
    #[serde(rename = "dmin")]
    Dmin,

    #[strum(serialize = "rms")]
    #[serde(rename = "rms")]
    Rms,

    #[strum(serialize = "horizontalError")]
    #[serde(rename = "horizontalError")]
    HorizontalError,

    #[strum(serialize = "depthError")]
    #[serde(rename = "depthError")]
    DepthError,

    #[strum(serialize = "magError")]
    #[serde(rename = "magError")]
    MagError,

    /// Only used by schemas that take depth as an input
    #[strum(serialize = "depth")]
    #[serde(rename = "depth")]
    Depth,
}

impl SeismicFeature {
    /// Parse a user-facing feature name
    pub fn parse(name: &str) -> Result<Self> {
        name.trim().parse::<SeismicFeature>().map_err(|_| {
            let known: Vec<String> = SeismicFeature::iter().map(|f| f.to_string()).collect();
            AppError::Validation(format!(
                "unknown feature '{}' (known: {})",
                name,
                known.join(", ")
            ))
        })
    }

    /// Dataset column name
    pub fn column_name(self) -> &'static str {
        match self {
            SeismicFeature::Year => "year",
            SeismicFeature::Latitude => "latitude",
            SeismicFeature::Longitude => "longitude",
            SeismicFeature::Magnitude => "mag",
            SeismicFeature::Gap => "gap",
            SeismicFeature::Dmin => "dmin",
            SeismicFeature::Rms => "rms",
            SeismicFeature::HorizontalError => "horizontalError",
            SeismicFeature::DepthError => "depthError",
            SeismicFeature::MagError => "magError",
            SeismicFeature::Depth => "depth",
        }
    }
}

/// Versioned, ordered feature schema bound to a scaler/classifier pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    /// Schema name
    pub name: String,

    /// Schema version
    pub version: u32,

    /// Ordered features
    pub features: Vec<SeismicFeature>,
}

impl FeatureSchema {
    pub const CANONICAL_NAME: &'static str = "depth-class";

    /// Create a schema, rejecting empty or duplicated feature lists
    pub fn new(name: impl Into<String>, version: u32, features: Vec<SeismicFeature>) -> Result<Self> {
        if features.is_empty() {
            return Err(AppError::Validation(
                "feature schema must contain at least one feature".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for feature in &features {
            if !seen.insert(*feature) {
                return Err(AppError::Validation(format!(
                    "feature '{}' appears more than once in schema",
                    feature
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            version,
            features,
        })
    }

    /// The 10-feature schema used by the depth classifier
    pub fn canonical() -> Self {
        use SeismicFeature::*;
        Self {
            name: Self::CANONICAL_NAME.to_string(),
            version: 1,
            features: vec![
                Year,
                Latitude,
                Longitude,
                Magnitude,
                Gap,
                Dmin,
                Rms,
                HorizontalError,
                DepthError,
                MagError,
            ],
        }
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Position of a feature in the schema
    pub fn index_of(&self, feature: SeismicFeature) -> Option<usize> {
        self.features.iter().position(|f| *f == feature)
    }

    /// Dataset column names in schema order
    pub fn column_names(&self) -> Vec<&'static str> {
        self.features.iter().map(|f| f.column_name()).collect()
    }

    /// Stable identity used to bind vectors and artifacts to this schema
    pub fn fingerprint(&self) -> String {
        format!(
            "{}@v{}:{}",
            self.name,
            self.version,
            self.column_names().join(",")
        )
    }
}

impl Default for FeatureSchema {
    fn default() -> Self {
        Self::canonical()
    }
}

/// Class-imbalance handling applied to the training split
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, EnumString, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RebalanceStrategy {
    /// Randomly oversample minority classes up to the majority count
    Resample,

    /// Weight samples inversely to class frequency
    #[default]
    ClassWeight,

    /// Leave the class distribution as is
    None,
}

/// Whether a boosted ensemble exposes class probabilities
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    /// Multi-class softmax returning labels only
    Softmax,

    /// Multi-class softmax returning the probability vector
    #[default]
    SoftProb,
}

/// How a feature vector is laid out as a sequence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, EnumString, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SequenceLayout {
    /// One time step carrying all N features
    #[default]
    SingleStep,

    /// N time steps of one feature each
    PerFeature,
}

/// Gradient-boosted ensemble hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct EnsembleParams {
    /// Boosting rounds
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_n_estimators")]
    pub n_estimators: usize,

    /// Maximum tree depth
    #[validate(range(min = 1, max = 16))]
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Shrinkage applied to every tree
    #[validate(range(min = 0.0001, max = 1.0))]
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Row subsampling ratio per round
    #[validate(range(min = 0.01, max = 1.0))]
    #[serde(default = "default_subsample")]
    pub subsample: f64,

    /// Column subsampling ratio per tree
    #[validate(range(min = 0.01, max = 1.0))]
    #[serde(default = "default_subsample")]
    pub colsample_bytree: f64,

    /// L2 regularization on leaf values
    #[validate(range(min = 0.0))]
    #[serde(default = "default_lambda")]
    pub lambda: f64,

    /// Minimum hessian sum per child
    #[validate(range(min = 0.0))]
    #[serde(default = "default_min_child_weight")]
    pub min_child_weight: f64,

    /// Minimum loss reduction to split
    #[validate(range(min = 0.0))]
    #[serde(default)]
    pub gamma: f64,

    /// Histogram bins per feature
    #[validate(range(min = 2, max = 4096))]
    #[serde(default = "default_max_bins")]
    pub max_bins: usize,

    /// Output capability of the fitted ensemble
    #[serde(default)]
    pub objective: Objective,
}

impl Default for EnsembleParams {
    fn default() -> Self {
        Self {
            n_estimators: default_n_estimators(),
            max_depth: default_max_depth(),
            learning_rate: default_learning_rate(),
            subsample: default_subsample(),
            colsample_bytree: default_subsample(),
            lambda: default_lambda(),
            min_child_weight: default_min_child_weight(),
            gamma: 0.0,
            max_bins: default_max_bins(),
            objective: Objective::SoftProb,
        }
    }
}

/// Recurrent sequence model hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct SequenceParams {
    /// Train the sequence model at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Input layout
    #[serde(default)]
    pub layout: SequenceLayout,

    /// Units of the first (sequence-returning) LSTM layer
    #[validate(range(min = 1, max = 4096))]
    #[serde(default = "default_lstm1_units")]
    pub lstm1_units: usize,

    /// Units of the second LSTM layer
    #[validate(range(min = 1, max = 4096))]
    #[serde(default = "default_lstm2_units")]
    pub lstm2_units: usize,

    /// Units of the dense ReLU layer
    #[validate(range(min = 1, max = 4096))]
    #[serde(default = "default_dense_units")]
    pub dense_units: usize,

    /// Dropout after each LSTM layer
    #[validate(range(min = 0.0, max = 0.95))]
    #[serde(default = "default_dropout")]
    pub dropout: f32,

    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[validate(range(min = 1, max = 65536))]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[validate(range(min = 0.000001, max = 1.0))]
    #[serde(default = "default_sequence_learning_rate")]
    pub learning_rate: f64,

    /// Epochs without validation improvement before stopping
    #[validate(range(min = 1))]
    #[serde(default = "default_patience")]
    pub patience: usize,

    /// Fraction of the training split held out for early stopping
    #[validate(range(min = 0.0, max = 0.5))]
    #[serde(default = "default_validation_split")]
    pub validation_split: f64,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            enabled: true,
            layout: SequenceLayout::SingleStep,
            lstm1_units: default_lstm1_units(),
            lstm2_units: default_lstm2_units(),
            dense_units: default_dense_units(),
            dropout: default_dropout(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            learning_rate: default_sequence_learning_rate(),
            patience: default_patience(),
            validation_split: default_validation_split(),
        }
    }
}

/// Training pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TrainingConfig {
    /// Historical dataset (CSV)
    #[serde(default = "default_dataset_path")]
    pub dataset_path: std::path::PathBuf,

    /// Held-out test fraction
    #[validate(range(min = 0.05, max = 0.5))]
    #[serde(default = "default_test_size")]
    pub test_size: f64,

    /// Seed for splitting, resampling and subsampling
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Class-imbalance strategy
    #[serde(default)]
    pub rebalance: RebalanceStrategy,

    #[validate(nested)]
    #[serde(default)]
    pub ensemble: EnsembleParams,

    #[validate(nested)]
    #[serde(default)]
    pub sequence: SequenceParams,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            dataset_path: default_dataset_path(),
            test_size: default_test_size(),
            seed: default_seed(),
            rebalance: RebalanceStrategy::ClassWeight,
            ensemble: EnsembleParams::default(),
            sequence: SequenceParams::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_n_estimators() -> usize {
    300
}

fn default_max_depth() -> usize {
    5
}

fn default_learning_rate() -> f64 {
    0.05
}

fn default_subsample() -> f64 {
    0.8
}

fn default_lambda() -> f64 {
    1.0
}

fn default_min_child_weight() -> f64 {
    1.0
}

fn default_max_bins() -> usize {
    256
}

fn default_lstm1_units() -> usize {
    64
}

fn default_lstm2_units() -> usize {
    32
}

fn default_dense_units() -> usize {
    32
}

fn default_dropout() -> f32 {
    0.3
}

fn default_epochs() -> usize {
    40
}

fn default_batch_size() -> usize {
    64
}

fn default_sequence_learning_rate() -> f64 {
    0.001
}

fn default_patience() -> usize {
    5
}

fn default_validation_split() -> f64 {
    0.2
}

fn default_dataset_path() -> std::path::PathBuf {
    "gempabumi-fiks.csv".into()
}

fn default_test_size() -> f64 {
    0.2
}

fn default_seed() -> u64 {
    42
}

/// Labelled training data (n_samples × n_features) with per-sample weights
#[derive(Debug, Clone)]
pub struct TrainingDataset {
    /// Feature matrix
    pub features: Array2<f64>,

    /// Depth class labels
    pub labels: Vec<DepthClass>,

    /// Sample weights
    pub weights: Array1<f64>,

    /// Number of samples
    pub n_samples: usize,

    /// Number of features
    pub n_features: usize,
}

impl TrainingDataset {
    /// Create a dataset with unit weights
    pub fn new(features: Array2<f64>, labels: Vec<DepthClass>) -> Result<Self> {
        let n_samples = features.nrows();
        if labels.len() != n_samples {
            return Err(AppError::Validation(format!(
                "{} labels for {} feature rows",
                labels.len(),
                n_samples
            )));
        }

        Ok(Self {
            n_features: features.ncols(),
            weights: Array1::ones(n_samples),
            features,
            labels,
            n_samples,
        })
    }

    /// Replace the sample weights
    pub fn with_weights(mut self, weights: Array1<f64>) -> Result<Self> {
        if weights.len() != self.n_samples {
            return Err(AppError::Validation(format!(
                "{} weights for {} samples",
                weights.len(),
                self.n_samples
            )));
        }
        self.weights = weights;
        Ok(self)
    }

    /// Rows at the given indices, in that order
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            features: self.features.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            weights: indices.iter().map(|&i| self.weights[i]).collect(),
            n_samples: indices.len(),
            n_features: self.n_features,
        }
    }

    /// Samples per class, indexed by class index
    pub fn class_counts(&self) -> [usize; NUM_CLASSES] {
        let mut counts = [0usize; NUM_CLASSES];
        for label in &self.labels {
            counts[label.index()] += 1;
        }
        counts
    }

    /// Seeded split preserving class proportions in both halves.
    ///
    /// Each class contributes `round(count * test_size)` rows to the test
    /// split; both halves are shuffled afterwards.
    pub fn stratified_split(&self, test_size: f64, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&test_size) {
            return Err(AppError::Validation(format!(
                "test_size {} must be in [0, 1)",
                test_size
            )));
        }

        let mut by_class: Vec<Vec<usize>> = vec![Vec::new(); NUM_CLASSES];
        for (i, label) in self.labels.iter().enumerate() {
            by_class[label.index()].push(i);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut train_indices = Vec::with_capacity(self.n_samples);
        let mut test_indices = Vec::new();

        for (class_idx, indices) in by_class.iter_mut().enumerate() {
            if indices.is_empty() {
                continue;
            }
            if test_size > 0.0 && indices.len() < 2 {
                return Err(AppError::Validation(format!(
                    "class {} has {} sample(s); a stratified split needs at least 2",
                    class_idx,
                    indices.len()
                )));
            }

            indices.shuffle(&mut rng);
            let n_test = ((indices.len() as f64 * test_size).round() as usize)
                .min(indices.len() - 1);
            test_indices.extend_from_slice(&indices[..n_test]);
            train_indices.extend_from_slice(&indices[n_test..]);
        }

        train_indices.shuffle(&mut rng);
        test_indices.shuffle(&mut rng);

        Ok((self.select(&train_indices), self.select(&test_indices)))
    }
}

/// Model evaluation metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetrics {
    /// Accuracy
    pub accuracy: f64,

    /// Macro-averaged precision
    pub precision: f64,

    /// Macro-averaged recall
    pub recall: f64,

    /// Macro-averaged F1 score
    pub f1_score: f64,

    /// Confusion matrix (rows = true class, columns = predicted class)
    pub confusion_matrix: Option<Array2<usize>>,

    /// Per-class metrics keyed by class short name
    pub per_class_metrics: BTreeMap<String, ClassMetrics>,
}

/// Per-class evaluation metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub support: usize,
}

impl ModelMetrics {
    pub fn new() -> Self {
        Self {
            accuracy: 0.0,
            precision: 0.0,
            recall: 0.0,
            f1_score: 0.0,
            confusion_matrix: None,
            per_class_metrics: BTreeMap::new(),
        }
    }
}

impl Default for ModelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ModelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "accuracy: {:.4}", self.accuracy)?;
        writeln!(
            f,
            "{:<14} {:>10} {:>10} {:>10} {:>8}",
            "class", "precision", "recall", "f1-score", "support"
        )?;
        for class in DepthClass::iter() {
            if let Some(m) = self.per_class_metrics.get(class.short_name()) {
                writeln!(
                    f,
                    "{:<14} {:>10.4} {:>10.4} {:>10.4} {:>8}",
                    class.short_name(),
                    m.precision,
                    m.recall,
                    m.f1_score,
                    m.support
                )?;
            }
        }
        write!(
            f,
            "{:<14} {:>10.4} {:>10.4} {:>10.4}",
            "macro avg", self.precision, self.recall, self.f1_score
        )
    }
}

/// Model metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Model name
    pub name: String,

    /// Model version
    pub version: String,

    /// Model type
    pub model_type: ModelType,

    /// Training timestamp
    pub trained_at: chrono::DateTime<chrono::Utc>,

    /// Number of training samples
    pub n_training_samples: usize,

    /// Number of features
    pub n_features: usize,

    /// Held-out test metrics
    pub test_metrics: ModelMetrics,

    /// Hyperparameters
    pub hyperparameters: BTreeMap<String, String>,
}

/// Model type enumeration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    /// Gradient-boosted decision trees
    GradientBoosting,

    /// Stacked LSTM sequence classifier
    SequenceModel,
}

impl ModelType {
    /// Short label used in metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            ModelType::GradientBoosting => "gradient_boosting",
            ModelType::SequenceModel => "sequence_model",
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelType::GradientBoosting => write!(f, "Gradient Boosting"),
            ModelType::SequenceModel => write!(f, "LSTM Sequence Model"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_depth_class_thresholds() {
        assert_eq!(DepthClass::from_depth_km(50.0).unwrap(), DepthClass::Shallow);
        assert_eq!(DepthClass::from_depth_km(150.0).unwrap(), DepthClass::Intermediate);
        assert_eq!(DepthClass::from_depth_km(500.0).unwrap(), DepthClass::Deep);
        assert_eq!(DepthClass::from_depth_km(70.0).unwrap(), DepthClass::Intermediate);
        assert_eq!(DepthClass::from_depth_km(300.0).unwrap(), DepthClass::Deep);
        assert_eq!(DepthClass::from_depth_km(69.999).unwrap(), DepthClass::Shallow);
        assert_eq!(DepthClass::from_depth_km(-1.2).unwrap(), DepthClass::Shallow);
        assert!(DepthClass::from_depth_km(f64::NAN).is_err());
    }

    #[test]
    fn test_depth_class_index_roundtrip() {
        for class in DepthClass::iter() {
            assert_eq!(DepthClass::from_index(class.index()).unwrap(), class);
        }
        assert!(DepthClass::from_index(3).is_err());
        assert_eq!(DepthClass::Intermediate.to_string(), "Intermediate (70-300 km)");
    }

    #[test]
    fn test_feature_names() {
        assert_eq!(SeismicFeature::parse("mag").unwrap(), SeismicFeature::Magnitude);
        assert_eq!(SeismicFeature::parse("magnitude").unwrap(), SeismicFeature::Magnitude);
        assert_eq!(
            SeismicFeature::parse("horizontalError").unwrap(),
            SeismicFeature::HorizontalError
        );
        assert_eq!(SeismicFeature::Magnitude.to_string(), "mag");
        assert!(SeismicFeature::parse("tsunami").is_err());
    }

    #[test]
    fn test_canonical_schema() {
        let schema = FeatureSchema::canonical();
        assert_eq!(schema.len(), 10);
        assert_eq!(
            schema.column_names(),
            vec![
                "year",
                "latitude",
                "longitude",
                "mag",
                "gap",
                "dmin",
                "rms",
                "horizontalError",
                "depthError",
                "magError"
            ]
        );
        assert_eq!(
            schema.fingerprint(),
            "depth-class@v1:year,latitude,longitude,mag,gap,dmin,rms,horizontalError,depthError,magError"
        );
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        let result = FeatureSchema::new(
            "dup",
            1,
            vec![SeismicFeature::Year, SeismicFeature::Year],
        );
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_depth_variant_schema_differs() {
        use SeismicFeature::*;
        let variant = FeatureSchema::new(
            "depth-input",
            1,
            vec![Year, Latitude, Longitude, Depth, Gap, Dmin, Rms, HorizontalError, DepthError, MagError],
        )
        .unwrap();
        assert_eq!(variant.len(), FeatureSchema::canonical().len());
        assert_ne!(variant.fingerprint(), FeatureSchema::canonical().fingerprint());
    }

    #[test]
    fn test_stratified_split_preserves_ratio() {
        let labels: Vec<DepthClass> = (0..100)
            .map(|i| match i % 10 {
                0..=5 => DepthClass::Shallow,
                6..=8 => DepthClass::Intermediate,
                _ => DepthClass::Deep,
            })
            .collect();
        let features = Array2::from_shape_fn((100, 2), |(i, j)| (i * 2 + j) as f64);
        let dataset = TrainingDataset::new(features, labels).unwrap();

        let (train, test) = dataset.stratified_split(0.2, 42).unwrap();

        assert_eq!(train.n_samples + test.n_samples, 100);
        assert_eq!(test.class_counts(), [12, 6, 2]);
        assert_eq!(train.class_counts(), [48, 24, 8]);
    }

    #[test]
    fn test_stratified_split_is_seeded() {
        let labels: Vec<DepthClass> = (0..30)
            .map(|i| DepthClass::from_index(i % 3).unwrap())
            .collect();
        let features = Array2::from_shape_fn((30, 1), |(i, _)| i as f64);
        let dataset = TrainingDataset::new(features, labels).unwrap();

        let (a_train, _) = dataset.stratified_split(0.2, 7).unwrap();
        let (b_train, _) = dataset.stratified_split(0.2, 7).unwrap();
        assert_eq!(a_train.features, b_train.features);
    }

    #[test]
    fn test_training_dataset_rejects_label_mismatch() {
        let features = array![[1.0, 2.0], [3.0, 4.0]];
        let result = TrainingDataset::new(features, vec![DepthClass::Shallow]);
        assert!(result.is_err());
    }

    #[test]
    fn test_training_config_defaults_validate() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ensemble.n_estimators, 300);
        assert_eq!(config.ensemble.max_depth, 5);
        assert_eq!(config.sequence.lstm1_units, 64);
        assert_eq!(config.rebalance, RebalanceStrategy::ClassWeight);
    }

    #[test]
    fn test_training_config_rejects_bad_ranges() {
        let mut config = TrainingConfig::default();
        config.test_size = 0.9;
        assert!(config.validate().is_err());

        let mut config = TrainingConfig::default();
        config.ensemble.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_type_display() {
        assert_eq!(ModelType::GradientBoosting.to_string(), "Gradient Boosting");
        assert_eq!(ModelType::SequenceModel.label(), "sequence_model");
    }
}
