use crate::error::{AppError, Result};
use crate::ml::models::{FeatureSchema, SeismicFeature};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Named numeric inputs for one prediction; any field may be absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct RawInputs {
    values: BTreeMap<SeismicFeature, f64>,
}

impl RawInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `(name, value)` pairs, rejecting unknown feature names and
    /// features given twice under different aliases
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let mut inputs = Self::new();
        for (name, value) in pairs {
            let feature = SeismicFeature::parse(name)?;
            if inputs.values.insert(feature, value).is_some() {
                return Err(AppError::Validation(format!(
                    "feature {} supplied more than once (last as '{}')",
                    feature, name
                )));
            }
        }
        Ok(inputs)
    }

    /// Builder-style setter
    pub fn with(mut self, feature: SeismicFeature, value: f64) -> Self {
        self.set(feature, value);
        self
    }

    pub fn set(&mut self, feature: SeismicFeature, value: f64) {
        self.values.insert(feature, value);
    }

    pub fn get(&self, feature: SeismicFeature) -> Option<f64> {
        self.values.get(&feature).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SeismicFeature, f64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}

impl TryFrom<BTreeMap<String, f64>> for RawInputs {
    type Error = AppError;

    fn try_from(map: BTreeMap<String, f64>) -> Result<Self> {
        Self::from_pairs(map.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

impl From<RawInputs> for BTreeMap<String, f64> {
    fn from(inputs: RawInputs) -> Self {
        inputs
            .values
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

/// Values substituted for features the caller did not supply
#[derive(Debug, Clone, Default, PartialEq)]
pub enum FeatureDefaults {
    /// Absent fields are an error
    #[default]
    None,

    /// Per-feature constants (dataset means, fixed values)
    Fixed(BTreeMap<SeismicFeature, f64>),
}

impl FeatureDefaults {
    /// Defaults from per-feature means in schema order
    pub fn from_means(schema: &FeatureSchema, means: &[f64]) -> Result<Self> {
        if means.len() != schema.len() {
            return Err(AppError::DimensionMismatch {
                expected: schema.len(),
                actual: means.len(),
            });
        }
        Ok(FeatureDefaults::Fixed(
            schema.features.iter().copied().zip(means.iter().copied()).collect(),
        ))
    }

    pub fn get(&self, feature: SeismicFeature) -> Option<f64> {
        match self {
            FeatureDefaults::None => None,
            FeatureDefaults::Fixed(values) => values.get(&feature).copied(),
        }
    }
}

/// Ordered feature values tagged with the schema they were assembled for
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    schema_fingerprint: String,
    values: Array1<f64>,
}

impl FeatureVector {
    pub fn new(schema: &FeatureSchema, values: Array1<f64>) -> Self {
        Self {
            schema_fingerprint: schema.fingerprint(),
            values,
        }
    }

    pub fn schema_fingerprint(&self) -> &str {
        &self.schema_fingerprint
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Builds schema-ordered feature vectors from raw inputs
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    schema: FeatureSchema,
    defaults: FeatureDefaults,
    expected_dim: Option<usize>,
}

impl FeatureAssembler {
    pub fn new(schema: FeatureSchema, defaults: FeatureDefaults) -> Self {
        Self {
            schema,
            defaults,
            expected_dim: None,
        }
    }

    /// Require the assembled vector to have the scaler's input dimensionality
    pub fn with_expected_dim(mut self, dim: usize) -> Self {
        self.expected_dim = Some(dim);
        self
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn defaults(&self) -> &FeatureDefaults {
        &self.defaults
    }

    /// Assemble a vector in schema order, substituting defaults
    pub fn assemble(&self, raw: &RawInputs) -> Result<FeatureVector> {
        let mut values = Vec::with_capacity(self.schema.len());
        let mut missing = Vec::new();

        for feature in &self.schema.features {
            match raw.get(*feature).or_else(|| self.defaults.get(*feature)) {
                Some(value) if value.is_finite() => values.push(value),
                Some(value) => {
                    return Err(AppError::Validation(format!(
                        "feature '{}' has non-finite value {}",
                        feature, value
                    )))
                }
                None => missing.push(feature.to_string()),
            }
        }

        if !missing.is_empty() {
            return Err(AppError::SchemaMismatch {
                expected: self.schema.fingerprint(),
                actual: format!("no value or default for {}", missing.join(", ")),
            });
        }

        for (feature, _) in raw.iter() {
            if self.schema.index_of(feature).is_none() {
                tracing::debug!(
                    feature = %feature,
                    schema = %self.schema.name,
                    "Ignoring input not named by the feature schema"
                );
            }
        }

        if let Some(expected) = self.expected_dim {
            if values.len() != expected {
                return Err(AppError::SchemaMismatch {
                    expected: format!("{} features", expected),
                    actual: format!("{} features ({})", values.len(), self.schema.fingerprint()),
                });
            }
        }

        Ok(FeatureVector::new(&self.schema, Array1::from(values)))
    }
}
