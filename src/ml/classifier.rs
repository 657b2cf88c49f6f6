use crate::error::{AppError, Result};
use crate::ml::models::{ClassMetrics, DepthClass, ModelMetrics, ModelType, NUM_CLASSES};
use ndarray::{Array1, Array2, ArrayView1};
use ndarray_stats::QuantileExt;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::IntoEnumIterator;

/// Tolerance for a probability vector to count as a distribution
pub const SIMPLEX_TOLERANCE: f64 = 1e-6;

/// Whether a classifier returns class probabilities; decided when the model
/// is built or loaded, never probed per call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityCapability {
    LabelOnly,
    Probabilities,
}

/// Probability distribution over the three depth classes
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "[f64; 3]", into = "[f64; 3]")]
pub struct ClassProbabilities([f64; NUM_CLASSES]);

impl ClassProbabilities {
    /// Accept a vector that is already a distribution
    pub fn new(values: [f64; NUM_CLASSES]) -> Result<Self> {
        if values.iter().any(|p| !p.is_finite() || *p < -SIMPLEX_TOLERANCE) {
            return Err(AppError::Model(format!(
                "invalid class probabilities {:?}",
                values
            )));
        }
        let total: f64 = values.iter().sum();
        if (total - 1.0).abs() > SIMPLEX_TOLERANCE {
            return Err(AppError::Model(format!(
                "class probabilities sum to {}, expected 1",
                total
            )));
        }
        Ok(Self(values))
    }

    /// Numerically stable softmax of raw class scores
    pub fn from_logits(logits: &[f64]) -> Result<Self> {
        if logits.len() != NUM_CLASSES {
            return Err(AppError::DimensionMismatch {
                expected: NUM_CLASSES,
                actual: logits.len(),
            });
        }
        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut out = [0.0; NUM_CLASSES];
        let mut total = 0.0;
        for (o, l) in out.iter_mut().zip(logits) {
            *o = (l - max).exp();
            total += *o;
        }
        for o in out.iter_mut() {
            *o /= total;
        }
        Self::new(out)
    }

    pub fn as_array(&self) -> &[f64; NUM_CLASSES] {
        &self.0
    }

    pub fn get(&self, class: DepthClass) -> f64 {
        self.0[class.index()]
    }

    /// Most probable class (first one on ties)
    pub fn argmax(&self) -> Result<DepthClass> {
        let index = Array1::from(self.0.to_vec())
            .argmax()
            .map_err(|e| AppError::Model(format!("argmax over probabilities: {}", e)))?;
        DepthClass::from_index(index)
    }

    /// Display form: value × 100 rounded to two decimals
    pub fn percentages(&self) -> [f64; NUM_CLASSES] {
        self.0.map(|p| (p * 10_000.0).round() / 100.0)
    }
}

impl TryFrom<[f64; NUM_CLASSES]> for ClassProbabilities {
    type Error = AppError;

    fn try_from(values: [f64; NUM_CLASSES]) -> Result<Self> {
        Self::new(values)
    }
}

impl From<ClassProbabilities> for [f64; NUM_CLASSES] {
    fn from(p: ClassProbabilities) -> Self {
        p.0
    }
}

/// Class label with probabilities when the model exposes them
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierOutput {
    pub class: DepthClass,
    pub probabilities: Option<ClassProbabilities>,
}

impl ClassifierOutput {
    pub fn label_only(class: DepthClass) -> Self {
        Self {
            class,
            probabilities: None,
        }
    }

    pub fn from_probabilities(probabilities: ClassProbabilities) -> Result<Self> {
        Ok(Self {
            class: probabilities.argmax()?,
            probabilities: Some(probabilities),
        })
    }
}

/// A trained, immutable depth-class model fed standardized vectors
pub trait DepthClassifier: Send + Sync {
    /// Classify one standardized feature vector
    fn classify(&self, scaled: ArrayView1<f64>) -> Result<ClassifierOutput>;

    /// Classify every row of a standardized matrix
    fn classify_batch(&self, scaled: &Array2<f64>) -> Result<Vec<ClassifierOutput>> {
        (0..scaled.nrows())
            .into_par_iter()
            .map(|i| self.classify(scaled.row(i)))
            .collect()
    }

    /// Whether outputs carry probabilities
    fn capability(&self) -> ProbabilityCapability;

    /// Get model type
    fn model_type(&self) -> ModelType;

    /// Input dimensionality
    fn n_features(&self) -> usize;
}

/// Accuracy, per-class precision/recall/F1/support, macro averages and the
/// confusion matrix (rows = true class)
pub fn evaluate(y_true: &[DepthClass], y_pred: &[DepthClass]) -> Result<ModelMetrics> {
    if y_true.len() != y_pred.len() {
        return Err(AppError::DimensionMismatch {
            expected: y_true.len(),
            actual: y_pred.len(),
        });
    }
    let n_samples = y_true.len();
    if n_samples == 0 {
        return Ok(ModelMetrics::new());
    }

    let mut confusion = Array2::<usize>::zeros((NUM_CLASSES, NUM_CLASSES));
    for (t, p) in y_true.iter().zip(y_pred) {
        confusion[[t.index(), p.index()]] += 1;
    }

    let correct: usize = (0..NUM_CLASSES).map(|i| confusion[[i, i]]).sum();
    let accuracy = correct as f64 / n_samples as f64;

    let mut per_class = BTreeMap::new();
    for class in DepthClass::iter() {
        let c = class.index();
        let tp = confusion[[c, c]];
        let predicted = confusion.column(c).sum();
        let support = confusion.row(c).sum();

        let precision = if predicted > 0 {
            tp as f64 / predicted as f64
        } else {
            0.0
        };

        let recall = if support > 0 {
            tp as f64 / support as f64
        } else {
            0.0
        };

        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        per_class.insert(
            class.short_name().to_string(),
            ClassMetrics {
                precision,
                recall,
                f1_score: f1,
                support,
            },
        );
    }

    // Calculate macro-averaged metrics
    let avg_precision =
        per_class.values().map(|m| m.precision).sum::<f64>() / NUM_CLASSES as f64;
    let avg_recall = per_class.values().map(|m| m.recall).sum::<f64>() / NUM_CLASSES as f64;
    let avg_f1 = per_class.values().map(|m| m.f1_score).sum::<f64>() / NUM_CLASSES as f64;

    Ok(ModelMetrics {
        accuracy,
        precision: avg_precision,
        recall: avg_recall,
        f1_score: avg_f1,
        confusion_matrix: Some(confusion),
        per_class_metrics: per_class,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use DepthClass::*;

    #[test]
    fn test_probabilities_validation() {
        assert!(ClassProbabilities::new([0.2, 0.3, 0.5]).is_ok());
        assert!(ClassProbabilities::new([0.2, 0.3, 0.6]).is_err());
        assert!(ClassProbabilities::new([f64::NAN, 0.5, 0.5]).is_err());
    }

    #[test]
    fn test_softmax_logits() {
        let p = ClassProbabilities::from_logits(&[1.0, 3.0, 0.5]).unwrap();
        let total: f64 = p.as_array().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(p.argmax().unwrap(), Intermediate);

        // large logits must not overflow
        let p = ClassProbabilities::from_logits(&[1000.0, 999.0, -1000.0]).unwrap();
        assert_eq!(p.argmax().unwrap(), Shallow);
    }

    #[test]
    fn test_percentages_rounded_for_display() {
        let p = ClassProbabilities::new([0.123456, 0.654321, 0.222223]).unwrap();
        assert_eq!(p.percentages(), [12.35, 65.43, 22.22]);
        // internal precision kept
        assert_eq!(p.get(Shallow), 0.123456);
    }

    #[test]
    fn test_evaluate_metrics() {
        let y_true = vec![Shallow, Shallow, Shallow, Intermediate, Intermediate, Deep];
        let y_pred = vec![Shallow, Shallow, Intermediate, Intermediate, Shallow, Deep];
        let metrics = evaluate(&y_true, &y_pred).unwrap();

        assert!((metrics.accuracy - 4.0 / 6.0).abs() < 1e-12);

        let shallow = &metrics.per_class_metrics["shallow"];
        assert!((shallow.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((shallow.recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(shallow.support, 3);

        let deep = &metrics.per_class_metrics["deep"];
        assert_eq!(deep.f1_score, 1.0);

        let confusion = metrics.confusion_matrix.unwrap();
        assert_eq!(confusion[[0, 0]], 2);
        assert_eq!(confusion[[0, 1]], 1);
        assert_eq!(confusion[[1, 0]], 1);
        assert_eq!(confusion.sum(), 6);
    }

    #[test]
    fn test_evaluate_length_mismatch() {
        assert!(evaluate(&[Shallow], &[]).is_err());
        assert_eq!(evaluate(&[], &[]).unwrap().accuracy, 0.0);
    }
}
