use crate::error::{AppError, Result};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

/// Fitted per-feature standardization: `(x - mean) / scale`.
///
/// Immutable once fitted; shared read-only across predictions. Deserialized
/// state goes through [`StandardScaler::from_parts`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ScalerState", into = "ScalerState")]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
    n_samples_seen: usize,
}

impl StandardScaler {
    /// Fit on the rows of `data` (population standard deviation).
    ///
    /// Constant features get a scale of 1.0 so they map to zero instead of NaN.
    pub fn fit(data: &Array2<f64>) -> Result<Self> {
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(AppError::Validation(
                "cannot fit a scaler on an empty matrix".to_string(),
            ));
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Validation(
                "scaler input contains non-finite values".to_string(),
            ));
        }

        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| AppError::Internal("mean of empty axis".to_string()))?;
        let scale = data
            .std_axis(Axis(0), 0.0)
            .mapv(|s| if s > f64::EPSILON { s } else { 1.0 });

        tracing::debug!(
            n_samples = data.nrows(),
            n_features = data.ncols(),
            "Fitted standard scaler"
        );

        Ok(Self {
            mean,
            scale,
            n_samples_seen: data.nrows(),
        })
    }

    /// Rebuild a scaler from stored statistics
    pub fn from_parts(mean: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        if mean.len() != scale.len() {
            return Err(AppError::DimensionMismatch {
                expected: mean.len(),
                actual: scale.len(),
            });
        }
        if mean.is_empty() {
            return Err(AppError::Validation("scaler has no features".to_string()));
        }
        if let Some(bad) = scale.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(AppError::Validation(format!(
                "scaler standard deviation must be positive and finite, got {}",
                bad
            )));
        }
        if mean.iter().any(|m| !m.is_finite()) {
            return Err(AppError::Validation(
                "scaler mean must be finite".to_string(),
            ));
        }

        Ok(Self {
            mean: Array1::from(mean),
            scale: Array1::from(scale),
            n_samples_seen: 0,
        })
    }

    /// Number of features the scaler was fitted on
    pub fn n_features(&self) -> usize {
        self.mean.len()
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    pub fn n_samples_seen(&self) -> usize {
        self.n_samples_seen
    }

    fn check_len(&self, actual: usize) -> Result<()> {
        if actual != self.n_features() {
            return Err(AppError::DimensionMismatch {
                expected: self.n_features(),
                actual,
            });
        }
        Ok(())
    }

    /// Standardize one feature vector
    pub fn transform(&self, x: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check_len(x.len())?;
        Ok((&x - &self.mean) / &self.scale)
    }

    /// Undo [`StandardScaler::transform`]
    pub fn inverse_transform(&self, z: ArrayView1<f64>) -> Result<Array1<f64>> {
        self.check_len(z.len())?;
        Ok(&z * &self.scale + &self.mean)
    }

    /// Standardize every row of a matrix
    pub fn transform_matrix(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        self.check_len(data.ncols())?;
        Ok((data - &self.mean) / &self.scale)
    }
}

/// Persisted form of a fitted scaler
#[derive(Serialize, Deserialize)]
struct ScalerState {
    mean: Vec<f64>,
    scale: Vec<f64>,
    #[serde(default)]
    n_samples_seen: usize,
}

impl TryFrom<ScalerState> for StandardScaler {
    type Error = AppError;

    fn try_from(state: ScalerState) -> Result<Self> {
        let mut scaler = Self::from_parts(state.mean, state.scale)?;
        scaler.n_samples_seen = state.n_samples_seen;
        Ok(scaler)
    }
}

impl From<StandardScaler> for ScalerState {
    fn from(scaler: StandardScaler) -> Self {
        Self {
            mean: scaler.mean.to_vec(),
            scale: scaler.scale.to_vec(),
            n_samples_seen: scaler.n_samples_seen,
        }
    }
}
