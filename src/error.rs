use std::path::PathBuf;
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// A required artifact is missing from the artifact directory
    #[error("Artifact not found: {artifact} (expected at {})", path.display())]
    ArtifactNotFound { artifact: String, path: PathBuf },

    /// An artifact exists but cannot be trusted (parse failure, checksum mismatch)
    #[error("Artifact corrupt: {artifact}: {reason}")]
    ArtifactCorrupt { artifact: String, reason: String },

    /// Assembled features do not match the schema the artifacts were trained on
    #[error("Schema mismatch: expected {expected}, got {actual}")]
    SchemaMismatch { expected: String, actual: String },

    /// Vector length differs from the fitted dimensionality
    #[error("Dimension mismatch: expected {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The optional sequence model could not be loaded or evaluated
    #[error("Sequence model unavailable: {0}")]
    SequenceModelUnavailable(String),

    /// Training dataset file is missing
    #[error("Dataset not found: {}", .0.display())]
    DatasetNotFound(PathBuf),

    /// Training dataset lacks required feature columns
    #[error("Missing columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    /// Neither a label column nor a usable depth column is available
    #[error("Label derivation error: {0}")]
    LabelDerivationError(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Numeric backend / model fitting errors
    #[error("Model error: {0}")]
    Model(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Get error code string
    pub fn error_code(&self) -> &str {
        match self {
            AppError::ArtifactNotFound { .. } => "ARTIFACT_NOT_FOUND",
            AppError::ArtifactCorrupt { .. } => "ARTIFACT_CORRUPT",
            AppError::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            AppError::DimensionMismatch { .. } => "DIMENSION_MISMATCH",
            AppError::SequenceModelUnavailable(_) => "SEQUENCE_MODEL_UNAVAILABLE",
            AppError::DatasetNotFound(_) => "DATASET_NOT_FOUND",
            AppError::MissingColumns(_) => "MISSING_COLUMNS",
            AppError::LabelDerivationError(_) => "LABEL_DERIVATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Model(_) => "MODEL_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error only concerns training runs
    pub fn is_training_error(&self) -> bool {
        matches!(
            self,
            AppError::DatasetNotFound(_)
                | AppError::MissingColumns(_)
                | AppError::LabelDerivationError(_)
        )
    }
}

/// Conversion from serde_json::Error
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from bincode::Error
impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Conversion from csv::Error
impl From<csv::Error> for AppError {
    fn from(err: csv::Error) -> Self {
        AppError::Serialization(format!("CSV: {}", err))
    }
}

/// Conversion from validator::ValidationErrors
impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

/// Conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration(err.to_string())
    }
}

/// Conversion from candle_core::Error
impl From<candle_core::Error> for AppError {
    fn from(err: candle_core::Error) -> Self {
        AppError::Model(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            AppError::DimensionMismatch {
                expected: 10,
                actual: 9
            }
            .error_code(),
            "DIMENSION_MISMATCH"
        );
        assert_eq!(
            AppError::SequenceModelUnavailable("missing".to_string()).error_code(),
            "SEQUENCE_MODEL_UNAVAILABLE"
        );
        assert_eq!(
            AppError::MissingColumns(vec!["gap".to_string()]).error_code(),
            "MISSING_COLUMNS"
        );
    }

    #[test]
    fn test_artifact_not_found_names_the_file() {
        let err = AppError::ArtifactNotFound {
            artifact: "gbt_depth_class.bin".to_string(),
            path: PathBuf::from("models/gbt_depth_class.bin"),
        };
        let message = err.to_string();
        assert!(message.contains("gbt_depth_class.bin"));
        assert!(message.contains("models/gbt_depth_class.bin"));
    }

    #[test]
    fn test_missing_columns_lists_all() {
        let err = AppError::MissingColumns(vec!["dmin".to_string(), "rms".to_string()]);
        assert_eq!(err.to_string(), "Missing columns: dmin, rms");
        assert!(err.is_training_error());
        assert!(!AppError::Validation("x".to_string()).is_training_error());
    }
}
