use crate::error::{AppError, Result};
use crate::ml::TrainingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Environment variable naming an optional override file
pub const CONFIG_PATH_ENV: &str = "QUAKE_DEPTH_CONFIG";

/// Override file read when neither a flag nor the environment names one
pub const DEFAULT_OVERRIDE_PATH: &str = "config/quake-depth.toml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Artifact directory and loading options
    #[serde(default)]
    pub artifacts: ArtifactConfig,

    /// Offline training pipeline
    #[serde(default)]
    pub training: TrainingConfig,

    /// Logging and metrics
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the embedded defaults, the optional override
    /// file and `QUAKE_DEPTH_` environment variables, in that order.
    pub fn load() -> Result<Self> {
        let config_path = override_path(std::env::var(CONFIG_PATH_ENV).ok());
        Self::load_from(Some(&config_path))
    }

    /// Same as [`Config::load`] with an explicit override file
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        // e.g. QUAKE_DEPTH_TRAINING__ENSEMBLE__N_ESTIMATORS=500
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("QUAKE_DEPTH")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range training settings
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        if self.observability.log_level.trim().is_empty() {
            return Err(AppError::Configuration(
                "observability.log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_path(from_env: Option<String>) -> PathBuf {
    match from_env {
        Some(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_OVERRIDE_PATH),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactConfig {
    /// Directory holding the scaler, ensemble and sequence artifacts
    #[serde(default = "default_artifact_dir")]
    pub dir: PathBuf,

    /// Attempt to load the optional sequence model at startup
    #[serde(default = "default_true")]
    pub load_sequence_model: bool,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            dir: default_artifact_dir(),
            load_sequence_model: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of the human formatter
    #[serde(default)]
    pub json_logs: bool,

    /// Register Prometheus collectors
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{Objective, RebalanceStrategy, SequenceLayout};
    use std::io::Write;

    #[test]
    fn test_default_config_values() {
        assert_eq!(default_artifact_dir(), PathBuf::from("models"));
        assert_eq!(default_log_level(), "info");
        assert!(default_true());
    }

    #[test]
    fn test_embedded_defaults_load() {
        let config = Config::load_from(None).unwrap();
        assert_eq!(config.artifacts.dir, PathBuf::from("models"));
        assert!(config.artifacts.load_sequence_model);
        assert_eq!(config.training.ensemble.n_estimators, 300);
        assert_eq!(config.training.ensemble.objective, Objective::SoftProb);
        assert_eq!(config.training.sequence.layout, SequenceLayout::SingleStep);
        assert_eq!(config.training.rebalance, RebalanceStrategy::ClassWeight);
        assert_eq!(config.training.seed, 42);
    }

    #[test]
    fn test_override_file_wins() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[artifacts]\ndir = \"/tmp/depth-models\"\n\n[training.ensemble]\nmax_depth = 3\n"
        )
        .unwrap();

        let config = Config::load_from(Some(file.path())).unwrap();
        assert_eq!(config.artifacts.dir, PathBuf::from("/tmp/depth-models"));
        assert_eq!(config.training.ensemble.max_depth, 3);
        // untouched keys keep their defaults
        assert_eq!(config.training.ensemble.n_estimators, 300);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[training]\ntest_size = 0.95\n").unwrap();

        let result = Config::load_from(Some(file.path()));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_missing_override_file_is_ignored() {
        let config = Config::load_from(Some(Path::new("/nonexistent/quake-depth.toml"))).unwrap();
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_override_path_falls_back_to_default_file() {
        assert_eq!(override_path(None), PathBuf::from(DEFAULT_OVERRIDE_PATH));
        assert_eq!(override_path(Some("  ".to_string())), PathBuf::from(DEFAULT_OVERRIDE_PATH));
        assert_eq!(
            override_path(Some("/etc/quake-depth.toml".to_string())),
            PathBuf::from("/etc/quake-depth.toml")
        );
    }

    #[test]
    fn test_load_without_flag_reads_override() {
        // only test that touches the variable
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[artifacts]\ndir = \"from-env\"").unwrap();
        std::env::set_var(CONFIG_PATH_ENV, file.path());

        let config = Config::load();
        std::env::remove_var(CONFIG_PATH_ENV);
        assert_eq!(config.unwrap().artifacts.dir, PathBuf::from("from-env"));
    }
}
