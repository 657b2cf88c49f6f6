use crate::error::{AppError, Result};
use crate::metrics::ARTIFACT_LOADS_TOTAL;
use crate::ml::classifier::{DepthClassifier, ProbabilityCapability};
use crate::ml::ensemble::GradientBoostedEnsemble;
use crate::ml::models::{FeatureSchema, ModelMetadata};
use crate::ml::scaler::StandardScaler;
use crate::ml::sequence::{FittedSequenceModel, SequenceArchitecture, SequenceClassifier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SCALER_FILE: &str = "scaler.json";
pub const ENSEMBLE_FILE: &str = "gbt_depth_class.bin";
pub const SEQUENCE_WEIGHTS_FILE: &str = "lstm_depth_class.safetensors";
pub const SEQUENCE_ARCH_FILE: &str = "lstm_depth_class.json";

/// Descriptor written next to the artifacts; binds them to one schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Identity of this artifact set
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub crate_version: String,
    pub schema: FeatureSchema,
    /// Training-split feature means, usable as assembly defaults
    pub training_means: Vec<f64>,
    pub ensemble_capability: ProbabilityCapability,
    /// SHA-256 (hex) per artifact file name
    pub checksums: BTreeMap<String, String>,
    pub models: Vec<ModelMetadata>,
}

impl ArtifactManifest {
    pub fn has_sequence_model(&self) -> bool {
        self.checksums.contains_key(SEQUENCE_WEIGHTS_FILE)
            && self.checksums.contains_key(SEQUENCE_ARCH_FILE)
    }
}

/// Everything a training run persists
pub struct ArtifactSet<'a> {
    pub schema: &'a FeatureSchema,
    pub scaler: &'a StandardScaler,
    pub ensemble: &'a GradientBoostedEnsemble,
    pub sequence: Option<&'a FittedSequenceModel>,
    pub training_means: Vec<f64>,
    pub models: Vec<ModelMetadata>,
}

/// Artifact directory with stable file names
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn corrupt(artifact: &str, reason: impl std::fmt::Display) -> AppError {
    AppError::ArtifactCorrupt {
        artifact: artifact.to_string(),
        reason: reason.to_string(),
    }
}

fn record_load<T>(artifact: &str, result: &Result<T>) {
    let status = match result {
        Ok(_) => "ok",
        Err(AppError::ArtifactNotFound { .. }) => "not_found",
        Err(AppError::ArtifactCorrupt { .. }) => "corrupt",
        Err(_) => "error",
    };
    ARTIFACT_LOADS_TOTAL.with_label_values(&[artifact, status]).inc();
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: &str) -> PathBuf {
        self.dir.join(artifact)
    }

    fn read(&self, artifact: &str) -> Result<Vec<u8>> {
        let path = self.path(artifact);
        if !path.is_file() {
            return Err(AppError::ArtifactNotFound {
                artifact: artifact.to_string(),
                path,
            });
        }
        Ok(std::fs::read(&path)?)
    }

    /// Read an artifact and check it against the manifest checksum
    fn read_verified(&self, manifest: &ArtifactManifest, artifact: &str) -> Result<Vec<u8>> {
        let bytes = self.read(artifact)?;
        let expected = manifest
            .checksums
            .get(artifact)
            .ok_or_else(|| corrupt(artifact, "no checksum recorded in manifest"))?;
        let actual = sha256_hex(&bytes);
        if &actual != expected {
            return Err(corrupt(
                artifact,
                format!("checksum mismatch (manifest {}, file {})", expected, actual),
            ));
        }
        Ok(bytes)
    }

    pub fn load_manifest(&self) -> Result<ArtifactManifest> {
        let result = self.read(MANIFEST_FILE).and_then(|bytes| {
            let manifest = serde_json::from_slice::<ArtifactManifest>(&bytes)
                .map_err(|e| corrupt(MANIFEST_FILE, e))?;
            if manifest.training_means.len() != manifest.schema.len() {
                return Err(corrupt(
                    MANIFEST_FILE,
                    format!(
                        "training_means has {} values for a {}-feature schema",
                        manifest.training_means.len(),
                        manifest.schema.len()
                    ),
                ));
            }
            if manifest.training_means.iter().any(|m| !m.is_finite()) {
                return Err(corrupt(MANIFEST_FILE, "training_means contains non-finite values"));
            }
            Ok(manifest)
        });
        record_load(MANIFEST_FILE, &result);
        result
    }

    pub fn load_scaler(&self, manifest: &ArtifactManifest) -> Result<StandardScaler> {
        let result = self.read_verified(manifest, SCALER_FILE).and_then(|bytes| {
            let scaler: StandardScaler =
                serde_json::from_slice(&bytes).map_err(|e| corrupt(SCALER_FILE, e))?;
            if scaler.n_features() != manifest.schema.len() {
                return Err(AppError::SchemaMismatch {
                    expected: manifest.schema.fingerprint(),
                    actual: format!("scaler fitted on {} features", scaler.n_features()),
                });
            }
            Ok(scaler)
        });
        record_load(SCALER_FILE, &result);
        result
    }

    pub fn load_ensemble(&self, manifest: &ArtifactManifest) -> Result<GradientBoostedEnsemble> {
        let result = self.read_verified(manifest, ENSEMBLE_FILE).and_then(|bytes| {
            let ensemble =
                GradientBoostedEnsemble::from_bytes(&bytes).map_err(|e| corrupt(ENSEMBLE_FILE, e))?;
            if ensemble.n_features() != manifest.schema.len() {
                return Err(AppError::SchemaMismatch {
                    expected: manifest.schema.fingerprint(),
                    actual: format!("ensemble trained on {} features", ensemble.n_features()),
                });
            }
            if ensemble.capability() != manifest.ensemble_capability {
                return Err(corrupt(
                    ENSEMBLE_FILE,
                    format!(
                        "capability {:?} differs from manifest {:?}",
                        ensemble.capability(),
                        manifest.ensemble_capability
                    ),
                ));
            }
            Ok(ensemble)
        });
        record_load(ENSEMBLE_FILE, &result);
        result
    }

    pub fn load_sequence(&self, manifest: &ArtifactManifest) -> Result<SequenceClassifier> {
        let result = self
            .read_verified(manifest, SEQUENCE_ARCH_FILE)
            .and_then(|arch_bytes| {
                let arch: SequenceArchitecture = serde_json::from_slice(&arch_bytes)
                    .map_err(|e| corrupt(SEQUENCE_ARCH_FILE, e))?;
                if arch.n_features != manifest.schema.len() {
                    return Err(AppError::SchemaMismatch {
                        expected: manifest.schema.fingerprint(),
                        actual: format!("sequence model built for {} features", arch.n_features),
                    });
                }
                let weights = self.read_verified(manifest, SEQUENCE_WEIGHTS_FILE)?;
                SequenceClassifier::from_safetensors(arch, weights)
                    .map_err(|e| corrupt(SEQUENCE_WEIGHTS_FILE, e))
            });
        record_load(SEQUENCE_WEIGHTS_FILE, &result);
        result
    }

    /// Write every artifact, then the manifest with their checksums
    pub fn save(&self, set: ArtifactSet<'_>) -> Result<ArtifactManifest> {
        std::fs::create_dir_all(&self.dir)?;
        let mut checksums = BTreeMap::new();

        let scaler_bytes = serde_json::to_vec_pretty(set.scaler)?;
        std::fs::write(self.path(SCALER_FILE), &scaler_bytes)?;
        checksums.insert(SCALER_FILE.to_string(), sha256_hex(&scaler_bytes));

        let ensemble_bytes = set.ensemble.to_bytes()?;
        std::fs::write(self.path(ENSEMBLE_FILE), &ensemble_bytes)?;
        checksums.insert(ENSEMBLE_FILE.to_string(), sha256_hex(&ensemble_bytes));

        if let Some(sequence) = set.sequence {
            let weights_path = self.path(SEQUENCE_WEIGHTS_FILE);
            sequence.save_weights(&weights_path)?;
            let weights = std::fs::read(&weights_path)?;
            checksums.insert(SEQUENCE_WEIGHTS_FILE.to_string(), sha256_hex(&weights));

            let arch_bytes = serde_json::to_vec_pretty(sequence.classifier.architecture())?;
            std::fs::write(self.path(SEQUENCE_ARCH_FILE), &arch_bytes)?;
            checksums.insert(SEQUENCE_ARCH_FILE.to_string(), sha256_hex(&arch_bytes));
        }

        let manifest = ArtifactManifest {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            crate_version: env!("CARGO_PKG_VERSION").to_string(),
            schema: set.schema.clone(),
            training_means: set.training_means,
            ensemble_capability: set.ensemble.capability(),
            checksums,
            models: set.models,
        };
        std::fs::write(self.path(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;

        tracing::info!(
            dir = %self.dir.display(),
            id = %manifest.id,
            schema = %manifest.schema.fingerprint(),
            sequence_model = manifest.has_sequence_model(),
            "Saved artifact set"
        );
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::models::{DepthClass, EnsembleParams, TrainingDataset};
    use ndarray::Array2;

    fn tiny_set_on_disk(dir: &Path) -> ArtifactManifest {
        let schema = FeatureSchema::canonical();
        let features = Array2::from_shape_fn((30, 10), |(i, j)| ((i % 3) * 10 + j) as f64 + (i / 3) as f64 * 0.01);
        let labels = (0..30).map(|i| DepthClass::from_index(i % 3).unwrap()).collect();
        let dataset = TrainingDataset::new(features, labels).unwrap();

        let scaler = StandardScaler::fit(&dataset.features).unwrap();
        let scaled = TrainingDataset::new(
            scaler.transform_matrix(&dataset.features).unwrap(),
            dataset.labels.clone(),
        )
        .unwrap();
        let params = EnsembleParams {
            n_estimators: 5,
            max_depth: 2,
            ..EnsembleParams::default()
        };
        let ensemble = GradientBoostedEnsemble::fit(&scaled, &params, 1).unwrap();

        ArtifactStore::new(dir)
            .save(ArtifactSet {
                schema: &schema,
                scaler: &scaler,
                ensemble: &ensemble,
                sequence: None,
                training_means: scaler.mean().to_vec(),
                models: Vec::new(),
            })
            .unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let saved = tiny_set_on_disk(dir.path());
        let store = ArtifactStore::new(dir.path());

        let manifest = store.load_manifest().unwrap();
        assert_eq!(manifest.id, saved.id);
        assert_eq!(manifest.schema, FeatureSchema::canonical());
        assert!(!manifest.has_sequence_model());

        let scaler = store.load_scaler(&manifest).unwrap();
        assert_eq!(scaler.n_features(), 10);
        let ensemble = store.load_ensemble(&manifest).unwrap();
        assert_eq!(ensemble.n_rounds(), 5);
    }

    #[test]
    fn test_missing_ensemble_is_named() {
        let dir = tempfile::tempdir().unwrap();
        tiny_set_on_disk(dir.path());
        std::fs::remove_file(dir.path().join(ENSEMBLE_FILE)).unwrap();

        let store = ArtifactStore::new(dir.path());
        let manifest = store.load_manifest().unwrap();
        match store.load_ensemble(&manifest) {
            Err(AppError::ArtifactNotFound { artifact, path }) => {
                assert_eq!(artifact, ENSEMBLE_FILE);
                assert_eq!(path, dir.path().join(ENSEMBLE_FILE));
            }
            other => panic!("expected ArtifactNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tampered_scaler_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        tiny_set_on_disk(dir.path());
        let path = dir.path().join(SCALER_FILE);
        let mut text = std::fs::read_to_string(&path).unwrap();
        text.push(' ');
        std::fs::write(&path, text).unwrap();

        let store = ArtifactStore::new(dir.path());
        let manifest = store.load_manifest().unwrap();
        assert!(matches!(
            store.load_scaler(&manifest),
            Err(AppError::ArtifactCorrupt { .. })
        ));
    }

    #[test]
    fn test_scaler_with_valid_checksum_but_bad_state_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = tiny_set_on_disk(dir.path());

        let bad = serde_json::json!({
            "mean": vec![0.0; 10],
            "scale": vec![1.0; 9],
            "n_samples_seen": 30,
        });
        let bytes = serde_json::to_vec(&bad).unwrap();
        std::fs::write(dir.path().join(SCALER_FILE), &bytes).unwrap();
        manifest
            .checksums
            .insert(SCALER_FILE.to_string(), sha256_hex(&bytes));

        let store = ArtifactStore::new(dir.path());
        match store.load_scaler(&manifest) {
            Err(AppError::ArtifactCorrupt { artifact, .. }) => assert_eq!(artifact, SCALER_FILE),
            other => panic!("expected ArtifactCorrupt, got {:?}", other.map(|_| ())),
        }

        let zero_scale = serde_json::json!({
            "mean": vec![0.0; 10],
            "scale": vec![0.0; 10],
            "n_samples_seen": 30,
        });
        let bytes = serde_json::to_vec(&zero_scale).unwrap();
        std::fs::write(dir.path().join(SCALER_FILE), &bytes).unwrap();
        manifest
            .checksums
            .insert(SCALER_FILE.to_string(), sha256_hex(&bytes));
        assert!(matches!(
            store.load_scaler(&manifest),
            Err(AppError::ArtifactCorrupt { .. })
        ));
    }

    #[test]
    fn test_manifest_means_must_match_schema() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = tiny_set_on_disk(dir.path());
        manifest.training_means.pop();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest).unwrap(),
        )
        .unwrap();

        match ArtifactStore::new(dir.path()).load_manifest() {
            Err(AppError::ArtifactCorrupt { artifact, reason }) => {
                assert_eq!(artifact, MANIFEST_FILE);
                assert!(reason.contains("9 values"), "{}", reason);
            }
            other => panic!("expected ArtifactCorrupt, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_unparseable_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{not json").unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(matches!(
            store.load_manifest(),
            Err(AppError::ArtifactCorrupt { .. })
        ));
    }

    #[test]
    fn test_sequence_absent_from_manifest() {
        let dir = tempfile::tempdir().unwrap();
        tiny_set_on_disk(dir.path());
        let store = ArtifactStore::new(dir.path());
        let manifest = store.load_manifest().unwrap();
        assert!(matches!(
            store.load_sequence(&manifest),
            Err(AppError::ArtifactNotFound { .. })
        ));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
