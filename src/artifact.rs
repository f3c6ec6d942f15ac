//! Model artifact loading.
//!
//! The artifact is a single versioned JSON file holding the tree ensemble,
//! the feature schema and the risk thresholds. It is read once at startup;
//! any problem with it is fatal.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::features::{FeatureSchema, FeatureSpec, SchemaError};
use crate::inference::{Forest, RiskThresholds, Tree};

/// Artifact format versions this build can read.
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[1];

/// The only objective the scoring code implements.
pub const SUPPORTED_OBJECTIVE: &str = "binary:logistic";

/// Everything that can go wrong while loading the artifact.
#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("cannot read model artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("model artifact is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("unsupported artifact format version {found} (supported: {supported:?})")]
    UnsupportedFormat { found: u32, supported: &'static [u32] },
    #[error("unsupported model objective '{0}'")]
    UnsupportedObjective(String),
    #[error("model artifact has an empty feature schema")]
    EmptySchema,
    #[error("invalid feature schema: {0}")]
    InvalidSchema(#[from] SchemaError),
    #[error("invalid risk thresholds: low_max={low_max}, high_min={high_min}")]
    InvalidThresholds { low_max: f64, high_min: f64 },
    #[error("invalid model: {0}")]
    InvalidModel(String),
    #[error("model version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("artifact digest mismatch: expected {expected}, found {found}")]
    DigestMismatch { expected: String, found: String },
}

/// Optional deployment pins checked against the artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactPins {
    pub model_version: Option<String>,
    pub sha256: Option<String>,
}

/// On-disk layout of the artifact.
#[derive(Debug, Deserialize)]
struct ArtifactFile {
    format_version: u32,
    model_version: String,
    trained_at: DateTime<Utc>,
    objective: String,
    base_score: f64,
    thresholds: RiskThresholds,
    #[serde(default)]
    features: Vec<FeatureSpec>,
    #[serde(default)]
    trees: Vec<Tree>,
}

/// Immutable, loaded model plus metadata. Shared read-only as
/// `Arc<ModelHandle>` for the life of the process.
#[derive(Debug)]
pub struct ModelHandle {
    format_version: u32,
    model_version: String,
    trained_at: DateTime<Utc>,
    objective: String,
    schema: FeatureSchema,
    thresholds: RiskThresholds,
    forest: Forest,
    sha256: String,
    source: Option<PathBuf>,
}

/// Loads the artifact at `path` without deployment pins.
pub fn load(path: impl AsRef<Path>) -> Result<ModelHandle, ModelLoadError> {
    load_with(path, &ArtifactPins::default())
}

/// Loads and validates the artifact at `path`, enforcing `pins`.
pub fn load_with(path: impl AsRef<Path>, pins: &ArtifactPins) -> Result<ModelHandle, ModelLoadError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut handle = ModelHandle::from_bytes(&bytes, pins)?;
    handle.source = Some(path.to_path_buf());

    tracing::info!(
        path = %path.display(),
        model_version = %handle.model_version,
        features = handle.schema.len(),
        trees = handle.forest.num_trees(),
        sha256 = %handle.sha256,
        "Model artifact loaded"
    );
    Ok(handle)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl ModelHandle {
    /// Parses and validates raw artifact bytes.
    pub fn from_bytes(bytes: &[u8], pins: &ArtifactPins) -> Result<Self, ModelLoadError> {
        let sha256 = sha256_hex(bytes);
        if let Some(expected) = &pins.sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(ModelLoadError::DigestMismatch {
                    expected: expected.clone(),
                    found: sha256,
                });
            }
        }

        let file: ArtifactFile = serde_json::from_slice(bytes)?;

        if !SUPPORTED_FORMAT_VERSIONS.contains(&file.format_version) {
            return Err(ModelLoadError::UnsupportedFormat {
                found: file.format_version,
                supported: SUPPORTED_FORMAT_VERSIONS,
            });
        }
        if file.objective != SUPPORTED_OBJECTIVE {
            return Err(ModelLoadError::UnsupportedObjective(file.objective));
        }
        if file.model_version.trim().is_empty() {
            return Err(ModelLoadError::InvalidModel(
                "model_version must not be empty".to_string(),
            ));
        }
        if let Some(expected) = &pins.model_version {
            if *expected != file.model_version {
                return Err(ModelLoadError::VersionMismatch {
                    expected: expected.clone(),
                    found: file.model_version,
                });
            }
        }

        if file.features.is_empty() {
            return Err(ModelLoadError::EmptySchema);
        }
        let schema = FeatureSchema::new(file.features)?;

        if !file.thresholds.validate() {
            return Err(ModelLoadError::InvalidThresholds {
                low_max: file.thresholds.low_max,
                high_min: file.thresholds.high_min,
            });
        }

        if !(file.base_score > 0.0 && file.base_score < 1.0) {
            return Err(ModelLoadError::InvalidModel(format!(
                "base_score {} must lie strictly between 0 and 1",
                file.base_score
            )));
        }
        if file.trees.is_empty() {
            return Err(ModelLoadError::InvalidModel("model has no trees".to_string()));
        }
        for (i, tree) in file.trees.iter().enumerate() {
            tree.validate(schema.len())
                .map_err(|e| ModelLoadError::InvalidModel(format!("tree {}: {}", i, e)))?;
        }

        Ok(Self {
            format_version: file.format_version,
            model_version: file.model_version,
            trained_at: file.trained_at,
            objective: file.objective,
            schema,
            thresholds: file.thresholds,
            forest: Forest::new(file.base_score, file.trees),
            sha256,
            source: None,
        })
    }

    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn trained_at(&self) -> DateTime<Utc> {
        self.trained_at
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn thresholds(&self) -> &RiskThresholds {
        &self.thresholds
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// Hex SHA-256 of the artifact bytes.
    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// File the handle was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}
