//! Startup loading of the two artifact bundles.
//!
//! ## Bundle layout
//!
//! ```text
//! <model_dir>/crash_severity_system.json
//!   { "model": <classifier>, "target_encoder": {"classes": [..]} }
//! <model_dir>/preprocessing_artifacts.json
//!   { "encoders": {"<column>": {"classes": [..]}, ..}, "features": ["<column>", ..] }
//! ```
//!
//! Loading never aborts the process. Each bundle is read independently;
//! whatever fails to load is logged and left unset, and the predictor
//! reports itself as degraded instead.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::align::{ColumnEncoders, FeatureSchema};
use crate::classifier::{Classifier, ClassifierModel, ModelError};
use crate::config_loader::ServiceConfig;
use crate::encoding::LabelEncoder;

/// Errors from reading a bundle file.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("{} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("I/O error reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model in {}: {source}", path.display())]
    InvalidModel {
        path: PathBuf,
        #[source]
        source: ModelError,
    },
}

/// Contents of the system bundle. Either key may be absent.
#[derive(Debug, Default, Deserialize)]
pub struct SystemBundle {
    #[serde(default)]
    pub model: Option<ClassifierModel>,
    #[serde(default)]
    pub target_encoder: Option<LabelEncoder>,
}

impl SystemBundle {
    pub fn is_complete(&self) -> bool {
        self.model.is_some() && self.target_encoder.is_some()
    }
}

/// Contents of the preprocessing bundle. Missing keys read as empty.
#[derive(Debug, Default, Deserialize)]
pub struct PreprocessingBundle {
    #[serde(default)]
    pub encoders: ColumnEncoders,
    #[serde(default)]
    pub features: FeatureSchema,
}

impl PreprocessingBundle {
    pub fn is_complete(&self) -> bool {
        !self.encoders.is_empty() && !self.features.is_empty()
    }
}

/// Everything the predictor needs; each part may be missing.
#[derive(Debug, Default)]
pub struct LoadedArtifacts {
    pub classifier: Option<ClassifierModel>,
    pub target_encoder: Option<LabelEncoder>,
    pub encoders: ColumnEncoders,
    pub schema: FeatureSchema,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ArtifactError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ArtifactError::NotFound {
                path: path.to_path_buf(),
            });
        }
        Err(source) => {
            return Err(ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data).map_err(|source| ArtifactError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and validate the system bundle at `path`.
pub fn read_system_bundle(path: &Path) -> Result<SystemBundle, ArtifactError> {
    let bundle: SystemBundle = read_json(path)?;
    if let Some(model) = &bundle.model {
        model
            .validate()
            .map_err(|source| ArtifactError::InvalidModel {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(bundle)
}

/// Read the preprocessing bundle at `path`.
pub fn read_preprocessing_bundle(path: &Path) -> Result<PreprocessingBundle, ArtifactError> {
    read_json(path)
}

/// Load both bundles named by `config`, logging every outcome.
pub fn load_artifacts(config: &ServiceConfig) -> LoadedArtifacts {
    let mut loaded = LoadedArtifacts::default();

    let system_path = config.system_path();
    match read_system_bundle(&system_path) {
        Ok(bundle) => {
            if bundle.is_complete() {
                tracing::info!(
                    "Crash severity system loaded successfully from {}",
                    system_path.display()
                );
            } else {
                tracing::warn!(
                    "Model or target encoder is missing in {}",
                    system_path.display()
                );
            }
            loaded.classifier = bundle.model;
            loaded.target_encoder = bundle.target_encoder;
        }
        Err(err @ ArtifactError::NotFound { .. }) => tracing::error!("{err}"),
        Err(err) => tracing::error!("Error loading crash severity system: {err}"),
    }

    let artifacts_path = config.artifacts_path();
    match read_preprocessing_bundle(&artifacts_path) {
        Ok(bundle) => {
            if bundle.is_complete() {
                tracing::info!(
                    "Preprocessing artifacts loaded successfully from {}",
                    artifacts_path.display()
                );
            } else {
                tracing::warn!(
                    "Preprocessing artifacts are incomplete in {}",
                    artifacts_path.display()
                );
            }
            loaded.encoders = bundle.encoders;
            loaded.schema = bundle.features;
        }
        Err(err @ ArtifactError::NotFound { .. }) => tracing::error!("{err}"),
        Err(err) => tracing::error!("Error loading preprocessing artifacts: {err}"),
    }

    warn_on_mismatch(&loaded);
    loaded
}

fn warn_on_mismatch(loaded: &LoadedArtifacts) {
    let Some(classifier) = &loaded.classifier else {
        return;
    };
    if let Some(target) = &loaded.target_encoder
        && target.len() != classifier.n_classes()
    {
        tracing::warn!(
            "classifier scores {} classes but the target encoder knows {}",
            classifier.n_classes(),
            target.len()
        );
    }
    if let Some(n_features) = classifier.n_features()
        && !loaded.schema.is_empty()
        && n_features != loaded.schema.len()
    {
        tracing::warn!(
            "classifier expects {n_features} features but the schema lists {}",
            loaded.schema.len()
        );
    }
}
