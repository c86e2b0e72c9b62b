//! Model artifacts scored by the evaluator

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AllocError, Result};
use crate::learning::sigmoid;
use crate::types::FeatureVector;

/// A loaded, read-only model
pub trait ScoringModel: Send + Sync {
    /// One prediction per row, in row order
    fn predict(&self, rows: &[FeatureVector]) -> Vec<f64>;
}

/// Logistic model over named features.
///
/// This is the artifact format written by the online learner, so a learner
/// snapshot can be evaluated against the current champion directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub bias: f64,
}

impl LinearModel {
    pub fn predict_one(&self, features: &FeatureVector) -> f64 {
        let z = features.iter().fold(self.bias, |acc, (name, value)| {
            acc + self.weights.get(name).copied().unwrap_or(0.0) * value
        });
        sigmoid(z)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let model: Self = serde_json::from_slice(bytes)?;
        if !model.bias.is_finite() || model.weights.values().any(|w| !w.is_finite()) {
            return Err(AllocError::Validation(
                "model artifact contains a non-finite parameter".into(),
            ));
        }
        Ok(model)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl ScoringModel for LinearModel {
    fn predict(&self, rows: &[FeatureVector]) -> Vec<f64> {
        rows.iter().map(|row| self.predict_one(row)).collect()
    }
}

/// Resolves an artifact path to a loaded model
#[async_trait]
pub trait ArtifactLoader: Send + Sync {
    async fn load(&self, artifact_path: &str) -> Result<Arc<dyn ScoringModel>>;
}

/// Loads [`LinearModel`] JSON files, relative paths resolved against `base_dir`
#[derive(Debug, Clone, Default)]
pub struct JsonArtifactLoader {
    base_dir: Option<PathBuf>,
}

impl JsonArtifactLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, artifact_path: &str) -> PathBuf {
        let path = Path::new(artifact_path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

#[async_trait]
impl ArtifactLoader for JsonArtifactLoader {
    async fn load(&self, artifact_path: &str) -> Result<Arc<dyn ScoringModel>> {
        let path = self.resolve(artifact_path);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AllocError::NotFound(format!(
                    "artifact {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let model = LinearModel::from_json(&bytes)?;
        Ok(Arc::new(model))
    }
}

/// Pre-registered models keyed by path (for testing and embedding)
#[derive(Default)]
pub struct InMemoryArtifactLoader {
    models: RwLock<HashMap<String, Arc<dyn ScoringModel>>>,
}

impl InMemoryArtifactLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, artifact_path: impl Into<String>, model: Arc<dyn ScoringModel>) {
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(artifact_path.into(), model);
    }
}

#[async_trait]
impl ArtifactLoader for InMemoryArtifactLoader {
    async fn load(&self, artifact_path: &str) -> Result<Arc<dyn ScoringModel>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(artifact_path)
            .cloned()
            .ok_or_else(|| AllocError::NotFound(format!("artifact {artifact_path}")))
    }
}
