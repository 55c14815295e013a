//! In-memory registry of imported models.
//!
//! The download driver registers every completed download here so the
//! rest of the application can list and reference the new asset.
//! Process-lifetime only; nothing is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::download::DownloadSource;
use crate::error::CoreError;

/// A model known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportedModel {
    pub id: String,
    pub name: String,
    pub model_type: String,
    pub base_model: Option<String>,
    /// Human-readable size, e.g. `"1.5 GB"`.
    pub size: String,
    pub size_bytes: u64,
    pub version: String,
    pub source: DownloadSource,
    pub source_url: Option<String>,
    pub imported_at: DateTime<Utc>,
}

/// Fields supplied when registering a model; id and timestamp are
/// stamped by the registry.
#[derive(Debug, Clone)]
pub struct NewModel {
    pub name: String,
    pub model_type: String,
    pub base_model: Option<String>,
    pub size: String,
    pub size_bytes: u64,
    pub version: String,
    pub source: DownloadSource,
    pub source_url: Option<String>,
}

/// Thread-safe in-memory model collection, newest first.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Mutex<Vec<ImportedModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model and return the stored record.
    pub fn add_model(&self, new: NewModel) -> ImportedModel {
        let model = ImportedModel {
            id: format!("imported-{}", uuid::Uuid::new_v4()),
            name: new.name,
            model_type: new.model_type,
            base_model: new.base_model,
            size: new.size,
            size_bytes: new.size_bytes,
            version: new.version,
            source: new.source,
            source_url: new.source_url,
            imported_at: Utc::now(),
        };
        let mut models = self.models.lock().expect("model registry lock poisoned");
        models.insert(0, model.clone());
        model
    }

    /// Remove a model by id.
    pub fn remove_model(&self, model_id: &str) -> Result<(), CoreError> {
        let mut models = self.models.lock().expect("model registry lock poisoned");
        let before = models.len();
        models.retain(|m| m.id != model_id);
        if models.len() == before {
            return Err(CoreError::NotFound {
                entity: "model",
                id: model_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn find_by_id(&self, model_id: &str) -> Option<ImportedModel> {
        let models = self.models.lock().expect("model registry lock poisoned");
        models.iter().find(|m| m.id == model_id).cloned()
    }

    /// Duplicate detection: is there already a model imported from this URL?
    pub fn has_model_with_url(&self, url: &str) -> bool {
        let models = self.models.lock().expect("model registry lock poisoned");
        models.iter().any(|m| m.source_url.as_deref() == Some(url))
    }

    pub fn models_of_type(&self, model_type: &str) -> Vec<ImportedModel> {
        let models = self.models.lock().expect("model registry lock poisoned");
        models
            .iter()
            .filter(|m| m.model_type == model_type)
            .cloned()
            .collect()
    }

    pub fn all_models(&self) -> Vec<ImportedModel> {
        self.models
            .lock()
            .expect("model registry lock poisoned")
            .clone()
    }

    pub fn len(&self) -> usize {
        self.models.lock().expect("model registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
