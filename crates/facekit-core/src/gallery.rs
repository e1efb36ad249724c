//! Enrolled face gallery persisted as JSON.

use crate::similarity::{CosineMatcher, Matcher};
use crate::types::{Embedding, FaceModel, MatchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("gallery JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("embedding is empty")]
    EmptyEmbedding,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Gallery {
    models: Vec<FaceModel>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a gallery file. A missing file is an empty gallery.
    pub fn load(path: &Path) -> Result<Self, GalleryError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no gallery file, starting empty");
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let gallery: Gallery = serde_json::from_str(&raw)?;
        tracing::debug!(path = %path.display(), models = gallery.models.len(), "gallery loaded");
        Ok(gallery)
    }

    /// Write the gallery, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Add an embedding under `label` with a fresh UUID.
    pub fn enroll(
        &mut self,
        label: &str,
        embedding: Embedding,
    ) -> Result<&FaceModel, GalleryError> {
        if embedding.is_empty() {
            return Err(GalleryError::EmptyEmbedding);
        }
        let model = FaceModel {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            embedding,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        tracing::info!(id = %model.id, label, "enrolled face");
        self.models.push(model);
        Ok(&self.models[self.models.len() - 1])
    }

    /// Remove a model by id; returns whether it existed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.models.len();
        self.models.retain(|m| m.id != id);
        before != self.models.len()
    }

    pub fn models(&self) -> &[FaceModel] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Best match for `query` with [`CosineMatcher`].
    pub fn identify(&self, query: &Embedding, threshold: f32) -> MatchResult {
        CosineMatcher.compare(query, &self.models, threshold)
    }
}
