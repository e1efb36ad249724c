//! MobileFaceNet embedding extractor.
//!
//! Turns an aligned 112×112 RGB face into a unit-norm embedding (512-dim,
//! or 128-dim for the legacy model).
//!
//! Pixels are fed to the network unscaled: the model's first layers subtract
//! 127.5 and multiply by 1/128 themselves. Normalizing here would apply it twice.

use crate::engine::{EngineError, InferenceBackend, LoadOptions, LoadedModel, ModelArtifacts};
use crate::ort_backend::OrtBackend;
use crate::types::{CanonicalImage, Embedding};
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

pub const EMBEDDING_INPUT_SIZE: u32 = 112;
pub const EMBEDDING_INPUT_NAME: &str = "data";
pub const EMBEDDING_OUTPUT_NAME: &str = "fc1";
pub const EMBEDDING_DIM: usize = 512;
pub const LEGACY_EMBEDDING_DIM: usize = 128;

/// Norms at or below this are left unnormalized.
const NORM_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("recognizer model not loaded")]
    NotLoaded,
    #[error("failed to load recognizer model: {0}")]
    Load(#[source] EngineError),
    #[error("input must be 112x112 RGB, got {width}x{height}x{channels}")]
    InputShape { width: u32, height: u32, channels: usize },
    #[error("recognizer inference failed: {0}")]
    Inference(#[source] EngineError),
    #[error("unexpected embedding length {0} (expected 512 or 128)")]
    UnexpectedLength(usize),
}

/// L2-normalize `values` in place.
///
/// Vectors whose norm is at or below 1e-6 are left as they are.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > NORM_EPSILON {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

/// Embedding extractor holding at most one loaded model.
pub struct EmbeddingExtractor<B: InferenceBackend = OrtBackend> {
    backend: B,
    model: Option<B::Model>,
    model_id: Option<String>,
}

impl EmbeddingExtractor<OrtBackend> {
    /// Extractor over ONNX Runtime.
    pub fn onnx() -> Self {
        Self::new(OrtBackend)
    }
}

impl<B: InferenceBackend> EmbeddingExtractor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            model: None,
            model_id: None,
        }
    }

    /// Load `{model_dir}/{model_id}-opt.param` and `-opt.bin`.
    ///
    /// A second call while ready returns `Ok` without reloading. On failure
    /// the extractor stays unloaded.
    pub fn load(
        &mut self,
        model_dir: impl AsRef<Path>,
        model_id: &str,
        options: &LoadOptions,
    ) -> Result<(), RecognizerError> {
        if self.model.is_some() {
            tracing::debug!(model = model_id, "recognizer already loaded");
            return Ok(());
        }

        let artifacts = ModelArtifacts::locate(model_dir, model_id);
        let model = self
            .backend
            .load(&artifacts, options)
            .map_err(RecognizerError::Load)?;

        tracing::info!(
            model = model_id,
            threads = options.intra_threads,
            accelerated = options.accelerated,
            "recognizer ready"
        );

        self.model = Some(model);
        self.model_id = Some(model_id.to_string());
        Ok(())
    }

    /// Extract a unit-norm embedding from an aligned 112×112 face.
    pub fn extract(&mut self, image: &CanonicalImage) -> Result<Embedding, RecognizerError> {
        let model = self.model.as_mut().ok_or(RecognizerError::NotLoaded)?;

        if image.width() != EMBEDDING_INPUT_SIZE || image.height() != EMBEDDING_INPUT_SIZE {
            tracing::warn!(
                width = image.width(),
                height = image.height(),
                "rejecting non-112x112 face"
            );
            return Err(RecognizerError::InputShape {
                width: image.width(),
                height: image.height(),
                channels: image.channels(),
            });
        }

        let input = to_planar_tensor(image);
        let mut outputs = model
            .run(EMBEDDING_INPUT_NAME, input.view())
            .map_err(RecognizerError::Inference)?;

        let mut values = outputs
            .take(EMBEDDING_OUTPUT_NAME)
            .ok_or_else(|| {
                RecognizerError::Inference(EngineError::MissingOutput(
                    EMBEDDING_OUTPUT_NAME.into(),
                ))
            })?;

        if values.len() != EMBEDDING_DIM && values.len() != LEGACY_EMBEDDING_DIM {
            return Err(RecognizerError::UnexpectedLength(values.len()));
        }

        l2_normalize(&mut values);
        tracing::debug!(dim = values.len(), "extracted embedding");

        Ok(Embedding {
            values,
            model_version: self.model_id.clone(),
        })
    }

    /// Drop the loaded model. No-op when unloaded.
    pub fn release(&mut self) {
        if self.model.take().is_some() {
            tracing::info!(model = ?self.model_id, "recognizer released");
        }
        self.model_id = None;
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some()
    }
}

/// Interleaved RGB bytes → NCHW float tensor, raw 0–255 values.
fn to_planar_tensor(image: &CanonicalImage) -> Array4<f32> {
    let w = image.width() as usize;
    let h = image.height() as usize;
    let src = image.as_bytes();

    Array4::from_shape_fn((1, 3, h, w), |(_, c, y, x)| src[(y * w + x) * 3 + c] as f32)
}
