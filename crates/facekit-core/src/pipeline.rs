//! Detect → align → embed over one detector and one extractor.

use crate::alignment::{self, AlignmentError};
use crate::detector::{DetectorError, FaceDetector, Thresholds};
use crate::engine::{InferenceBackend, LoadOptions};
use crate::ort_backend::OrtBackend;
use crate::recognizer::{EmbeddingExtractor, RecognizerError};
use crate::types::{CanonicalImage, Detection, Embedding};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("alignment: {0}")]
    Alignment(#[from] AlignmentError),
}

/// A detected face together with its embedding.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedFace {
    pub detection: Detection,
    pub embedding: Embedding,
}

/// Model identifiers and load options for a [`FacePipeline`].
#[derive(Debug, Clone)]
pub struct PipelineModels<'a> {
    pub model_dir: &'a Path,
    pub detector_variant: &'a str,
    pub recognizer_model: &'a str,
    pub options: LoadOptions,
}

pub struct FacePipeline<B: InferenceBackend = OrtBackend> {
    detector: FaceDetector<B>,
    extractor: EmbeddingExtractor<B>,
}

impl FacePipeline<OrtBackend> {
    /// Load both models with ONNX Runtime.
    pub fn onnx(models: &PipelineModels<'_>) -> Result<Self, PipelineError> {
        let mut pipeline = Self::new(FaceDetector::onnx(), EmbeddingExtractor::onnx());
        pipeline.load(models)?;
        Ok(pipeline)
    }
}

impl<B: InferenceBackend> FacePipeline<B> {
    pub fn new(detector: FaceDetector<B>, extractor: EmbeddingExtractor<B>) -> Self {
        Self {
            detector,
            extractor,
        }
    }

    /// Load detector then recognizer; if the recognizer fails the detector stays usable.
    pub fn load(&mut self, models: &PipelineModels<'_>) -> Result<(), PipelineError> {
        self.detector
            .load(models.model_dir, models.detector_variant, &models.options)?;
        self.extractor
            .load(models.model_dir, models.recognizer_model, &models.options)?;
        Ok(())
    }

    pub fn detector(&mut self) -> &mut FaceDetector<B> {
        &mut self.detector
    }

    pub fn extractor(&mut self) -> &mut EmbeddingExtractor<B> {
        &mut self.extractor
    }

    /// Embed every detected face with usable landmarks, strongest first.
    pub fn analyze(
        &mut self,
        image: &CanonicalImage,
        thresholds: Thresholds,
    ) -> Result<Vec<AnalyzedFace>, PipelineError> {
        let detections = self.detector.detect(image, thresholds)?;
        let mut faces = Vec::with_capacity(detections.len());

        for detection in detections {
            if !alignment::landmarks_valid(&detection.landmarks) {
                tracing::debug!(
                    confidence = detection.confidence,
                    "skipping face with invalid landmarks"
                );
                continue;
            }
            let embedding = self.embed_detection(image, &detection)?;
            faces.push(AnalyzedFace {
                detection,
                embedding,
            });
        }

        Ok(faces)
    }

    /// Embed only the highest-confidence face.
    pub fn best_face(
        &mut self,
        image: &CanonicalImage,
        thresholds: Thresholds,
    ) -> Result<Option<AnalyzedFace>, PipelineError> {
        let detections = self.detector.detect(image, thresholds)?;
        let best = detections
            .into_iter()
            .filter(|d| alignment::landmarks_valid(&d.landmarks))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

        let Some(detection) = best else {
            return Ok(None);
        };
        tracing::info!(confidence = detection.confidence, "best face selected");

        let embedding = self.embed_detection(image, &detection)?;
        Ok(Some(AnalyzedFace {
            detection,
            embedding,
        }))
    }

    fn embed_detection(
        &mut self,
        image: &CanonicalImage,
        detection: &Detection,
    ) -> Result<Embedding, PipelineError> {
        let aligned = alignment::align_face(image, &detection.landmarks)?;
        Ok(self.extractor.extract(&aligned)?)
    }

    pub fn release(&mut self) {
        self.detector.release();
        self.extractor.release();
    }
}
