//! facekit-core — Face detection, embedding extraction and matching.
//!
//! SCRFD finds faces and five landmarks, MobileFaceNet turns an aligned
//! 112×112 crop into a unit-norm embedding, and embeddings are compared by
//! cosine similarity. Both networks run behind the [`engine`] capability,
//! implemented over ONNX Runtime by [`ort_backend`].

pub mod alignment;
pub mod codec;
pub mod cpu;
pub mod detector;
pub mod engine;
pub mod gallery;
pub mod ort_backend;
pub mod pipeline;
pub mod recognizer;
pub mod similarity;
pub mod types;

pub use detector::{FaceDetector, Thresholds};
pub use engine::{InferenceBackend, LoadOptions, LoadedModel, ModelArtifacts};
pub use gallery::Gallery;
pub use pipeline::{AnalyzedFace, FacePipeline};
pub use recognizer::EmbeddingExtractor;
pub use similarity::{cosine_similarity, try_cosine_similarity, CosineMatcher, Matcher};
pub use types::{CanonicalImage, Detection, Embedding, FaceModel, Landmarks, MatchResult};
