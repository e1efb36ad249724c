//! Shared image, detection and embedding types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Five facial keypoints in image pixel coordinates:
/// [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmarks = [(f32, f32); 5];

/// Number of interleaved channels in a [`CanonicalImage`] (always R, G, B).
pub const CANONICAL_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ImageError {
    #[error("image dimensions are zero")]
    ZeroDimensions,
    #[error("invalid RGB buffer length for {width}x{height}: expected {expected}, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Row-major interleaved RGB image, one byte per channel.
///
/// The buffer length is always `width * height * 3`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl CanonicalImage {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Result<Self, ImageError> {
        if width == 0 || height == 0 {
            return Err(ImageError::ZeroDimensions);
        }
        let expected = width as usize * height as usize * CANONICAL_CHANNELS;
        if data.len() != expected {
            return Err(ImageError::InvalidLength {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Image filled with a single RGB colour.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, ImageError> {
        let pixels = width as usize * height as usize;
        let data = rgb.iter().copied().cycle().take(pixels * CANONICAL_CHANNELS).collect();
        Self::new(width, height, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        CANONICAL_CHANNELS
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at (x, y). Caller guarantees the coordinate is in bounds.
    pub(crate) fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let off = (y * self.width as usize + x) * CANONICAL_CHANNELS;
        [self.data[off], self.data[off + 1], self.data[off + 2]]
    }
}

/// A detected face: axis-aligned box (origin top-left), confidence and
/// five landmarks, all in the source image's pixel space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    pub landmarks: Landmarks,
}

impl Detection {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection-over-Union with another detection.
    pub fn iou(&self, other: &Detection) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional, 128 for the legacy model).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model identifier that produced this embedding (e.g., "mobilefacenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// L2 norm of the vector.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Cosine similarity in [-1, 1], see [`crate::similarity::try_cosine_similarity`].
    pub fn similarity(&self, other: &Embedding) -> Result<f32, crate::similarity::SimilarityError> {
        crate::similarity::try_cosine_similarity(&self.values, &other.values)
    }
}

/// An enrolled face with metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceModel {
    pub id: String,
    pub label: String,
    pub embedding: Embedding,
    pub created_at: String,
}

/// Result of matching a query embedding against a gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub matched: bool,
    /// Cosine similarity of the best-scoring entry [-1, 1].
    pub similarity: f32,
    pub model_id: Option<String>,
    pub model_label: Option<String>,
}
