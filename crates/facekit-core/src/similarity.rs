//! Embedding similarity and gallery matching.
//!
//! Embeddings leave the extractor unit-norm, so the dot product is the
//! cosine similarity. The result is clamped to [-1, 1] to absorb
//! floating-point drift.

use crate::types::{Embedding, FaceModel, MatchResult};
use thiserror::Error;

/// Value returned by [`cosine_similarity`] for invalid input.
///
/// It is also the legitimate minimum similarity, so callers that need to
/// tell the two apart should use [`try_cosine_similarity`].
pub const SIMILARITY_ERROR_SENTINEL: f32 = -1.0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimilarityError {
    #[error("embedding lengths differ: {left} vs {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("embeddings are empty")]
    Empty,
}

/// Dot product of two equal-length embeddings, clamped to [-1, 1].
pub fn try_cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, SimilarityError> {
    if a.len() != b.len() {
        return Err(SimilarityError::LengthMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    if a.is_empty() {
        return Err(SimilarityError::Empty);
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Ok(dot.clamp(-1.0, 1.0))
}

/// Like [`try_cosine_similarity`], but returns [`SIMILARITY_ERROR_SENTINEL`]
/// for mismatched or empty input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    match try_cosine_similarity(a, b) {
        Ok(sim) => sim,
        Err(e) => {
            tracing::warn!(error = %e, "cosine similarity rejected input");
            SIMILARITY_ERROR_SENTINEL
        }
    }
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn compare(&self, query: &Embedding, gallery: &[FaceModel], threshold: f32) -> MatchResult;
}

/// Cosine similarity matcher.
///
/// Scores every gallery entry; entries whose dimension differs from the
/// query (e.g. enrolled with the 128-dim model) are skipped.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn compare(&self, query: &Embedding, gallery: &[FaceModel], threshold: f32) -> MatchResult {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_idx: Option<usize> = None;

        for (i, model) in gallery.iter().enumerate() {
            let sim = match query.similarity(&model.embedding) {
                Ok(sim) => sim,
                Err(e) => {
                    tracing::debug!(
                        id = %model.id,
                        error = %e,
                        "skipping incompatible gallery entry"
                    );
                    continue;
                }
            };
            if sim > best_sim {
                best_sim = sim;
                best_idx = Some(i);
            }
        }

        match best_idx {
            Some(idx) if best_sim >= threshold => MatchResult {
                matched: true,
                similarity: best_sim,
                model_id: Some(gallery[idx].id.clone()),
                model_label: Some(gallery[idx].label.clone()),
            },
            _ => MatchResult {
                matched: false,
                similarity: if best_idx.is_none() { 0.0 } else { best_sim },
                model_id: None,
                model_label: None,
            },
        }
    }
}
