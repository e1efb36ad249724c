//! Flat float encoding of detection lists.
//!
//! Layout: `[N, det0..., det1..., ...]` where each detection occupies 15
//! consecutive slots:
//!
//! ```text
//! x, y, width, height, prob, lm0.x, lm0.y, lm1.x, lm1.y, lm2.x, lm2.y, lm3.x, lm3.y, lm4.x, lm4.y
//! ```
//!
//! The total length is always `1 + 15 * N`; zero detections encode as `[0.0]`.

use crate::types::{Detection, Landmarks};
use thiserror::Error;

/// Slots per encoded detection: 4 box + 1 score + 5 × 2 landmark coordinates.
pub const VALUES_PER_DETECTION: usize = 15;
const LANDMARK_OFFSET: usize = 5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("detection buffer is empty")]
    Empty,
    #[error("invalid detection count: {0}")]
    InvalidCount(f32),
    #[error("detection buffer truncated: expected {expected} values, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Length of the encoding of `count` detections, saturating at `usize::MAX`.
pub fn encoded_len(count: usize) -> usize {
    count.saturating_mul(VALUES_PER_DETECTION).saturating_add(1)
}

/// Serialize detections into the count-prefixed flat layout.
pub fn encode(detections: &[Detection]) -> Vec<f32> {
    let mut out = Vec::with_capacity(encoded_len(detections.len()));
    out.push(detections.len() as f32);

    for det in detections {
        out.extend_from_slice(&[det.x, det.y, det.width, det.height, det.confidence]);
        for &(lx, ly) in &det.landmarks {
            out.push(lx);
            out.push(ly);
        }
    }

    out
}

/// Parse a buffer produced by [`encode`].
///
/// Values past the last declared detection are ignored.
pub fn decode(buffer: &[f32]) -> Result<Vec<Detection>, CodecError> {
    let count = read_count(buffer)?;
    let expected = encoded_len(count);
    if buffer.len() < expected {
        return Err(CodecError::Truncated {
            expected,
            actual: buffer.len(),
        });
    }

    Ok(buffer[1..expected]
        .chunks_exact(VALUES_PER_DETECTION)
        .map(decode_one)
        .collect())
}

/// Landmarks of the detection at `index`, without decoding the rest.
pub fn landmarks_at(buffer: &[f32], index: usize) -> Option<Landmarks> {
    let count = read_count(buffer).ok()?;
    if index >= count {
        return None;
    }
    let start = index.checked_mul(VALUES_PER_DETECTION)?.checked_add(1)?;
    let record = buffer.get(start..start.checked_add(VALUES_PER_DETECTION)?)?;
    Some(decode_one(record).landmarks)
}

fn read_count(buffer: &[f32]) -> Result<usize, CodecError> {
    let &raw = buffer.first().ok_or(CodecError::Empty)?;
    if !raw.is_finite() || raw < 0.0 || raw.fract() != 0.0 {
        return Err(CodecError::InvalidCount(raw));
    }
    Ok(raw as usize)
}

fn decode_one(record: &[f32]) -> Detection {
    let lm = &record[LANDMARK_OFFSET..];
    Detection {
        x: record[0],
        y: record[1],
        width: record[2],
        height: record[3],
        confidence: record[4],
        landmarks: std::array::from_fn(|i| (lm[i * 2], lm[i * 2 + 1])),
    }
}
