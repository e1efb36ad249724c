//! Face alignment via 4-DOF similarity transform.
//!
//! Warps a detected face so its five landmarks land on the ArcFace
//! 112×112 reference template, producing the input the embedding
//! extractor expects.

use crate::recognizer::EMBEDDING_INPUT_SIZE;
use crate::types::{CanonicalImage, Landmarks, CANONICAL_CHANNELS};
use thiserror::Error;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlignmentError {
    #[error("landmarks are degenerate (coincident points)")]
    DegenerateLandmarks,
}

/// Similarity transform `dst = [a -b; b a] * src + [tx, ty]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (self.a * x - self.b * y + self.tx, self.b * x + self.a * y + self.ty)
    }

    /// Inverse mapping, `None` when the transform collapses to a point.
    pub fn inverse(&self) -> Option<SimilarityTransform> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-10 {
            return None;
        }
        let ia = self.a / det;
        let ib = -self.b / det;
        Some(SimilarityTransform {
            a: ia,
            b: ib,
            tx: -(ia * self.tx - ib * self.ty),
            ty: -(ib * self.tx + ia * self.ty),
        })
    }
}

/// Least-squares similarity transform mapping `src` onto `dst`.
///
/// Both point sets are centred on their centroids; the rotation/scale pair
/// then has a closed form.
pub fn estimate_similarity_transform(
    src: &Landmarks,
    dst: &Landmarks,
) -> Result<SimilarityTransform, AlignmentError> {
    let n = src.len() as f32;
    let centroid = |pts: &Landmarks| {
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    };
    let (scx, scy) = centroid(src);
    let (dcx, dcy) = centroid(dst);

    let mut src_sq = 0.0f32;
    let mut a_num = 0.0f32;
    let mut b_num = 0.0f32;
    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst) {
        let (sx, sy) = (sx - scx, sy - scy);
        let (dx, dy) = (dx - dcx, dy - dcy);
        src_sq += sx * sx + sy * sy;
        a_num += sx * dx + sy * dy;
        b_num += sx * dy - sy * dx;
    }

    if src_sq < 1e-10 {
        return Err(AlignmentError::DegenerateLandmarks);
    }

    let a = a_num / src_sq;
    let b = b_num / src_sq;
    Ok(SimilarityTransform {
        a,
        b,
        tx: dcx - (a * scx - b * scy),
        ty: dcy - (b * scx + a * scy),
    })
}

/// Whether landmarks are usable: all finite and not all zero.
pub fn landmarks_valid(landmarks: &Landmarks) -> bool {
    let coords = landmarks.iter().flat_map(|&(x, y)| [x, y]);
    coords.clone().all(f32::is_finite) && coords.into_iter().any(|v| v != 0.0)
}

/// Align a face to a canonical 112×112 RGB crop.
pub fn align_face(
    image: &CanonicalImage,
    landmarks: &Landmarks,
) -> Result<CanonicalImage, AlignmentError> {
    let forward = estimate_similarity_transform(landmarks, &REFERENCE_LANDMARKS_112)?;
    let inverse = forward.inverse().ok_or(AlignmentError::DegenerateLandmarks)?;
    tracing::trace!(scale = forward.scale(), "alignment transform");

    let size = EMBEDDING_INPUT_SIZE;
    let data = warp_affine(image, &inverse, size as usize);
    CanonicalImage::new(size, size, data).map_err(|_| AlignmentError::DegenerateLandmarks)
}

/// Sample `out_size`² RGB pixels through `inverse` (output → source).
///
/// Bilinear interpolation; out-of-bounds pixels are black.
fn warp_affine(image: &CanonicalImage, inverse: &SimilarityTransform, out_size: usize) -> Vec<u8> {
    let w = image.width() as i32;
    let h = image.height() as i32;
    let mut output = vec![0u8; out_size * out_size * CANONICAL_CHANNELS];

    let sample = |x: i32, y: i32| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            image.pixel(x as usize, y as usize).map(f32::from)
        } else {
            [0.0; 3]
        }
    };

    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = inverse.apply((ox as f32, oy as f32));

            let x0 = sx.floor() as i32;
            let y0 = sy.floor() as i32;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let tl = sample(x0, y0);
            let tr = sample(x0 + 1, y0);
            let bl = sample(x0, y0 + 1);
            let br = sample(x0 + 1, y0 + 1);

            let off = (oy * out_size + ox) * CANONICAL_CHANNELS;
            for c in 0..CANONICAL_CHANNELS {
                let val = tl[c] * (1.0 - fx) * (1.0 - fy)
                    + tr[c] * fx * (1.0 - fy)
                    + bl[c] * (1.0 - fx) * fy
                    + br[c] * fx * fy;
                output[off + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_transform() {
        let t =
            estimate_similarity_transform(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112)
                .unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_transform() {
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.scale() - 0.5).abs() < 1e-3, "scale = {}", t.scale());
    }

    #[test]
    fn test_rotated_transform_recovers_template() {
        // Rotate the template 90° about the origin and shift it.
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (-y + 300.0, x + 50.0));
        let t = estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112).unwrap();
        for (s, r) in src.iter().zip(&REFERENCE_LANDMARKS_112) {
            let (x, y) = t.apply(*s);
            assert!((x - r.0).abs() < 1e-2 && (y - r.1).abs() < 1e-2, "({x}, {y}) vs {r:?}");
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = SimilarityTransform {
            a: 0.8,
            b: 0.3,
            tx: 12.0,
            ty: -4.0,
        };
        let inv = t.inverse().unwrap();
        let p = (37.0, 81.5);
        let (x, y) = inv.apply(t.apply(p));
        assert!((x - p.0).abs() < 1e-3 && (y - p.1).abs() < 1e-3);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let src = [(50.0, 50.0); 5];
        assert_eq!(
            estimate_similarity_transform(&src, &REFERENCE_LANDMARKS_112),
            Err(AlignmentError::DegenerateLandmarks)
        );
    }

    #[test]
    fn test_landmarks_valid() {
        assert!(landmarks_valid(&REFERENCE_LANDMARKS_112));
        assert!(!landmarks_valid(&[(0.0, 0.0); 5]));
        let mut bad = REFERENCE_LANDMARKS_112;
        bad[3].1 = f32::NAN;
        assert!(!landmarks_valid(&bad));
    }

    #[test]
    fn test_align_face_output_size() {
        let img = CanonicalImage::filled(640, 480, [128, 64, 32]).unwrap();
        let aligned = align_face(&img, &REFERENCE_LANDMARKS_112).unwrap();
        assert_eq!((aligned.width(), aligned.height()), (112, 112));
        // Template landmarks on a uniform image: the interior copies through.
        assert_eq!(aligned.pixel(56, 56), [128, 64, 32]);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut data = vec![0u8; w * h * 3];
        let src: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];

        // 5x5 red patch at the left eye
        let (lx, ly) = (src[0].0 as usize, src[0].1 as usize);
        for py in ly - 2..=ly + 2 {
            for px in lx - 2..=lx + 2 {
                data[(py * w + px) * 3] = 255;
            }
        }
        let img = CanonicalImage::new(w as u32, h as u32, data).unwrap();
        let aligned = align_face(&img, &src).unwrap();

        let rx = REFERENCE_LANDMARKS_112[0].0.round() as usize;
        let ry = REFERENCE_LANDMARKS_112[0].1.round() as usize;
        let mut max_red = 0u8;
        let mut max_green = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                let [r, g, _] = aligned.pixel(x, y);
                max_red = max_red.max(r);
                max_green = max_green.max(g);
            }
        }
        assert!(max_red > 100, "expected red patch near ({rx}, {ry}), max={max_red}");
        assert_eq!(max_green, 0);
    }
}
