//! SCRFD face detector.
//!
//! 3-stride anchor decoding with five-point landmarks and NMS
//! post-processing. Boxes and landmarks are returned in the input image's
//! pixel space.

use crate::engine::{
    EngineError, InferenceBackend, LoadOptions, LoadedModel, ModelArtifacts, NamedOutputs,
};
use crate::ort_backend::OrtBackend;
use crate::types::{CanonicalImage, Detection};
use ndarray::Array4;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_INPUT_NAME: &str = "input.1";
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const SCRFD_OUTPUTS: usize = 9;

/// Default detector variant (2.5 GFLOPs with keypoints).
pub const DEFAULT_VARIANT: &str = "2.5g_kps";
pub const DEFAULT_PROB_THRESHOLD: f32 = 0.5;
pub const DEFAULT_NMS_THRESHOLD: f32 = 0.45;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not loaded")]
    NotLoaded,
    #[error("failed to load detector model: {0}")]
    Load(#[source] EngineError),
    #[error("SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {0}")]
    UnsupportedModel(usize),
    #[error("detector inference failed: {0}")]
    Inference(#[source] EngineError),
}

/// Candidate and suppression thresholds, both in [0, 1].
///
/// Values are passed through to decoding and NMS unchecked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Minimum candidate confidence kept before suppression.
    pub prob: f32,
    /// IoU above which the lower-scoring box is suppressed.
    pub nms: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            prob: DEFAULT_PROB_THRESHOLD,
            nms: DEFAULT_NMS_THRESHOLD,
        }
    }
}

/// Artifact identifier for a SCRFD variant, e.g. `scrfd_2.5g_kps`.
pub fn model_id(variant: &str) -> String {
    format!("scrfd_{variant}")
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

struct LoadedDetector<M> {
    model: M,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
}

/// SCRFD face detector holding at most one loaded model.
pub struct FaceDetector<B: InferenceBackend = OrtBackend> {
    backend: B,
    loaded: Option<LoadedDetector<B::Model>>,
}

impl FaceDetector<OrtBackend> {
    /// Detector over ONNX Runtime.
    pub fn onnx() -> Self {
        Self::new(OrtBackend)
    }
}

impl<B: InferenceBackend> FaceDetector<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            loaded: None,
        }
    }

    /// Load `{model_dir}/scrfd_{variant}-opt.param` and `-opt.bin`.
    ///
    /// Idempotent while ready; leaves the detector unloaded on failure.
    pub fn load(
        &mut self,
        model_dir: impl AsRef<Path>,
        variant: &str,
        options: &LoadOptions,
    ) -> Result<(), DetectorError> {
        if self.loaded.is_some() {
            tracing::debug!(variant, "detector already loaded");
            return Ok(());
        }

        let artifacts = ModelArtifacts::locate(model_dir, &model_id(variant));
        let model = self
            .backend
            .load(&artifacts, options)
            .map_err(DetectorError::Load)?;

        let names = model.output_names();
        if names.len() < SCRFD_OUTPUTS {
            return Err(DetectorError::UnsupportedModel(names.len()));
        }
        let stride_indices = discover_output_indices(names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");
        tracing::info!(variant, threads = options.intra_threads, "detector ready");

        self.loaded = Some(LoadedDetector {
            model,
            stride_indices,
        });
        Ok(())
    }

    /// Detect faces, strongest first.
    pub fn detect(
        &mut self,
        image: &CanonicalImage,
        thresholds: Thresholds,
    ) -> Result<Vec<Detection>, DetectorError> {
        let loaded = self.loaded.as_mut().ok_or(DetectorError::NotLoaded)?;

        let (input, letterbox) = preprocess(image);
        let outputs = loaded
            .model
            .run(SCRFD_INPUT_NAME, input.view())
            .map_err(DetectorError::Inference)?;

        let mut candidates = Vec::new();
        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = loaded.stride_indices[stride_pos];
            let scores = output_at(&outputs, score_idx)?;
            let bboxes = output_at(&outputs, bbox_idx)?;
            let kps = output_at(&outputs, kps_idx)?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                &letterbox,
                thresholds.prob,
            ));
        }

        let result = nms(candidates, thresholds.nms);
        tracing::debug!(faces = result.len(), "detection complete");
        Ok(result)
    }

    pub fn release(&mut self) {
        if self.loaded.take().is_some() {
            tracing::info!("detector released");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.loaded.is_some()
    }
}

fn output_at(outputs: &NamedOutputs, idx: usize) -> Result<&[f32], DetectorError> {
    outputs
        .by_index(idx)
        .ok_or_else(|| {
            DetectorError::Inference(EngineError::MissingOutput(format!("output #{idx}")))
        })
}

/// Letterbox an RGB image into a normalized 640×640 NCHW tensor.
///
/// Bilinear resize keeping aspect ratio, centred; padding normalizes to 0.
fn preprocess(image: &CanonicalImage) -> (Array4<f32>, LetterboxInfo) {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let size = SCRFD_INPUT_SIZE;

    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
    let pad_x = (size - new_w) as f32 / 2.0;
    let pad_y = (size - new_h) as f32 / 2.0;
    let letterbox = LetterboxInfo {
        scale,
        pad_x,
        pad_y,
    };

    let resized = resize_bilinear(image, new_w, new_h);

    let x0 = pad_x.floor() as usize;
    let y0 = pad_y.floor() as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..new_h {
        for x in 0..new_w {
            let off = (y * new_w + x) * 3;
            for c in 0..3 {
                tensor[[0, c, y0 + y, x0 + x]] = (resized[off + c] as f32 - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Bilinear RGB resize (half-pixel centres).
fn resize_bilinear(image: &CanonicalImage, new_w: usize, new_h: usize) -> Vec<u8> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let scale_x = width as f32 / new_w as f32;
    let scale_y = height as f32 / new_h as f32;

    let mut out = vec![0u8; new_w * new_h * 3];
    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let (tl, tr) = (image.pixel(x0, y0), image.pixel(x1, y0));
            let (bl, br) = (image.pixel(x0, y1), image.pixel(x1, y1));

            for c in 0..3 {
                let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                out[(y * new_w + x) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Map output tensors to stride slots.
///
/// Uses `score_8`, `bbox_16`, `kps_32`-style names when all nine are
/// present, otherwise the standard positional order:
///   [0-2] = scores, [3-5] = bboxes, [6-8] = kps (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode candidates above `threshold` for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let grid_h = SCRFD_INPUT_SIZE / stride;
    let num_anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let unmap = |x: f32, y: f32| {
        (
            (x - letterbox.pad_x) / letterbox.scale,
            (y - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors.min(scores.len()) {
        let score = scores[idx];
        if score < threshold {
            continue;
        }

        let bbox_off = idx * 4;
        let kps_off = idx * 10;
        let (Some(b), Some(k)) = (
            bboxes.get(bbox_off..bbox_off + 4),
            kps.get(kps_off..kps_off + 10),
        ) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_x = (cell % grid_w) as f32 * s;
        let anchor_y = (cell / grid_w) as f32 * s;

        let (x1, y1) = unmap(anchor_x - b[0] * s, anchor_y - b[1] * s);
        let (x2, y2) = unmap(anchor_x + b[2] * s, anchor_y + b[3] * s);

        let landmarks =
            std::array::from_fn(|i| unmap(anchor_x + k[i * 2] * s, anchor_y + k[i * 2 + 1] * s));

        detections.push(Detection {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Non-Maximum Suppression: keep the highest-confidence box of each
/// overlapping group. Output is sorted by descending confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| k.iou(&det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayView4;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn make_det(x: f32, y: f32, w: f32, h: f32, conf: f32) -> Detection {
        Detection {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: [(0.0, 0.0); 5],
        }
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Fake SCRFD: one anchor at the centre of the stride-32 grid fires.
    struct FakeScrfd {
        names: Vec<String>,
        score: f32,
        loads: Arc<AtomicUsize>,
    }

    impl FakeScrfd {
        fn new(names: Vec<String>, score: f32) -> Self {
            Self {
                names,
                score,
                loads: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct FakeScrfdModel {
        names: Vec<String>,
        score: f32,
    }

    impl InferenceBackend for FakeScrfd {
        type Model = FakeScrfdModel;

        fn load(
            &self,
            _: &ModelArtifacts,
            _: &LoadOptions,
        ) -> Result<FakeScrfdModel, EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(FakeScrfdModel {
                names: self.names.clone(),
                score: self.score,
            })
        }
    }

    impl LoadedModel for FakeScrfdModel {
        fn output_names(&self) -> &[String] {
            &self.names
        }

        fn run(
            &mut self,
            input_name: &str,
            input: ArrayView4<'_, f32>,
        ) -> Result<NamedOutputs, EngineError> {
            assert_eq!(input_name, SCRFD_INPUT_NAME);
            assert_eq!(input.shape(), &[1, 3, 640, 640]);

            let mut out = NamedOutputs::new();
            for kind in ["score", "bbox", "kps"] {
                for stride in SCRFD_STRIDES {
                    let anchors = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
                    let width = match kind {
                        "score" => 1,
                        "bbox" => 4,
                        _ => 10,
                    };
                    let mut data = vec![0.0f32; anchors * width];
                    if stride == 32 {
                        // cell (10, 10) of the 20x20 grid, first anchor
                        let idx = (10 * 20 + 10) * SCRFD_ANCHORS_PER_CELL;
                        match kind {
                            "score" => data[idx] = self.score,
                            "bbox" => {
                                data[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0])
                            }
                            _ => {
                                data[idx * 10] = -0.5; // left eye x
                                data[idx * 10 + 2] = 0.5; // right eye x
                            }
                        }
                    }
                    out.push(format!("{kind}_{stride}"), data);
                }
            }
            Ok(out)
        }
    }

    fn scrfd_names() -> Vec<String> {
        let mut v = Vec::new();
        for kind in ["score", "bbox", "kps"] {
            for stride in SCRFD_STRIDES {
                v.push(format!("{kind}_{stride}"));
            }
        }
        v
    }

    fn loaded(score: f32) -> FaceDetector<FakeScrfd> {
        let mut det = FaceDetector::new(FakeScrfd::new(scrfd_names(), score));
        det.load("/models", DEFAULT_VARIANT, &LoadOptions::default()).unwrap();
        det
    }

    #[test]
    fn test_model_id() {
        assert_eq!(model_id("2.5g_kps"), "scrfd_2.5g_kps");
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_det(5.0, 5.0, 100.0, 100.0, 0.8),
            make_det(0.0, 0.0, 100.0, 100.0, 0.9),
            make_det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(detections, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].confidence - 0.9).abs() < 1e-6);
        assert!((result[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_threshold_controls_aggressiveness() {
        let detections = vec![
            make_det(0.0, 0.0, 10.0, 10.0, 0.9),
            make_det(5.0, 0.0, 10.0, 10.0, 0.8), // IoU = 1/3
        ];
        assert_eq!(nms(detections.clone(), 0.3).len(), 1);
        assert_eq!(nms(detections, 0.5).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let indices = discover_output_indices(&scrfd_names());
        assert_eq!(indices, [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names = names(&[
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]);
        let indices = discover_output_indices(&names);
        assert_eq!(indices[0], (2, 0, 1));
        assert_eq!(indices[1], (5, 3, 4));
        assert_eq!(indices[2], (8, 6, 7));
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (440 + i).to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_letterbox_wide_image() {
        let img = CanonicalImage::filled(320, 160, [127, 128, 200]).unwrap();
        let (tensor, lb) = preprocess(&img);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert_eq!(lb.pad_x, 0.0);
        assert_eq!(lb.pad_y, 160.0);
        // padding rows normalize to 0
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        // content keeps channel order
        let r = tensor[[0, 0, 320, 320]];
        let b = tensor[[0, 2, 320, 320]];
        assert!((r - (127.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((b - (200.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    #[test]
    fn test_resize_uniform_stays_uniform() {
        let img = CanonicalImage::filled(50, 30, [12, 34, 56]).unwrap();
        let out = resize_bilinear(&img, 100, 60);
        assert_eq!(out.len(), 100 * 60 * 3);
        assert!(out.chunks_exact(3).all(|p| p == [12, 34, 56]));
    }

    #[test]
    fn test_decode_stride_maps_to_image_space() {
        // 320x240 input: scale 2, pad_y = (640 - 480) / 2 = 80
        let lb = LetterboxInfo {
            scale: 2.0,
            pad_x: 0.0,
            pad_y: 80.0,
        };
        let stride = 32;
        let anchors = 20 * 20 * 2;
        let mut scores = vec![0.0; anchors];
        let mut bboxes = vec![0.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];
        // cell (x=5, y=5) second anchor
        let idx = (5 * 20 + 5) * 2 + 1;
        scores[idx] = 0.75;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 2.0]);

        let dets = decode_stride(&scores, &bboxes, &kps, stride, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // anchor at (160, 160) in letterbox space
        assert!((d.x - (160.0 - 32.0) / 2.0).abs() < 1e-4);
        assert!((d.y - (160.0 - 32.0 - 80.0) / 2.0).abs() < 1e-4);
        assert!((d.width - 96.0 / 2.0).abs() < 1e-4);
        assert!((d.height - 96.0 / 2.0).abs() < 1e-4);
        assert_eq!(d.landmarks[2], (80.0, 40.0));
    }

    #[test]
    fn test_decode_stride_respects_threshold() {
        let lb = LetterboxInfo {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let anchors = 20 * 20 * 2;
        let mut scores = vec![0.0; anchors];
        scores[0] = 0.49;
        scores[1] = 0.51;
        let bboxes = vec![0.0; anchors * 4];
        let kps = vec![0.0; anchors * 10];
        let dets = decode_stride(&scores, &bboxes, &kps, 32, &lb, 0.5);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].confidence, 0.51);
    }

    #[test]
    fn test_detect_end_to_end_with_fake_engine() {
        let mut det = loaded(0.9);
        let img = CanonicalImage::filled(640, 640, [90, 90, 90]).unwrap();
        let faces = det.detect(&img, Thresholds::default()).unwrap();
        assert_eq!(faces.len(), 1);
        let f = &faces[0];
        assert!((f.x - 288.0).abs() < 1e-4);
        assert!((f.y - 288.0).abs() < 1e-4);
        assert!((f.width - 64.0).abs() < 1e-4);
        assert!((f.height - 64.0).abs() < 1e-4);
        assert_eq!(f.confidence, 0.9);
        assert_eq!(f.landmarks[0], (304.0, 320.0));
        assert_eq!(f.landmarks[1], (336.0, 320.0));
    }

    #[test]
    fn test_detect_prob_threshold_filters() {
        let mut det = loaded(0.4);
        let img = CanonicalImage::filled(64, 64, [0, 0, 0]).unwrap();
        assert!(det.detect(&img, Thresholds::default()).unwrap().is_empty());
        let lenient = Thresholds {
            prob: 0.3,
            nms: 0.45,
        };
        assert_eq!(det.detect(&img, lenient).unwrap().len(), 1);
    }

    #[test]
    fn test_detect_requires_load() {
        let mut det = FaceDetector::new(FakeScrfd::new(scrfd_names(), 0.9));
        let img = CanonicalImage::filled(8, 8, [0, 0, 0]).unwrap();
        assert!(matches!(det.detect(&img, Thresholds::default()), Err(DetectorError::NotLoaded)));
    }

    #[test]
    fn test_load_rejects_model_without_keypoints() {
        let six = names(&["score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32"]);
        let mut det = FaceDetector::new(FakeScrfd::new(six, 0.9));
        let err = det.load("/models", "500m", &LoadOptions::default()).unwrap_err();
        assert!(matches!(err, DetectorError::UnsupportedModel(6)));
        assert!(!det.is_ready());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut det = loaded(0.9);
        det.release();
        det.release();
        assert!(!det.is_ready());
    }

    #[test]
    fn test_second_load_is_noop() {
        let backend = FakeScrfd::new(scrfd_names(), 0.9);
        let loads = backend.loads.clone();
        let mut det = FaceDetector::new(backend);

        det.load("/models", DEFAULT_VARIANT, &LoadOptions::default()).unwrap();
        det.load("/models", DEFAULT_VARIANT, &LoadOptions::default()).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(det.is_ready());

        det.release();
        det.load("/models", DEFAULT_VARIANT, &LoadOptions::default()).unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }
}
