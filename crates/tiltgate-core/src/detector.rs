//! Face landmark detection.
//!
//! The pipeline only sees [`LandmarkDetector`]: a frame in, at most one face's
//! named landmarks out. [`ScrfdLandmarker`] is the bundled implementation,
//! running the InsightFace SCRFD detector through ONNX Runtime and keeping the
//! five keypoints of the most confident face.

use crate::types::{Landmark, LandmarkSet, Point};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// SCRFD keypoint order (image left to right): image-left eye, image-right eye,
/// nose, image-left mouth corner, image-right mouth corner.
const SCRFD_KEYPOINT_NAMES: [Landmark; 5] = [
    Landmark::RightEyeOuter,
    Landmark::LeftEyeOuter,
    Landmark::NoseTip,
    Landmark::MouthRight,
    Landmark::MouthLeft,
];

/// File name of the SCRFD model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface and place it in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Per-frame facial landmark inference for at most one face.
pub trait LandmarkDetector: Send {
    /// Run inference on a grayscale frame.
    ///
    /// `timestamp_ms` must increase strictly between calls on one instance.
    /// Returns `Ok(None)` when no face is found.
    fn infer(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkSet>, DetectorError>;

    /// Release model resources. The detector is not used afterwards.
    fn close(&mut self) {}
}

/// Creates detector instances; the `init(modelRef)` half of the capability.
pub trait DetectorLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError>;
}

/// Loads [`ScrfdLandmarker`] from a model directory.
pub struct ScrfdLoader {
    model_path: PathBuf,
}

impl ScrfdLoader {
    pub fn new(model_dir: impl AsRef<Path>) -> Self {
        Self {
            model_path: model_dir.as_ref().join(SCRFD_MODEL_FILE),
        }
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }
}

impl DetectorLoader for ScrfdLoader {
    fn load(&self) -> Result<Box<dyn LandmarkDetector>, DetectorError> {
        let detector = ScrfdLandmarker::load(&self.model_path.to_string_lossy())?;
        Ok(Box::new(detector))
    }
}

/// A decoded face candidate in source-frame pixel coordinates.
#[derive(Debug, Clone)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    keypoints: [(f32, f32); 5],
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Scale and padding applied when fitting the frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    /// Map a point in model-input space back to the source frame.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices (score, bbox, kps) for one stride.
type StrideOutputs = (usize, usize, usize);

/// SCRFD face detector reduced to a single-face landmark source.
pub struct ScrfdLandmarker {
    session: Option<Session>,
    outputs: [StrideOutputs; 3],
    last_timestamp_ms: Option<u64>,
}

impl ScrfdLandmarker {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                names.len()
            )));
        }

        let outputs = output_layout(&names);
        tracing::info!(path = model_path, ?outputs, "loaded SCRFD landmark model");

        Ok(Self {
            session: Some(session),
            outputs,
            last_timestamp_ms: None,
        })
    }

    /// Build the NCHW input tensor: bilinear letterbox resize, gray replicated to RGB.
    fn preprocess(frame: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
        let lb = Letterbox::fit(width, height, SCRFD_INPUT_SIZE);
        let new_w = (width as f32 * lb.scale).round() as usize;
        let new_h = (height as f32 * lb.scale).round() as usize;
        let off_x = lb.pad_x.floor() as usize;
        let off_y = lb.pad_y.floor() as usize;

        // Padding normalizes to exactly 0.0, so start from zeros.
        let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
        let inv = 1.0 / lb.scale;

        for y in 0..new_h {
            let sy = ((y as f32 + 0.5) * inv - 0.5).clamp(0.0, (height - 1) as f32);
            let y0 = sy.floor() as usize;
            let y1 = (y0 + 1).min(height - 1);
            let fy = sy - y0 as f32;

            for x in 0..new_w {
                let sx = ((x as f32 + 0.5) * inv - 0.5).clamp(0.0, (width - 1) as f32);
                let x0 = sx.floor() as usize;
                let x1 = (x0 + 1).min(width - 1);
                let fx = sx - x0 as f32;

                let top = frame[y0 * width + x0] as f32 * (1.0 - fx) + frame[y0 * width + x1] as f32 * fx;
                let bot = frame[y1 * width + x0] as f32 * (1.0 - fx) + frame[y1 * width + x1] as f32 * fx;
                let v = ((top * (1.0 - fy) + bot * fy) - SCRFD_MEAN) / SCRFD_STD;

                let (ty, tx) = (y + off_y, x + off_x);
                if ty < SCRFD_INPUT_SIZE && tx < SCRFD_INPUT_SIZE {
                    for c in 0..3 {
                        tensor[[0, c, ty, tx]] = v;
                    }
                }
            }
        }

        (tensor, lb)
    }
}

impl LandmarkDetector for ScrfdLandmarker {
    fn infer(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
        timestamp_ms: u64,
    ) -> Result<Option<LandmarkSet>, DetectorError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| DetectorError::InferenceFailed("detector closed".into()))?;

        if let Some(prev) = self.last_timestamp_ms {
            if timestamp_ms <= prev {
                return Err(DetectorError::InferenceFailed(format!(
                    "non-monotonic timestamp {timestamp_ms} ms (previous {prev} ms)"
                )));
            }
        }
        self.last_timestamp_ms = Some(timestamp_ms);

        let (w, h) = (width as usize, height as usize);
        if w == 0 || h == 0 || frame.len() < w * h {
            return Err(DetectorError::InferenceFailed(format!(
                "frame buffer of {} bytes does not hold {w}x{h}",
                frame.len()
            )));
        }

        let (input, lb) = Self::preprocess(frame, w, h);
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (si, bi, ki) = self.outputs[slot];
            let (_, scores) = outputs[si]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bi]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[ki]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, kps, stride, &lb));
        }

        let best = suppress(candidates, SCRFD_NMS_THRESHOLD).into_iter().next();
        tracing::trace!(timestamp_ms, found = best.is_some(), "SCRFD inference");

        Ok(best.map(|face| to_landmarks(&face, width as f32, height as f32)))
    }

    fn close(&mut self) {
        if self.session.take().is_some() {
            tracing::debug!("SCRFD session released");
        }
    }
}

/// Map output names to per-stride indices.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// bare numbers, in which case the order is scores 8/16/32, bboxes, kps.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |kind: &str, stride: usize| {
        let target = format!("{kind}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional layout");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode anchors above the confidence threshold for one stride.
fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    kps: &[f32],
    stride: usize,
    lb: &Letterbox,
) -> Vec<Candidate> {
    let grid_w = SCRFD_INPUT_SIZE / stride;
    let cells = grid_w * (SCRFD_INPUT_SIZE / stride);
    let s = stride as f32;

    (0..cells * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let b = boxes.get(idx * 4..idx * 4 + 4)?;
            let k = kps.get(idx * 10..idx * 10 + 10)?;

            let (x1, y1) = lb.unmap(ax - b[0] * s, ay - b[1] * s);
            let (x2, y2) = lb.unmap(ax + b[2] * s, ay + b[3] * s);
            let keypoints =
                std::array::from_fn(|i| lb.unmap(ax + k[i * 2] * s, ay + k[i * 2 + 1] * s));

            Some(Candidate {
                x1,
                y1,
                x2,
                y2,
                score,
                keypoints,
            })
        })
        .collect()
}

fn overlap(a: &Candidate, b: &Candidate) -> f32 {
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression; result is sorted by descending score.
fn suppress(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| overlap(k, &c) <= iou_threshold) {
            kept.push(c);
        }
    }
    kept
}

fn to_landmarks(face: &Candidate, width: f32, height: f32) -> LandmarkSet {
    let mut set = LandmarkSet::new();
    for (name, &(x, y)) in SCRFD_KEYPOINT_NAMES.iter().zip(face.keypoints.iter()) {
        set.push(*name, Point::new(x / width, y / height));
    }
    set
}
