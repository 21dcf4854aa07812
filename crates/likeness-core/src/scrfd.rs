//! SCRFD face detector via ONNX Runtime.
//!
//! 3-stride anchor decoding with NMS. Optionally paired with an ArcFace
//! recognizer, in which case every face with landmarks also carries an
//! aligned, L2-normalised built-in embedding.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use crate::alignment;
use crate::detector::{DetectionOutput, DetectorError, FaceDetector, Gender, RawDetection};
use crate::model::{self, EmbeddingModel, OnnxEmbeddingModel, Preprocess};

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_DEFAULT_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;
const INTRA_THREADS: usize = 2;

/// Maps letterboxed model coordinates back onto the source image.
///
/// The pads are the whole-pixel offsets at which the resized image is
/// written into the tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Letterbox {
    scale: f32,
    pad_x: usize,
    pad_y: usize,
}

impl Letterbox {
    fn fit(width: u32, height: u32, size: usize) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).clamp(1, size);
        let new_h = ((height as f32 * scale).round() as usize).clamp(1, size);
        Self {
            scale,
            pad_x: (size - new_w) / 2,
            pad_y: (size - new_h) / 2,
        }
    }

    fn to_image(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// A decoded detection in source-image coordinates.
#[derive(Debug, Clone, PartialEq)]
struct FaceBox {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    landmarks: Option<[(f32, f32); 5]>,
}

impl FaceBox {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

pub struct ScrfdDetector {
    session: Session,
    stride_indices: [StrideOutputIndices; 3],
    score_threshold: f32,
    recognizer: Option<OnnxEmbeddingModel>,
}

impl ScrfdDetector {
    pub fn load(model_path: &Path) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(INTRA_THREADS)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_indices,
            score_threshold: SCRFD_DEFAULT_SCORE_THRESHOLD,
            recognizer: None,
        })
    }

    /// Keep candidates scoring at least `threshold` before NMS.
    pub fn with_score_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn score_threshold(&self) -> f32 {
        self.score_threshold
    }

    /// Attach an ArcFace recognizer for the built-in embedding.
    pub fn with_recognizer(mut self, model_path: &Path) -> Result<Self, DetectorError> {
        self.recognizer = Some(OnnxEmbeddingModel::load(model_path, INTRA_THREADS)?);
        Ok(self)
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
        let (input, letterbox) = letterbox_tensor(image, SCRFD_INPUT_SIZE);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        let strides = SCRFD_STRIDES.iter().zip(&self.stride_indices);
        for (&stride, &(score_idx, bbox_idx, kps_idx)) in strides {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };
            let scores = extract(score_idx, "scores")?;
            let bboxes = extract(bbox_idx, "bboxes")?;
            let kps = extract(kps_idx, "kps")?;

            candidates.extend(decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                SCRFD_INPUT_SIZE,
                &letterbox,
                self.score_threshold,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }

    fn embed(
        &mut self,
        image: &RgbImage,
        face: &FaceBox,
    ) -> Result<Option<Vec<f32>>, DetectorError> {
        let (Some(recognizer), Some(landmarks)) =
            (self.recognizer.as_mut(), face.landmarks.as_ref())
        else {
            return Ok(None);
        };
        let aligned = alignment::align_face(image, landmarks);
        // ArcFace input: 112x112 NCHW, symmetric 127.5 normalisation.
        let input = model::preprocess(&aligned, &Preprocess::default());
        let mut values = recognizer.run(input.view())?;
        model::l2_normalize(&mut values);
        Ok(Some(values))
    }
}

impl FaceDetector for ScrfdDetector {
    async fn detect(&mut self, image: &RgbImage) -> Result<DetectionOutput, DetectorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(DetectionOutput::now(Vec::new()));
        }

        let boxes = self.locate(image)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for face in &boxes {
            faces.push(RawDetection {
                crop: crop_region(image, face),
                box_score: face.score,
                face_score: face.score,
                age: None,
                gender: Gender::Unknown,
                gender_score: 0.0,
                embedding: self.embed(image, face)?,
            });
        }
        Ok(DetectionOutput::now(faces))
    }
}

/// Letterbox `image` into a `size`×`size` NCHW tensor. Padding normalises to 0.
fn letterbox_tensor(image: &RgbImage, size: usize) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(image.width(), image.height(), size);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).clamp(1, size as u32);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = (x as usize + letterbox.pad_x, y as usize + letterbox.pad_y);
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Cut the face out of `image`, clamping the box to the image bounds.
/// `None` when nothing of the box lies inside the image.
fn crop_region(image: &RgbImage, face: &FaceBox) -> Option<RgbImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    if !(face.x1.is_finite() && face.y1.is_finite() && face.x2.is_finite() && face.y2.is_finite()) {
        return None;
    }
    let x1 = face.x1.clamp(0.0, w).floor();
    let y1 = face.y1.clamp(0.0, h).floor();
    let x2 = face.x2.clamp(0.0, w).ceil();
    let y2 = face.y2.clamp(0.0, h).ceil();
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    let crop = imageops::crop_imm(image, x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32);
    Some(crop.to_image())
}

/// Locate the score/bbox/kps tensors of each stride by name ("score_8",
/// "bbox_16", ...). Exports with generic names use the positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some((
                find("score", stride)?,
                find("bbox", stride)?,
                find("kps", stride)?,
            ))
        })
        .collect();

    match named.and_then(|v| <[StrideOutputIndices; 3]>::try_from(v).ok()) {
        Some(indices) => indices,
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode one stride's anchors, keeping those with `score >= threshold`.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<FaceBox> {
    let grid = input_size / stride;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let step = stride as f32;

    let mut out = Vec::new();
    for idx in 0..anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score.is_nan() || score < threshold {
            continue;
        }
        let Some(d) = bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid) as f32 * step;
        let ay = (cell / grid) as f32 * step;

        let (x1, y1) = letterbox.to_image((ax - d[0] * step, ay - d[1] * step));
        let (x2, y2) = letterbox.to_image((ax + d[2] * step, ay + d[3] * step));

        let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| {
                letterbox.to_image((ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
            })
        });

        out.push(FaceBox {
            x1,
            y1,
            x2,
            y2,
            score,
            landmarks,
        });
    }
    out
}

/// Greedy non-maximum suppression; survivors are returned best-first.
fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let inter_w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let inter_h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
