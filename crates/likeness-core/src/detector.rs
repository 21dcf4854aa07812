//! Detection adapter: turns raw detector output into store-ready faces.
//!
//! The detector itself is an external collaborator behind [`FaceDetector`].
//! The adapter owns the filtering policy: detections without a usable crop,
//! or with a face score below the configured minimum, never reach the store.

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ModelError;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("built-in embedding: {0}")]
    Embedding(#[from] ModelError),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Categorical gender estimate reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
    #[default]
    Unknown,
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Gender::Female => "female",
            Gender::Male => "male",
            Gender::Unknown => "unknown",
        })
    }
}

/// One face as reported by a detector, before filtering.
#[derive(Debug, Clone)]
pub struct RawDetection {
    /// Face region in RGB order. `None` when the detector could not materialize it.
    pub crop: Option<RgbImage>,
    pub box_score: f32,
    pub face_score: f32,
    pub age: Option<f32>,
    pub gender: Gender,
    pub gender_score: f32,
    /// The detector's own embedding of this face, if it computes one.
    pub embedding: Option<Vec<f32>>,
}

/// Everything a detector returns for one image.
#[derive(Debug, Clone)]
pub struct DetectionOutput {
    pub faces: Vec<RawDetection>,
    pub detected_at: DateTime<Utc>,
}

impl DetectionOutput {
    pub fn now(faces: Vec<RawDetection>) -> Self {
        Self {
            faces,
            detected_at: Utc::now(),
        }
    }
}

/// A face that passed the filter. The crop is owned by this record from here on.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub source_image: String,
    pub crop: RgbImage,
    pub box_score: f32,
    pub face_score: f32,
    pub age: Option<f32>,
    pub gender: Gender,
    pub gender_score: f32,
    pub builtin_embedding: Option<Vec<f32>>,
}

/// External face detector/localizer.
#[allow(async_fn_in_trait)]
pub trait FaceDetector {
    async fn detect(&mut self, image: &RgbImage) -> Result<DetectionOutput, DetectorError>;
}

/// Wraps a [`FaceDetector`] with the minimum-confidence filter.
pub struct DetectionAdapter<D> {
    detector: D,
    min_face_score: f32,
}

impl<D: FaceDetector> DetectionAdapter<D> {
    pub fn new(detector: D, min_face_score: f32) -> Self {
        Self {
            detector,
            min_face_score,
        }
    }

    pub fn min_face_score(&self) -> f32 {
        self.min_face_score
    }

    /// Detect faces in `image`, keeping only those worth storing.
    pub async fn detect(
        &mut self,
        source: &str,
        image: &RgbImage,
    ) -> Result<Vec<DetectedFace>, DetectorError> {
        let output = self.detector.detect(image).await?;
        let reported = output.faces.len();
        let kept = filter_detections(source, output.faces, self.min_face_score);

        tracing::debug!(
            image = source,
            reported,
            kept = kept.len(),
            detected_at = %output.detected_at,
            "detection finished"
        );

        Ok(kept)
    }
}

/// Drop detections without a non-empty crop or with `face_score < min_face_score`.
///
/// A score exactly at the minimum is kept. NaN scores are dropped.
pub fn filter_detections(
    source: &str,
    faces: Vec<RawDetection>,
    min_face_score: f32,
) -> Vec<DetectedFace> {
    faces
        .into_iter()
        .filter_map(|raw| {
            let crop = raw.crop.filter(|c| c.width() > 0 && c.height() > 0)?;
            if raw.face_score.is_nan() || raw.face_score < min_face_score {
                return None;
            }
            Some(DetectedFace {
                source_image: source.to_string(),
                crop,
                box_score: raw.box_score,
                face_score: raw.face_score,
                age: raw.age,
                gender: raw.gender,
                gender_score: raw.gender_score,
                builtin_embedding: raw.embedding,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{raw_face, ScriptedDetector};

    #[test]
    fn test_filter_keeps_score_at_minimum() {
        let kept = filter_detections("a.jpg", vec![raw_face(0.5)], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source_image, "a.jpg");
    }

    #[test]
    fn test_filter_drops_score_just_below_minimum() {
        let kept = filter_detections("a.jpg", vec![raw_face(0.5 - f32::EPSILON)], 0.5);
        assert!(kept.is_empty());
    }

    #[test]
    fn test_filter_drops_missing_crop() {
        let mut face = raw_face(0.9);
        face.crop = None;
        assert!(filter_detections("a.jpg", vec![face], 0.5).is_empty());
    }

    #[test]
    fn test_filter_drops_empty_crop() {
        let mut face = raw_face(0.9);
        face.crop = Some(RgbImage::new(0, 4));
        assert!(filter_detections("a.jpg", vec![face], 0.5).is_empty());
    }

    #[test]
    fn test_filter_drops_nan_score() {
        assert!(filter_detections("a.jpg", vec![raw_face(f32::NAN)], 0.0).is_empty());
    }

    #[test]
    fn test_filter_preserves_detector_order_and_metadata() {
        let mut first = raw_face(0.7);
        first.age = Some(31.0);
        first.gender = Gender::Female;
        first.gender_score = 0.8;
        first.embedding = Some(vec![1.0, 2.0]);
        let faces = vec![first, raw_face(0.1), raw_face(0.9)];

        let kept = filter_detections("b.jpg", faces, 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].face_score, 0.7);
        assert_eq!(kept[0].age, Some(31.0));
        assert_eq!(kept[0].gender, Gender::Female);
        assert_eq!(kept[0].builtin_embedding.as_deref(), Some(&[1.0, 2.0][..]));
        assert_eq!(kept[1].face_score, 0.9);
    }

    #[tokio::test]
    async fn test_adapter_applies_filter() {
        let detector = ScriptedDetector::new(vec![Ok(vec![raw_face(0.2), raw_face(0.6)])]);
        let mut adapter = DetectionAdapter::new(detector, 0.5);
        let image = RgbImage::new(16, 16);
        let faces = adapter.detect("c.jpg", &image).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].face_score, 0.6);
    }

    #[tokio::test]
    async fn test_adapter_propagates_detector_error() {
        let detector = ScriptedDetector::new(vec![Err("boom".into())]);
        let mut adapter = DetectionAdapter::new(detector, 0.5);
        let image = RgbImage::new(16, 16);
        let err = adapter.detect("c.jpg", &image).await.unwrap_err();
        assert!(matches!(err, DetectorError::InferenceFailed(_)));
    }
}
