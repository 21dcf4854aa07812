use serde::{Deserialize, Serialize};

use crate::model::Preprocess;
use crate::ranking::Metric;

const DEFAULT_MIN_FACE_SCORE: f32 = 0.5;
const DEFAULT_BUILTIN_SPACE: &str = "detector";
const DEFAULT_MODEL_SUFFIX: &str = "onnx";

/// Settings for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Detections with a lower face score are dropped.
    pub min_face_score: f32,
    /// Space name for the detector's own embeddings.
    pub builtin_space: String,
    pub metric: Metric,
    pub preprocess: Preprocess,
    /// Recognized image file suffixes, without the dot.
    pub image_suffixes: Vec<String>,
    /// Recognized model file suffix, without the dot.
    pub model_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_face_score: DEFAULT_MIN_FACE_SCORE,
            builtin_space: DEFAULT_BUILTIN_SPACE.to_string(),
            metric: Metric::Distance,
            preprocess: Preprocess::default(),
            image_suffixes: vec!["jpg".into(), "jpeg".into(), "png".into()],
            model_suffix: DEFAULT_MODEL_SUFFIX.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reject settings no run could use.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.min_face_score) {
            return Err(format!(
                "min_face_score must be within [0, 1], got {}",
                self.min_face_score
            ));
        }
        if self.builtin_space.is_empty() {
            return Err("builtin_space must not be empty".into());
        }
        if self.preprocess.input_size == 0 {
            return Err("preprocess.input_size must be positive".into());
        }
        if !(self.preprocess.std.is_finite() && self.preprocess.std != 0.0) {
            return Err(format!(
                "preprocess.std must be finite and non-zero, got {}",
                self.preprocess.std
            ));
        }
        Ok(())
    }
}
