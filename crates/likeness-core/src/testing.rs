//! Fakes shared by the unit tests.

use std::collections::VecDeque;
use std::path::Path;

use image::{Rgb, RgbImage};
use ndarray::{ArrayView4, Axis};

use crate::detector::{
    DetectedFace, DetectionOutput, DetectorError, FaceDetector, Gender, RawDetection,
};
use crate::model::{EmbeddingModel, ModelError, ModelLoader};
use crate::presentation::Presenter;
use crate::store::{FaceId, FaceRecord, FaceStore};

fn gradient_crop() -> RgbImage {
    RgbImage::from_fn(12, 10, |x, y| Rgb([(x * 20) as u8, (y * 25) as u8, 128]))
}

pub fn raw_face(face_score: f32) -> RawDetection {
    RawDetection {
        crop: Some(gradient_crop()),
        box_score: face_score,
        face_score,
        age: None,
        gender: Gender::Unknown,
        gender_score: 0.0,
        embedding: None,
    }
}

pub fn detected(source: &str) -> DetectedFace {
    DetectedFace {
        source_image: source.to_string(),
        crop: gradient_crop(),
        box_score: 0.9,
        face_score: 0.9,
        age: None,
        gender: Gender::Unknown,
        gender_score: 0.0,
        builtin_embedding: None,
    }
}

/// One image per vector, each holding a single face, with `space` active.
pub fn store_with_space(space: &str, vectors: &[Vec<f32>]) -> FaceStore {
    let mut store = FaceStore::new("detector");
    for (i, values) in vectors.iter().enumerate() {
        let name = format!("{i}.jpg");
        let image = store.push_image(name.as_str(), vec![detected(&name)]).unwrap();
        store
            .insert_embedding(FaceId::new(image, 0), space, values.clone())
            .unwrap();
    }
    store.switch_space(space).unwrap();
    store
}

/// Replays canned results, one per call. Once exhausted it reports no faces.
pub struct ScriptedDetector {
    script: VecDeque<Result<Vec<RawDetection>, String>>,
    pub calls: usize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Result<Vec<RawDetection>, String>>) -> Self {
        Self {
            script: script.into(),
            calls: 0,
        }
    }
}

impl FaceDetector for ScriptedDetector {
    async fn detect(&mut self, _image: &RgbImage) -> Result<DetectionOutput, DetectorError> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Ok(faces)) => Ok(DetectionOutput::now(faces)),
            Some(Err(msg)) => Err(DetectorError::InferenceFailed(msg)),
            None => Ok(DetectionOutput::now(Vec::new())),
        }
    }
}

/// Always returns the same vector.
pub struct FixedModel {
    values: Vec<f32>,
}

impl FixedModel {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }
}

impl EmbeddingModel for FixedModel {
    fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        Ok(self.values.clone())
    }
}

/// Per-channel means of an NCHW input followed by its height.
pub struct ChannelMeanModel;

impl EmbeddingModel for ChannelMeanModel {
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        let batch = input.index_axis(Axis(0), 0);
        let mut values: Vec<f32> = (0..3)
            .map(|c| batch.index_axis(Axis(0), c).mean().unwrap_or(0.0))
            .collect();
        values.push(input.shape()[2] as f32);
        Ok(values)
    }
}

pub struct FailingModel;

impl EmbeddingModel for FailingModel {
    fn run(&mut self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        Err(ModelError::InferenceFailed("scripted failure".into()))
    }
}

/// Produces a [`FixedModel`] for every path, except those containing `fail_on`.
#[derive(Default)]
pub struct FakeLoader {
    fail_on: Option<String>,
}

impl FakeLoader {
    pub fn failing_on(fragment: &str) -> Self {
        Self {
            fail_on: Some(fragment.to_string()),
        }
    }
}

impl ModelLoader for FakeLoader {
    fn load(&self, source: &Path) -> Result<Box<dyn EmbeddingModel>, ModelError> {
        let path = source.display().to_string();
        if self.fail_on.as_deref().is_some_and(|f| path.contains(f)) {
            return Err(ModelError::ModelNotFound(path));
        }
        Ok(Box::new(FixedModel::new(vec![1.0, 0.0])))
    }
}

#[derive(Default)]
pub struct RecordingPresenter {
    pub progress: Vec<String>,
    pub rendered: Vec<(FaceId, Option<f32>)>,
}

impl Presenter for RecordingPresenter {
    fn report_progress(&mut self, text: &str) {
        self.progress.push(text.to_string());
    }

    fn render_face(&mut self, face: &FaceRecord, score: Option<f32>) {
        self.rendered.push((face.id(), score));
    }
}
