//! Embedding models via ONNX Runtime.
//!
//! Every model sees the same preprocessing: the face crop is resized to a
//! square input with bilinear filtering, normalised with a fixed mean and
//! std, and packed as a batch of one.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array4, ArrayView4};
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_INPUT_SIZE: u32 = 112;
const DEFAULT_MEAN: f32 = 127.5;
const DEFAULT_STD: f32 = 127.5;
const DEFAULT_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("model produced an empty output")]
    EmptyOutput,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Memory layout of the input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// `[1, 3, size, size]`
    #[default]
    Nchw,
    /// `[1, size, size, 3]`
    Nhwc,
}

/// Input contract shared by all embedding models of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preprocess {
    pub input_size: u32,
    pub layout: Layout,
    pub mean: f32,
    pub std: f32,
}

impl Default for Preprocess {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            layout: Layout::Nchw,
            mean: DEFAULT_MEAN,
            std: DEFAULT_STD,
        }
    }
}

/// Resize an RGB crop to the model input and pack it as a float tensor.
///
/// The crop is only read; the resized copy lives for the duration of this call.
pub fn preprocess(crop: &RgbImage, params: &Preprocess) -> Array4<f32> {
    let size = params.input_size;
    let resized = imageops::resize(crop, size, size, FilterType::Triangle);

    let s = size as usize;
    let mut tensor = match params.layout {
        Layout::Nchw => Array4::<f32>::zeros((1, 3, s, s)),
        Layout::Nhwc => Array4::<f32>::zeros((1, s, s, 3)),
    };

    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = (pixel[c] as f32 - params.mean) / params.std;
            match params.layout {
                Layout::Nchw => tensor[[0, c, y, x]] = value,
                Layout::Nhwc => tensor[[0, y, x, c]] = value,
            }
        }
    }

    tensor
}

/// L2-normalise in place. Zero vectors are left as they are.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|v| *v /= norm);
    }
}

/// A loaded embedding model: a batch of one preprocessed crop in, one vector out.
///
/// Implementations must be deterministic for identical input.
pub trait EmbeddingModel {
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError>;
}

/// Turns a model source (a file path) into a callable model.
pub trait ModelLoader {
    fn load(&self, source: &Path) -> Result<Box<dyn EmbeddingModel>, ModelError>;
}

/// Embedding model backed by an ONNX Runtime session.
pub struct OnnxEmbeddingModel {
    session: Session,
}

impl OnnxEmbeddingModel {
    pub fn load(model_path: &Path, intra_threads: usize) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self { session })
    }
}

impl EmbeddingModel for OnnxEmbeddingModel {
    fn run(&mut self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ModelError> {
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input)?])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if data.is_empty() {
            return Err(ModelError::EmptyOutput);
        }
        Ok(data.to_vec())
    }
}

/// Loads every source as an [`OnnxEmbeddingModel`].
#[derive(Debug, Clone)]
pub struct OnnxLoader {
    pub intra_threads: usize,
}

impl Default for OnnxLoader {
    fn default() -> Self {
        Self {
            intra_threads: DEFAULT_INTRA_THREADS,
        }
    }
}

impl ModelLoader for OnnxLoader {
    fn load(&self, source: &Path) -> Result<Box<dyn EmbeddingModel>, ModelError> {
        Ok(Box::new(OnnxEmbeddingModel::load(source, self.intra_threads)?))
    }
}
