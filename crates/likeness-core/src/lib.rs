//! Face-similarity comparison across embedding models.
//!
//! Faces are extracted from a batch of images, embedded by every loaded
//! ONNX model, and ranked against a query face within one selected
//! embedding space at a time.

pub mod alignment;
pub mod config;
pub mod detector;
pub mod driver;
pub mod model;
pub mod presentation;
pub mod ranking;
pub mod registry;
pub mod scrfd;
pub mod session;
pub mod source;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::PipelineConfig;
pub use detector::{DetectedFace, DetectionAdapter, FaceDetector, Gender, RawDetection};
pub use model::{EmbeddingModel, Layout, ModelLoader, OnnxLoader, Preprocess};
pub use presentation::{Presenter, UiEvent};
pub use ranking::{Metric, Ranked};
pub use registry::ModelRegistry;
pub use scrfd::ScrfdDetector;
pub use session::{BatchError, BatchRun};
pub use source::{FsImageSource, ImageSource};
pub use store::{FaceId, FaceRecord, FaceStore};
