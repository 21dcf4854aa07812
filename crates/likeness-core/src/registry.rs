//! Embedding model registry.
//!
//! Holds every model of a run in registration order, names each one after
//! its source file, and keeps running call/latency statistics.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

use crate::model::{self, EmbeddingModel, ModelError, ModelLoader, Preprocess};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to load model {path}: {err}")]
    Load {
        path: String,
        #[source]
        err: ModelError,
    },
    #[error("cannot derive a model name from {0:?}")]
    InvalidSource(String),
    #[error("model name {name:?} from {path} is already taken")]
    DuplicateName { name: String, path: String },
    #[error("no model named {0:?}")]
    UnknownModel(String),
    #[error("model {model} failed: {err}")]
    Inference {
        model: String,
        #[source]
        err: ModelError,
    },
}

/// Running statistics for one model.
///
/// The first call after loading is counted but not timed: warm-up cost is
/// not representative of steady-state latency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelStats {
    calls: u64,
    cumulative: Duration,
}

impl ModelStats {
    pub fn record(&mut self, elapsed: Duration) {
        if self.calls > 0 {
            self.cumulative += elapsed;
        }
        self.calls += 1;
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn cumulative_latency(&self) -> Duration {
        self.cumulative
    }

    /// Mean latency over timed calls, or `None` before the second call.
    pub fn mean_latency(&self) -> Option<Duration> {
        let timed = self.calls.saturating_sub(1);
        if timed == 0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            self.cumulative.as_secs_f64() / timed as f64,
        ))
    }
}

/// One row of the performance report.
#[derive(Debug, Clone, Serialize)]
pub struct StatsRow {
    pub name: String,
    pub calls: u64,
    pub mean_latency_ms: Option<f64>,
}

struct RegisteredModel {
    name: String,
    model: Box<dyn EmbeddingModel>,
    stats: ModelStats,
}

/// Derive a model name from its source: strip any directory prefix and
/// the file-type suffix. `models/arcface-r50.onnx` → `arcface-r50`.
pub fn model_name(source: &str) -> Option<String> {
    let file = source.rsplit(['/', '\\']).next().unwrap_or(source);
    let stem = match file.rfind('.') {
        Some(dot) if dot > 0 => &file[..dot],
        _ => file,
    };
    (!stem.is_empty()).then(|| stem.to_string())
}

/// Every embedding model of a run, in registration order.
pub struct ModelRegistry {
    models: Vec<RegisteredModel>,
    preprocess: Preprocess,
}

impl ModelRegistry {
    pub fn new(preprocess: Preprocess) -> Self {
        Self {
            models: Vec::new(),
            preprocess,
        }
    }

    /// Load every source with `loader`. Any failure aborts the whole load:
    /// there is no partial registry.
    pub fn load_all<L: ModelLoader + ?Sized>(
        sources: &[PathBuf],
        loader: &L,
        preprocess: Preprocess,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new(preprocess);

        for source in sources {
            let path = source.display().to_string();
            let name = model_name(&path).ok_or_else(|| RegistryError::InvalidSource(path.clone()))?;
            registry.ensure_unique(&name, &path)?;

            let start = Instant::now();
            let model = loader.load(source).map_err(|err| RegistryError::Load {
                path: path.clone(),
                err,
            })?;
            tracing::info!(
                model = %name,
                path = %path,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "embedding model registered"
            );

            registry.push(name, model);
        }

        Ok(registry)
    }

    /// Register an already loaded model under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        model: Box<dyn EmbeddingModel>,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        self.ensure_unique(&name, "<in-memory>")?;
        self.push(name, model);
        Ok(())
    }

    fn ensure_unique(&self, name: &str, path: &str) -> Result<(), RegistryError> {
        if self.contains(name) {
            return Err(RegistryError::DuplicateName {
                name: name.to_string(),
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn push(&mut self, name: String, model: Box<dyn EmbeddingModel>) {
        self.models.push(RegisteredModel {
            name,
            model,
            stats: ModelStats::default(),
        });
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.iter().any(|m| m.name == name)
    }

    /// Model names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }

    pub fn first_name(&self) -> Option<&str> {
        self.names().next()
    }

    pub fn preprocess(&self) -> &Preprocess {
        &self.preprocess
    }

    pub fn model_stats(&self, name: &str) -> Option<&ModelStats> {
        self.models.iter().find(|m| m.name == name).map(|m| &m.stats)
    }

    /// Embed one face crop with the model called `name`.
    pub fn apply(&mut self, name: &str, crop: &RgbImage) -> Result<Vec<f32>, RegistryError> {
        let entry = self
            .models
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| RegistryError::UnknownModel(name.to_string()))?;

        let input = model::preprocess(crop, &self.preprocess);
        let start = Instant::now();
        let values = entry
            .model
            .run(input.view())
            .map_err(|err| RegistryError::Inference {
                model: entry.name.clone(),
                err,
            })?;
        entry.stats.record(start.elapsed());

        Ok(values)
    }

    /// Per-model performance report in registration order.
    pub fn stats(&self) -> Vec<StatsRow> {
        self.models
            .iter()
            .map(|m| StatsRow {
                name: m.name.clone(),
                calls: m.stats.calls(),
                mean_latency_ms: m.stats.mean_latency().map(|d| d.as_secs_f64() * 1000.0),
            })
            .collect()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.names().collect::<Vec<_>>())
            .field("preprocess", &self.preprocess)
            .finish()
    }
}
