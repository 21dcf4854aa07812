use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use likeness_core::PipelineConfig;
use serde::Deserialize;

const DEFAULT_DETECTOR_FILE: &str = "det_10g.onnx";

/// CLI configuration: defaults, then the TOML file, then `LIKENESS_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the batch images.
    pub image_dir: PathBuf,
    /// Directory holding the embedding models.
    pub model_dir: PathBuf,
    /// SCRFD model. Defaults to `det_10g.onnx` inside `model_dir`.
    pub detector_model: Option<PathBuf>,
    /// ArcFace model for the detector's built-in embedding. None disables it.
    pub recognizer_model: Option<PathBuf>,
    /// ONNX Runtime intra-op threads per model.
    pub intra_threads: usize,
    pub pipeline: PipelineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            image_dir: PathBuf::from("images"),
            model_dir: PathBuf::from("models"),
            detector_model: None,
            recognizer_model: None,
            intra_threads: 2,
            pipeline: PipelineConfig::default(),
        }
    }
}

/// Flags that override the file and environment.
#[derive(Args, Debug, Clone, Default)]
pub struct Overrides {
    /// Directory of images to compare
    #[arg(long, global = true)]
    pub image_dir: Option<PathBuf>,
    /// Directory of ONNX embedding models
    #[arg(long, global = true)]
    pub model_dir: Option<PathBuf>,
    /// SCRFD detector model
    #[arg(long, global = true)]
    pub detector: Option<PathBuf>,
    /// ArcFace recognizer for the detector's own embedding
    #[arg(long, global = true)]
    pub recognizer: Option<PathBuf>,
    /// Minimum face score for a detection to be kept
    #[arg(long, global = true)]
    pub min_face_score: Option<f32>,
}

impl Config {
    /// Build the configuration from defaults, `path` and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `LIKENESS_*` variables. Unparsable values are ignored with a warning.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("LIKENESS_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIKENESS_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LIKENESS_DETECTOR_MODEL") {
            self.detector_model = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("LIKENESS_RECOGNIZER_MODEL") {
            self.recognizer_model = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed(&lookup, "LIKENESS_MIN_FACE_SCORE") {
            self.pipeline.min_face_score = v;
        }
        if let Some(v) = parsed(&lookup, "LIKENESS_METRIC") {
            self.pipeline.metric = v;
        }
    }

    pub fn apply_overrides(&mut self, flags: &Overrides) {
        if let Some(dir) = &flags.image_dir {
            self.image_dir = dir.clone();
        }
        if let Some(dir) = &flags.model_dir {
            self.model_dir = dir.clone();
        }
        if let Some(path) = &flags.detector {
            self.detector_model = Some(path.clone());
        }
        if let Some(path) = &flags.recognizer {
            self.recognizer_model = Some(path.clone());
        }
        if let Some(score) = flags.min_face_score {
            self.pipeline.min_face_score = score;
        }
    }

    pub fn detector_path(&self) -> PathBuf {
        self.detector_model
            .clone()
            .unwrap_or_else(|| self.model_dir.join(DEFAULT_DETECTOR_FILE))
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use likeness_core::Metric;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.detector_path(), PathBuf::from("models/det_10g.onnx"));
        assert_eq!(config.recognizer_model, None);
        assert_eq!(config.pipeline, PipelineConfig::default());
    }

    #[test]
    fn test_toml_partial_file() {
        let config = Config::from_toml(
            r#"
            image_dir = "photos"

            [pipeline]
            min_face_score = 0.7
            metric = "similarity"

            [pipeline.preprocess]
            input_size = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.image_dir, PathBuf::from("photos"));
        assert_eq!(config.model_dir, PathBuf::from("models"));
        assert_eq!(config.pipeline.min_face_score, 0.7);
        assert_eq!(config.pipeline.metric, Metric::Similarity);
        assert_eq!(config.pipeline.preprocess.input_size, 128);
        assert_eq!(config.pipeline.preprocess.mean, 127.5);
    }

    #[test]
    fn test_toml_rejects_bad_metric() {
        assert!(Config::from_toml("[pipeline]\nmetric = \"cosine\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("model_dir = \"from-file\"").unwrap();
        config.apply_env(env(&[
            ("LIKENESS_MODEL_DIR", "/opt/models"),
            ("LIKENESS_METRIC", "Similarity"),
            ("LIKENESS_MIN_FACE_SCORE", "0.25"),
            ("LIKENESS_RECOGNIZER_MODEL", "/opt/models/w600k_r50.onnx"),
        ]));
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.pipeline.metric, Metric::Similarity);
        assert_eq!(config.pipeline.min_face_score, 0.25);
        assert_eq!(
            config.recognizer_model,
            Some(PathBuf::from("/opt/models/w600k_r50.onnx"))
        );
        assert_eq!(config.detector_path(), PathBuf::from("/opt/models/det_10g.onnx"));
    }

    #[test]
    fn test_env_ignores_garbage() {
        let mut config = Config::default();
        config.apply_env(env(&[
            ("LIKENESS_MIN_FACE_SCORE", "high"),
            ("LIKENESS_METRIC", "cosine"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_flags_win() {
        let mut config = Config::default();
        config.apply_env(env(&[("LIKENESS_IMAGE_DIR", "env-images")]));
        config.apply_overrides(&Overrides {
            image_dir: Some(PathBuf::from("flag-images")),
            detector: Some(PathBuf::from("/tmp/scrfd.onnx")),
            min_face_score: Some(0.9),
            ..Overrides::default()
        });
        assert_eq!(config.image_dir, PathBuf::from("flag-images"));
        assert_eq!(config.detector_path(), PathBuf::from("/tmp/scrfd.onnx"));
        assert_eq!(config.pipeline.min_face_score, 0.9);
    }
}
