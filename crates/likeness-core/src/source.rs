//! Image sources and input discovery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to read {path}: {err}")]
    Io {
        path: String,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to decode {path}: {err}")]
    Decode {
        path: String,
        #[source]
        err: image::ImageError,
    },
    #[error("no image named {0:?}")]
    NotFound(String),
}

/// Case-insensitive suffix check, `suffixes` given without the dot.
pub fn has_suffix(path: &Path, suffixes: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| suffixes.iter().any(|s| s.eq_ignore_ascii_case(ext)))
}

/// Keep the paths whose suffix is in `suffixes`, preserving order.
pub fn filter_by_suffix<P: AsRef<Path>>(paths: Vec<P>, suffixes: &[String]) -> Vec<P> {
    paths
        .into_iter()
        .filter(|p| has_suffix(p.as_ref(), suffixes))
        .collect()
}

/// List the matching files of `dir`, sorted by path so runs are reproducible.
pub async fn list_dir(dir: &Path, suffixes: &[String]) -> Result<Vec<PathBuf>, SourceError> {
    let io_err = |err| SourceError::Io {
        path: dir.display().to_string(),
        err,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io_err)?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(filter_by_suffix(paths, suffixes))
}

/// Where batch images come from.
#[allow(async_fn_in_trait)]
pub trait ImageSource {
    /// Load and decode one image as RGB.
    async fn load(&mut self, id: &str) -> Result<RgbImage, SourceError>;
}

/// Loads images from the local filesystem, `id` being the path.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsImageSource;

impl ImageSource for FsImageSource {
    async fn load(&mut self, id: &str) -> Result<RgbImage, SourceError> {
        let bytes = tokio::fs::read(id).await.map_err(|err| SourceError::Io {
            path: id.to_string(),
            err,
        })?;
        let image = image::load_from_memory(&bytes).map_err(|err| SourceError::Decode {
            path: id.to_string(),
            err,
        })?;
        Ok(image.to_rgb8())
    }
}

/// Preloaded images keyed by name.
#[derive(Debug, Default, Clone)]
pub struct MemorySource {
    images: HashMap<String, RgbImage>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, image: RgbImage) {
        self.images.insert(id.into(), image);
    }
}

impl ImageSource for MemorySource {
    async fn load(&mut self, id: &str) -> Result<RgbImage, SourceError> {
        self.images
            .get(id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(id.to_string()))
    }
}
