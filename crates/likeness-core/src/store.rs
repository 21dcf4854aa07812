//! Ordered per-image face lists with named embedding spaces.
//!
//! Records are append-only: faces are added image by image during
//! ingestion and afterwards only their embedding fields change. A face is
//! addressed by its [`FaceId`], which stays valid for the whole run.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

use crate::detector::DetectedFace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("no face {0} in the store")]
    UnknownFace(FaceId),
    #[error("invalid face id {0:?}, expected <image>:<face>")]
    InvalidFaceId(String),
    #[error("embedding space {space:?} is missing for face {face}")]
    MissingSpace { space: String, face: FaceId },
    #[error("embedding space {space:?} holds {expected}-dim vectors, face {face} got {actual}")]
    DimensionMismatch {
        space: String,
        face: FaceId,
        expected: usize,
        actual: usize,
    },
    #[error("empty embedding for face {face} in space {space:?}")]
    EmptyEmbedding { space: String, face: FaceId },
    #[error("embedding for face {face} in space {space:?} holds a non-finite value")]
    NonFinite { space: String, face: FaceId },
}

/// Stable handle for a stored face: `(image index, face index within image)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FaceId {
    pub image: usize,
    pub face: usize,
}

impl FaceId {
    pub fn new(image: usize, face: usize) -> Self {
        Self { image, face }
    }
}

impl fmt::Display for FaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.face)
    }
}

impl FromStr for FaceId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::InvalidFaceId(s.to_string());
        let (image, face) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            image: image.trim().parse().map_err(|_| invalid())?,
            face: face.trim().parse().map_err(|_| invalid())?,
        })
    }
}

/// A detected face plus every embedding computed for it.
#[derive(Debug, Clone)]
pub struct FaceRecord {
    id: FaceId,
    pub detection: DetectedFace,
    embeddings: HashMap<String, Vec<f32>>,
    active_space: Option<String>,
}

impl FaceRecord {
    pub fn id(&self) -> FaceId {
        self.id
    }

    pub fn embedding(&self, space: &str) -> Option<&[f32]> {
        self.embeddings.get(space).map(Vec::as_slice)
    }

    pub fn has_space(&self, space: &str) -> bool {
        self.embeddings.contains_key(space)
    }

    /// Names of all spaces this face has an embedding in, sorted.
    pub fn spaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.embeddings.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn active_space(&self) -> Option<&str> {
        self.active_space.as_deref()
    }

    /// The vector currently used for comparison. Always `embeddings[active_space]`.
    pub fn active_embedding(&self) -> Option<&[f32]> {
        self.active_space
            .as_deref()
            .and_then(|space| self.embedding(space))
    }

    /// Repoint the active embedding at `space`. Leaves the record untouched on error.
    fn activate(&mut self, space: &str) -> Result<(), StoreError> {
        if !self.has_space(space) {
            return Err(StoreError::MissingSpace {
                space: space.to_string(),
                face: self.id,
            });
        }
        self.active_space = Some(space.to_string());
        Ok(())
    }
}

/// All faces of one input image, in detector order.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub source: String,
    faces: Vec<FaceRecord>,
}

impl ImageEntry {
    pub fn faces(&self) -> &[FaceRecord] {
        &self.faces
    }
}

/// Process-scoped collection of every face in a batch run.
#[derive(Debug, Clone)]
pub struct FaceStore {
    images: Vec<ImageEntry>,
    builtin_space: String,
    /// Vector length per embedding space, fixed by the first insert.
    dims: HashMap<String, usize>,
    active_space: Option<String>,
}

impl FaceStore {
    /// Create an empty store. Detector-provided embeddings are filed under `builtin_space`.
    pub fn new(builtin_space: impl Into<String>) -> Self {
        Self {
            images: Vec::new(),
            builtin_space: builtin_space.into(),
            dims: HashMap::new(),
            active_space: None,
        }
    }

    pub fn builtin_space(&self) -> &str {
        &self.builtin_space
    }

    /// Append the faces of the next image and return its image index.
    ///
    /// An image with no faces still takes an index, so indices always line
    /// up with the input order.
    pub fn push_image(
        &mut self,
        source: impl Into<String>,
        faces: Vec<DetectedFace>,
    ) -> Result<usize, StoreError> {
        let image = self.images.len();
        let space = self.builtin_space.clone();
        let mut expected = self.space_dims(&space);
        let mut records = Vec::with_capacity(faces.len());
        let mut builtin = Vec::new();

        for (face, mut detection) in faces.into_iter().enumerate() {
            let id = FaceId::new(image, face);
            if let Some(values) = detection.builtin_embedding.take() {
                check_vector(&space, id, &values, expected)?;
                expected.get_or_insert(values.len());
                builtin.push((id, values));
            }
            records.push(FaceRecord {
                id,
                detection,
                embeddings: HashMap::new(),
                active_space: None,
            });
        }

        // Every vector is checked, so the image goes in whole or not at all.
        self.images.push(ImageEntry {
            source: source.into(),
            faces: records,
        });
        for (id, values) in builtin {
            self.insert_embedding(id, &space, values)?;
        }

        Ok(image)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn face_count(&self) -> usize {
        self.images.iter().map(|i| i.faces.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.face_count() == 0
    }

    pub fn images(&self) -> &[ImageEntry] {
        &self.images
    }

    /// Every face in insertion order (image-major).
    pub fn faces(&self) -> impl Iterator<Item = &FaceRecord> {
        self.images.iter().flat_map(|i| i.faces.iter())
    }

    pub fn ids(&self) -> impl Iterator<Item = FaceId> + '_ {
        self.faces().map(FaceRecord::id)
    }

    pub fn face(&self, id: FaceId) -> Option<&FaceRecord> {
        self.images.get(id.image)?.faces.get(id.face)
    }

    pub fn get(&self, id: FaceId) -> Result<&FaceRecord, StoreError> {
        self.face(id).ok_or(StoreError::UnknownFace(id))
    }

    fn get_mut(&mut self, id: FaceId) -> Result<&mut FaceRecord, StoreError> {
        self.images
            .get_mut(id.image)
            .and_then(|i| i.faces.get_mut(id.face))
            .ok_or(StoreError::UnknownFace(id))
    }

    /// Vector length of `space`, once anything has been stored in it.
    pub fn space_dims(&self, space: &str) -> Option<usize> {
        self.dims.get(space).copied()
    }

    /// Every space that holds at least one vector, sorted.
    pub fn known_spaces(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.dims.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// True when the store has faces and each of them has an embedding in `space`.
    pub fn is_complete(&self, space: &str) -> bool {
        !self.is_empty() && self.faces().all(|f| f.has_space(space))
    }

    /// Store `values` as the embedding of face `id` in `space`.
    ///
    /// All vectors of one space share a length; the first insert fixes it.
    /// Every component must be finite.
    pub fn insert_embedding(
        &mut self,
        id: FaceId,
        space: &str,
        values: Vec<f32>,
    ) -> Result<(), StoreError> {
        check_vector(space, id, &values, self.space_dims(space))?;

        let len = values.len();
        self.get_mut(id)?.embeddings.insert(space.to_string(), values);
        self.dims.entry(space.to_string()).or_insert(len);
        Ok(())
    }

    pub fn active_space(&self) -> Option<&str> {
        self.active_space.as_deref()
    }

    /// Make `space` the active embedding space of every face.
    ///
    /// Either every record is repointed or none is: the first face lacking
    /// `space` aborts the switch before anything changes.
    pub fn switch_space(&mut self, space: &str) -> Result<(), StoreError> {
        if let Some(missing) = self.faces().find(|f| !f.has_space(space)) {
            return Err(StoreError::MissingSpace {
                space: space.to_string(),
                face: missing.id,
            });
        }

        for record in self.images.iter_mut().flat_map(|i| i.faces.iter_mut()) {
            record.activate(space)?;
        }
        self.active_space = Some(space.to_string());
        Ok(())
    }
}

fn check_vector(
    space: &str,
    face: FaceId,
    values: &[f32],
    expected: Option<usize>,
) -> Result<(), StoreError> {
    if values.is_empty() {
        return Err(StoreError::EmptyEmbedding {
            space: space.to_string(),
            face,
        });
    }
    if let Some(expected) = expected.filter(|&n| n != values.len()) {
        return Err(StoreError::DimensionMismatch {
            space: space.to_string(),
            face,
            expected,
            actual: values.len(),
        });
    }
    if !values.iter().all(|v| v.is_finite()) {
        return Err(StoreError::NonFinite {
            space: space.to_string(),
            face,
        });
    }
    Ok(())
}
