//! Presentation adapter contract.
//!
//! Rendering, layout and progress text belong to the surrounding
//! application. The core only pushes progress and faces through
//! [`Presenter`] and consumes user input as [`UiEvent`]s that address
//! faces by [`FaceId`].

use crate::store::{FaceId, FaceRecord};

pub trait Presenter {
    fn report_progress(&mut self, text: &str);

    /// Show one face. `score` is set when the face is part of a ranking.
    fn render_face(&mut self, face: &FaceRecord, score: Option<f32>);
}

/// User input forwarded by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Rank the store against this face.
    SelectFace(FaceId),
    /// Make this embedding space active.
    SwitchSpace(String),
}
