//! Embedding computation driver and space switching.
//!
//! Faces are processed one at a time and, within a face, models run one
//! after another against the same borrowed crop. The store is held
//! exclusively for the whole pass, so no reader can observe a face whose
//! embeddings are only partly written.

use thiserror::Error;

use crate::presentation::Presenter;
use crate::registry::{ModelRegistry, RegistryError};
use crate::store::{FaceId, FaceStore, StoreError};

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("model name {0:?} is reserved for the detector's built-in embedding")]
    ReservedName(String),
    #[error("no embedding space: no models loaded and the detector gave no embeddings")]
    NoEmbeddingSpace,
    #[error("face {face}: {err}")]
    Model {
        face: FaceId,
        #[source]
        err: RegistryError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a full embedding pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeSummary {
    pub faces: usize,
    pub models: usize,
    pub default_space: Option<String>,
}

fn progress_text(done: usize, total: usize) -> String {
    let pct = done as f32 / total as f32 * 100.0;
    format!("embeddings: {done}/{total} faces ({pct:.0}%)")
}

/// The space a freshly computed store starts in: the detector's built-in
/// embedding when every face has one, else the first registered model.
pub fn default_space(store: &FaceStore, registry: &ModelRegistry) -> Option<String> {
    if store.is_complete(store.builtin_space()) {
        return Some(store.builtin_space().to_string());
    }
    registry.first_name().map(str::to_string)
}

/// Embed every stored face with every registered model, then activate the
/// default space.
pub fn compute_all<P: Presenter + ?Sized>(
    store: &mut FaceStore,
    registry: &mut ModelRegistry,
    presenter: &mut P,
) -> Result<ComputeSummary, ComputeError> {
    if registry.contains(store.builtin_space()) {
        return Err(ComputeError::ReservedName(store.builtin_space().to_string()));
    }

    let names: Vec<String> = registry.names().map(str::to_string).collect();
    let ids: Vec<FaceId> = store.ids().collect();
    let total = ids.len();

    tracing::info!(faces = total, models = names.len(), "computing embeddings");

    for (done, id) in ids.into_iter().enumerate() {
        let vectors = {
            let crop = &store.get(id)?.detection.crop;
            let mut vectors = Vec::with_capacity(names.len());
            for name in &names {
                let values = registry
                    .apply(name, crop)
                    .map_err(|err| ComputeError::Model { face: id, err })?;
                tracing::debug!(face = %id, model = %name, dims = values.len(), "embedded face");
                vectors.push((name, values));
            }
            vectors
        };

        for (name, values) in vectors {
            store.insert_embedding(id, name, values)?;
        }
        presenter.report_progress(&progress_text(done + 1, total));
    }

    let default = default_space(store, registry);
    match &default {
        Some(space) => switch_space(store, space)?,
        None if !store.is_empty() => return Err(ComputeError::NoEmbeddingSpace),
        None => {}
    }

    for row in registry.stats() {
        tracing::info!(
            model = %row.name,
            calls = row.calls,
            mean_latency_ms = ?row.mean_latency_ms,
            "model performance"
        );
    }

    Ok(ComputeSummary {
        faces: total,
        models: names.len(),
        default_space: default,
    })
}

/// Make `space` active on every face. A face without `space` means the
/// pipeline skipped a model; the switch is refused and nothing changes.
pub fn switch_space(store: &mut FaceStore, space: &str) -> Result<(), StoreError> {
    let previous = store.active_space().map(str::to_string);
    store.switch_space(space)?;
    tracing::info!(from = ?previous, to = space, "active embedding space switched");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Preprocess;
    use crate::testing::{detected, ChannelMeanModel, FailingModel, FixedModel, RecordingPresenter};

    fn two_face_store() -> FaceStore {
        let mut store = FaceStore::new("detector");
        store.push_image("one.jpg", vec![detected("one.jpg")]).unwrap();
        store.push_image("two.jpg", vec![detected("two.jpg")]).unwrap();
        store
    }

    fn two_model_registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new(Preprocess::default());
        registry.register("m1", Box::new(ChannelMeanModel)).unwrap();
        registry.register("m2", Box::new(FixedModel::new(vec![0.5, 0.5]))).unwrap();
        registry
    }

    #[test]
    fn test_compute_all_two_images_two_models() {
        let mut store = two_face_store();
        let mut registry = two_model_registry();
        let mut presenter = RecordingPresenter::default();

        let summary = compute_all(&mut store, &mut registry, &mut presenter).unwrap();

        assert_eq!(summary.faces, 2);
        assert_eq!(summary.models, 2);
        assert_eq!(summary.default_space.as_deref(), Some("m1"));
        for record in store.faces() {
            assert_eq!(record.spaces(), vec!["m1", "m2"]);
            assert_eq!(record.active_space(), Some("m1"));
            assert_eq!(record.active_embedding(), record.embedding("m1"));
        }
        assert_eq!(store.active_space(), Some("m1"));
    }

    #[test]
    fn test_compute_all_prefers_builtin_space() {
        let mut store = FaceStore::new("detector");
        for name in ["one.jpg", "two.jpg"] {
            let mut face = detected(name);
            face.builtin_embedding = Some(vec![1.0, 0.0, 0.0]);
            store.push_image(name, vec![face]).unwrap();
        }
        let mut registry = two_model_registry();

        let summary =
            compute_all(&mut store, &mut registry, &mut RecordingPresenter::default()).unwrap();

        assert_eq!(summary.default_space.as_deref(), Some("detector"));
        for record in store.faces() {
            assert_eq!(record.spaces(), vec!["detector", "m1", "m2"]);
            assert_eq!(record.active_space(), Some("detector"));
        }
    }

    #[test]
    fn test_partial_builtin_falls_back_to_first_model() {
        let mut store = FaceStore::new("detector");
        let mut face = detected("one.jpg");
        face.builtin_embedding = Some(vec![1.0]);
        store.push_image("one.jpg", vec![face]).unwrap();
        store.push_image("two.jpg", vec![detected("two.jpg")]).unwrap();
        let mut registry = two_model_registry();

        let summary =
            compute_all(&mut store, &mut registry, &mut RecordingPresenter::default()).unwrap();
        assert_eq!(summary.default_space.as_deref(), Some("m1"));
    }

    #[test]
    fn test_progress_reported_per_face() {
        let mut store = two_face_store();
        let mut registry = two_model_registry();
        let mut presenter = RecordingPresenter::default();

        compute_all(&mut store, &mut registry, &mut presenter).unwrap();

        assert_eq!(
            presenter.progress,
            vec![
                "embeddings: 1/2 faces (50%)".to_string(),
                "embeddings: 2/2 faces (100%)".to_string(),
            ]
        );
    }

    #[test]
    fn test_every_model_sees_the_same_crop() {
        let mut store = two_face_store();
        let mut registry = ModelRegistry::new(Preprocess::default());
        registry.register("a", Box::new(ChannelMeanModel)).unwrap();
        registry.register("b", Box::new(ChannelMeanModel)).unwrap();

        compute_all(&mut store, &mut registry, &mut RecordingPresenter::default()).unwrap();

        for record in store.faces() {
            assert_eq!(record.embedding("a"), record.embedding("b"));
        }
    }

    #[test]
    fn test_model_stats_count_every_face() {
        let mut store = two_face_store();
        let mut registry = two_model_registry();
        compute_all(&mut store, &mut registry, &mut RecordingPresenter::default()).unwrap();
        assert_eq!(registry.model_stats("m1").unwrap().calls(), 2);
        assert_eq!(registry.model_stats("m2").unwrap().calls(), 2);
    }

    #[test]
    fn test_model_failure_is_fatal_and_leaves_no_active_space() {
        let mut store = two_face_store();
        let mut registry = ModelRegistry::new(Preprocess::default());
        registry.register("ok", Box::new(FixedModel::new(vec![1.0]))).unwrap();
        registry.register("bad", Box::new(FailingModel)).unwrap();

        let err = compute_all(&mut store, &mut registry, &mut RecordingPresenter::default())
            .unwrap_err();

        assert!(matches!(err, ComputeError::Model { face, .. } if face == FaceId::new(0, 0)));
        assert!(store.faces().all(|f| f.active_embedding().is_none()));
        assert!(store.faces().all(|f| !f.has_space("ok")));
    }

    #[test]
    fn test_changed_output_length_is_fatal() {
        let mut store = two_face_store();
        store
            .insert_embedding(FaceId::new(0, 0), "m2", vec![1.0, 2.0, 3.0])
            .unwrap();
        let mut registry = two_model_registry();

        let err = compute_all(&mut store, &mut registry, &mut RecordingPresenter::default())
            .unwrap_err();
        assert!(matches!(
            err,
            ComputeError::Store(StoreError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_model_named_like_builtin_space_is_rejected() {
        let mut store = two_face_store();
        let mut registry = ModelRegistry::new(Preprocess::default());
        registry.register("detector", Box::new(FixedModel::new(vec![1.0]))).unwrap();

        let err = compute_all(&mut store, &mut registry, &mut RecordingPresenter::default())
            .unwrap_err();
        assert!(matches!(err, ComputeError::ReservedName(_)));
    }

    #[test]
    fn test_no_space_at_all_is_an_error() {
        let mut store = two_face_store();
        let mut registry = ModelRegistry::new(Preprocess::default());
        let err = compute_all(&mut store, &mut registry, &mut RecordingPresenter::default())
            .unwrap_err();
        assert!(matches!(err, ComputeError::NoEmbeddingSpace));
    }

    #[test]
    fn test_empty_store_computes_nothing() {
        let mut store = FaceStore::new("detector");
        let mut registry = two_model_registry();
        let mut presenter = RecordingPresenter::default();

        let summary = compute_all(&mut store, &mut registry, &mut presenter).unwrap();
        assert_eq!(summary.faces, 0);
        assert_eq!(summary.default_space.as_deref(), Some("m1"));
        assert!(presenter.progress.is_empty());
    }

    #[test]
    fn test_switch_space_after_compute() {
        let mut store = two_face_store();
        let mut registry = two_model_registry();
        compute_all(&mut store, &mut registry, &mut RecordingPresenter::default()).unwrap();

        switch_space(&mut store, "m2").unwrap();
        assert!(store.faces().all(|f| f.active_embedding() == Some(&[0.5, 0.5][..])));

        let err = switch_space(&mut store, "never-loaded").unwrap_err();
        assert!(matches!(err, StoreError::MissingSpace { .. }));
        assert_eq!(store.active_space(), Some("m2"));
        assert!(store.faces().all(|f| f.active_space() == Some("m2")));
    }
}
