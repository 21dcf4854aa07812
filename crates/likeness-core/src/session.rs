//! Batch run: ingest images, compute embeddings, answer ranking requests.
//!
//! A [`BatchRun`] owns the face store and model registry for the lifetime of
//! one run. Work is sequential: one image at a time during ingestion, one
//! face and one model at a time during computation.

use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::detector::{DetectionAdapter, FaceDetector};
use crate::driver::{self, ComputeError, ComputeSummary};
use crate::presentation::{Presenter, UiEvent};
use crate::ranking::{self, RankError, Ranked};
use crate::registry::{ModelRegistry, RegistryError};
use crate::source::ImageSource;
use crate::store::{FaceId, FaceStore, StoreError};

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Rank(#[from] RankError),
}

/// Counts from one ingestion pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestSummary {
    pub images: usize,
    pub faces: usize,
    /// Images that could not be loaded or run through the detector.
    pub failed: usize,
}

/// What a handled [`UiEvent`] did.
#[derive(Debug)]
pub enum EventOutcome<'a> {
    Ranked(Vec<Ranked<'a>>),
    Switched(String),
}

pub struct BatchRun {
    id: Uuid,
    config: PipelineConfig,
    store: FaceStore,
    registry: ModelRegistry,
}

impl BatchRun {
    pub fn new(config: PipelineConfig, registry: ModelRegistry) -> Result<Self, BatchError> {
        config.validate().map_err(BatchError::Config)?;
        let id = Uuid::new_v4();
        tracing::info!(run = %id, models = registry.len(), "batch run created");
        Ok(Self {
            id,
            store: FaceStore::new(config.builtin_space.clone()),
            config,
            registry,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Run every image through the detector and append its faces.
    ///
    /// An image that fails to load or detect is logged and stored with an
    /// empty face list, so image indices still follow `images`.
    pub async fn ingest<S, D, P>(
        &mut self,
        images: &[String],
        source: &mut S,
        detector: &mut DetectionAdapter<D>,
        presenter: &mut P,
    ) -> Result<IngestSummary, BatchError>
    where
        S: ImageSource,
        D: FaceDetector,
        P: Presenter + ?Sized,
    {
        let span = tracing::info_span!("ingest", run = %self.id, images = images.len());
        self.ingest_inner(images, source, detector, presenter)
            .instrument(span)
            .await
    }

    async fn ingest_inner<S, D, P>(
        &mut self,
        images: &[String],
        source: &mut S,
        detector: &mut DetectionAdapter<D>,
        presenter: &mut P,
    ) -> Result<IngestSummary, BatchError>
    where
        S: ImageSource,
        D: FaceDetector,
        P: Presenter + ?Sized,
    {
        let mut summary = IngestSummary::default();

        for name in images {
            let faces = match source.load(name).await {
                Ok(image) => match detector.detect(name, &image).await {
                    Ok(faces) => faces,
                    Err(e) => {
                        tracing::warn!(
                            image = %name,
                            error = %e,
                            "detection failed, skipping image"
                        );
                        summary.failed += 1;
                        Vec::new()
                    }
                },
                Err(e) => {
                    tracing::warn!(image = %name, error = %e, "failed to load image, skipping");
                    summary.failed += 1;
                    Vec::new()
                }
            };

            let image = self.store.push_image(name.as_str(), faces)?;
            summary.images += 1;

            if let Some(entry) = self.store.images().get(image) {
                summary.faces += entry.faces().len();
                for record in entry.faces() {
                    presenter.render_face(record, None);
                }
            }
            presenter.report_progress(&format!(
                "detection: {}/{} images, {} faces",
                summary.images,
                images.len(),
                summary.faces
            ));
        }

        tracing::info!(
            images = summary.images,
            faces = summary.faces,
            failed = summary.failed,
            "ingestion finished"
        );
        Ok(summary)
    }

    /// Embed every stored face with every model and activate the default space.
    pub fn compute<P: Presenter + ?Sized>(
        &mut self,
        presenter: &mut P,
    ) -> Result<ComputeSummary, BatchError> {
        let _span = tracing::info_span!("compute", run = %self.id).entered();
        Ok(driver::compute_all(&mut self.store, &mut self.registry, presenter)?)
    }

    pub fn switch_space(&mut self, space: &str) -> Result<(), BatchError> {
        Ok(driver::switch_space(&mut self.store, space)?)
    }

    /// Rank every stored face against `query` with the configured metric.
    pub fn select(&self, query: FaceId) -> Result<Vec<Ranked<'_>>, BatchError> {
        Ok(ranking::rank_store(&self.store, query, self.config.metric)?)
    }

    /// Dispatch one user event and render its result.
    pub fn handle<P: Presenter + ?Sized>(
        &mut self,
        event: UiEvent,
        presenter: &mut P,
    ) -> Result<EventOutcome<'_>, BatchError> {
        match event {
            UiEvent::SwitchSpace(space) => {
                self.switch_space(&space)?;
                presenter.report_progress(&format!("active embedding space: {space}"));
                Ok(EventOutcome::Switched(space))
            }
            UiEvent::SelectFace(query) => {
                let ranked = self.select(query)?;
                for entry in &ranked {
                    presenter.render_face(entry.record, Some(entry.score));
                }
                Ok(EventOutcome::Ranked(ranked))
            }
        }
    }
}

impl std::fmt::Debug for BatchRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRun")
            .field("id", &self.id)
            .field("faces", &self.store.face_count())
            .field("registry", &self.registry)
            .finish()
    }
}
