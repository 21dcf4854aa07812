use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use likeness_core::session::EventOutcome;
use likeness_core::source::list_dir;
use likeness_core::{
    BatchRun, DetectionAdapter, FaceId, FsImageSource, Metric, ModelRegistry, OnnxLoader,
    Presenter, ScrfdDetector, UiEvent,
};
use tracing_subscriber::EnvFilter;

mod config;
mod presenter;

use config::{Config, Overrides};
use presenter::{stats_table, RankRow, TerminalPresenter};

#[derive(Parser)]
#[command(name = "likeness", version, about = "Compare faces across embedding models")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect and embed every face, then list them
    Faces,
    /// Rank all faces against one query face
    Rank {
        /// Query face as <image>:<face>, e.g. 0:1
        query: FaceId,
        /// Embedding space to compare in (defaults to the detector's, else the first model)
        #[arg(long)]
        space: Option<String>,
        /// distance or similarity
        #[arg(long)]
        metric: Option<Metric>,
        /// Print only the best N matches
        #[arg(long)]
        top: Option<usize>,
        /// Leave the query face out of the results
        #[arg(long)]
        exclude_query: bool,
        /// Print the ranking as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_overrides(&cli.overrides);
    if let Commands::Rank {
        metric: Some(metric),
        ..
    } = &cli.command
    {
        config.pipeline.metric = *metric;
    }

    let mut run = prepare(&config).await?;
    let mut presenter = TerminalPresenter::new();

    let images = list_dir(&config.image_dir, &config.pipeline.image_suffixes)
        .await
        .context("listing images")?;
    if images.is_empty() {
        bail!("no images found in {}", config.image_dir.display());
    }
    let images: Vec<String> = images.iter().map(|p| p.display().to_string()).collect();

    let mut detector = load_detector(&config)?;
    run.ingest(&images, &mut FsImageSource, &mut detector, &mut presenter)
        .await?;
    let summary = run.compute(&mut presenter)?;
    tracing::info!(
        run = %run.id(),
        faces = summary.faces,
        models = summary.models,
        space = ?summary.default_space,
        "embeddings ready"
    );
    eprint!("{}", stats_table(&run.registry().stats()));

    match cli.command {
        Commands::Faces => {
            presenter.show_faces = true;
            for record in run.store().faces() {
                presenter.render_face(record, None);
            }
        }
        Commands::Rank {
            query,
            space,
            top,
            exclude_query,
            json,
            ..
        } => {
            if let Some(space) = space {
                run.handle(UiEvent::SwitchSpace(space), &mut presenter)?;
            }
            let EventOutcome::Ranked(mut ranked) =
                run.handle(UiEvent::SelectFace(query), &mut presenter)?
            else {
                bail!("face selection produced no ranking");
            };

            if exclude_query {
                ranked.retain(|r| r.id() != query);
            }
            if let Some(top) = top {
                ranked.truncate(top);
            }

            if json {
                let rows: Vec<RankRow<'_>> =
                    ranked.iter().map(|r| RankRow::new(r.record, r.score)).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                presenter.show_faces = true;
                for entry in &ranked {
                    presenter.render_face(entry.record, Some(entry.score));
                }
            }
        }
    }

    Ok(())
}

/// Load every embedding model and open the batch run.
async fn prepare(config: &Config) -> Result<BatchRun> {
    let sources = model_sources(config).await?;
    tracing::info!(
        count = sources.len(),
        dir = %config.model_dir.display(),
        "embedding models found"
    );

    let loader = OnnxLoader {
        intra_threads: config.intra_threads,
    };
    let registry = ModelRegistry::load_all(&sources, &loader, config.pipeline.preprocess.clone())
        .context("loading embedding models")?;
    Ok(BatchRun::new(config.pipeline.clone(), registry)?)
}

fn load_detector(config: &Config) -> Result<DetectionAdapter<ScrfdDetector>> {
    let path = config.detector_path();
    let min_face_score = config.pipeline.min_face_score;
    // Pre-filter no stricter than the adapter.
    let mut detector = ScrfdDetector::load(&path)
        .with_context(|| format!("loading detector {}", path.display()))?
        .with_score_threshold(min_face_score);
    if let Some(recognizer) = &config.recognizer_model {
        detector = detector
            .with_recognizer(recognizer)
            .with_context(|| format!("loading recognizer {}", recognizer.display()))?;
    }
    tracing::info!(
        path = %path.display(),
        builtin_embedding = detector.has_recognizer(),
        score_threshold = detector.score_threshold(),
        "detector ready"
    );
    Ok(DetectionAdapter::new(detector, min_face_score))
}

/// Model files of the model directory, minus the detector and recognizer.
async fn model_sources(config: &Config) -> Result<Vec<PathBuf>> {
    let suffixes = [config.pipeline.model_suffix.clone()];
    let found = list_dir(&config.model_dir, &suffixes)
        .await
        .context("listing embedding models")?;

    let reserved: Vec<PathBuf> = std::iter::once(config.detector_path())
        .chain(config.recognizer_model.clone())
        .collect();
    Ok(found
        .into_iter()
        .filter(|p| !reserved.iter().any(|r| same_file(p, r)))
        .collect())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
