use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceid_core::database::SAMPLE_EXTENSIONS;
use faceid_core::enrollment::CaptureEvent;
use faceid_core::{
    BoundingBox, CaptureSchedule, ClassIndex, ClassifierMatcher, DatabaseBuilder, DatabaseHandle,
    EnrollmentPipeline, MatchMode, MatchStrategy, OnnxEmbedder, Recognizer, SimilarityMatcher, UnknownFaceLedger,
};
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "faceid", about = "Embedding-based face identity resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the identity database from the training corpus and report
    Build {
        /// Print the full build report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Identify face crops; rejected faces go to the unknown-face ledger
    Identify {
        /// Face crop images
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Do not record rejected faces
        #[arg(long)]
        no_ledger: bool,
    },
    /// Stage face crops for a new identity as a train/val split
    Enroll {
        /// Identity name (used as directory name)
        #[arg(short, long)]
        name: String,
        /// Directory of face crops, in capture order by file name
        samples: PathBuf,
        /// Maximum number of samples to take (default from config)
        #[arg(short, long)]
        target: Option<usize>,
        /// Treat the files as consecutive camera frames and keep only every
        /// `capture_every_n_frames`-th one
        #[arg(long)]
        frames: bool,
    },
    /// List rejected faces recorded in the ledger
    Ledger,
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Build { json } => build(&config, json),
        Commands::Identify { images, no_ledger } => identify(&config, &images, no_ledger),
        Commands::Enroll {
            name,
            samples,
            target,
            frames,
        } => enroll(&config, &name, &samples, target, frames),
        Commands::Ledger => list_ledger(&config),
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_embedder(config: &Config, output_dim: usize) -> Result<OnnxEmbedder> {
    OnnxEmbedder::load(&config.model_path, config.embedder_options(output_dim))
        .with_context(|| format!("loading model {}", config.model_path.display()))
}

fn build(config: &Config, json: bool) -> Result<()> {
    let mut embedder = load_embedder(config, config.embedding_dim)?;
    let (db, report) = DatabaseBuilder::new(&mut embedder).build(&config.corpus_dir());

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for identity in &report.enrolled {
        println!("{:<24} {} samples", identity.name, identity.samples);
    }
    for omitted in &report.omitted {
        println!("{:<24} omitted: {}", omitted.name, omitted.reason);
    }
    println!(
        "{} identities, {} samples skipped",
        db.len(),
        report.skipped_samples.len()
    );
    if let Some(err) = &report.corpus_error {
        println!("corpus error: {err}");
    }
    Ok(())
}

/// Assemble the recognizer for the configured mode.
fn build_recognizer(config: &Config) -> Result<Recognizer> {
    let (embedder, strategy): (OnnxEmbedder, Box<dyn MatchStrategy>) = match config.match_mode {
        MatchMode::Similarity => {
            let mut embedder = load_embedder(config, config.embedding_dim)?;
            let (db, _) = DatabaseBuilder::new(&mut embedder).build(&config.corpus_dir());
            let handle = Arc::new(DatabaseHandle::new(db));
            let matcher: Box<dyn MatchStrategy> =
                Box::new(SimilarityMatcher::new(handle, config.similarity_thresholds()));
            (embedder, matcher)
        }
        MatchMode::Classifier => {
            let index = ClassIndex::load(&config.class_index_path)?;
            tracing::info!(classes = index.class_count(), "class index loaded");
            let embedder = load_embedder(config, index.class_count())?;
            let matcher: Box<dyn MatchStrategy> = Box::new(
                ClassifierMatcher::new(index, config.classifier_thresholds())
                    .with_logits(config.classifier_logits),
            );
            (embedder, matcher)
        }
    };
    Ok(Recognizer::new(Box::new(embedder), strategy))
}

fn identify(config: &Config, images: &[PathBuf], no_ledger: bool) -> Result<()> {
    let mut recognizer = build_recognizer(config)?;
    if !no_ledger {
        recognizer = recognizer.with_ledger(UnknownFaceLedger::new(&config.ledger_dir));
    }

    for path in images {
        let face = match image::open(path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read image");
                println!("{}: error: {e}", path.display());
                continue;
            }
        };
        match recognizer.recognize(&face) {
            Ok(result) => println!("{}: {} ({:.2})", path.display(), result.label, result.score),
            Err(e) => println!("{}: error: {e}", path.display()),
        }
    }
    Ok(())
}

fn enroll(
    config: &Config,
    name: &str,
    samples: &Path,
    target: Option<usize>,
    frames: bool,
) -> Result<()> {
    let target = target.unwrap_or(config.target_samples);
    let mut pipeline = EnrollmentPipeline::new(name, target)?;
    if frames {
        pipeline = pipeline.with_schedule(CaptureSchedule::new(config.capture_every_n_frames));
    }

    for path in sample_files(samples)? {
        match image::open(&path) {
            Ok(img) => {
                if stage_sample(&mut pipeline, img.to_rgb8(), frames) {
                    tracing::info!(count = pipeline.len(), "reached target sample count");
                    break;
                }
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable sample"),
        }
    }

    let summary = pipeline.persist(&config.dataset_dir)?;
    println!(
        "{}: {} train -> {}, {} val -> {}",
        summary.name,
        summary.train,
        summary.train_dir.display(),
        summary.val,
        summary.val_dir.display()
    );
    println!("run `faceid build` to refresh the identity database");
    Ok(())
}

/// Hand one image to the pipeline. In frame mode the image is a whole frame
/// whose only face fills it, subject to the capture schedule. Returns true
/// once the target count is reached.
fn stage_sample(pipeline: &mut EnrollmentPipeline, img: RgbImage, as_frame: bool) -> bool {
    if !as_frame {
        return pipeline.push(img);
    }
    let face = whole_frame(&img);
    matches!(
        pipeline.offer_frame(&img, &[face]),
        CaptureEvent::TargetReached { .. }
    )
}

fn whole_frame(img: &RgbImage) -> BoundingBox {
    BoundingBox {
        x: 0,
        y: 0,
        width: i32::try_from(img.width()).unwrap_or(i32::MAX),
        height: i32::try_from(img.height()).unwrap_or(i32::MAX),
        confidence: 1.0,
    }
}

/// Image files of a directory, sorted by name.
fn sample_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("sample directory not found: {}", dir.display());
    }
    let mut files = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| SAMPLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

fn list_ledger(config: &Config) -> Result<()> {
    let ledger = UnknownFaceLedger::new(&config.ledger_dir);
    let entries = ledger.entries()?;
    if entries.is_empty() {
        println!("no unknown faces recorded");
    }
    for entry in entries {
        println!(
            "{}  {:>7.4}  {}",
            entry.timestamp,
            entry.score,
            entry.image_path.display()
        );
    }
    Ok(())
}
