mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use facekit_core::detector::{self, FaceDetector, Thresholds};
use facekit_core::pipeline::{AnalyzedFace, FacePipeline, PipelineModels};
use facekit_core::{
    codec, cpu, try_cosine_similarity, CanonicalImage, EmbeddingExtractor, Gallery, LoadOptions,
    ModelArtifacts,
};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facekit", about = "Face detection, embedding and matching")]
struct Cli {
    /// TOML config file (defaults to $FACEKIT_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory containing `{model}-opt.param` / `{model}-opt.bin`
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    /// Try GPU acceleration before falling back to CPU
    #[arg(long, global = true)]
    gpu: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces and print them as JSON
    Detect {
        image: PathBuf,
        /// Minimum detection confidence
        #[arg(long)]
        prob: Option<f32>,
        /// IoU above which overlapping boxes are suppressed
        #[arg(long)]
        nms: Option<f32>,
        /// Print the flat `[count, 15 × count]` buffer instead of JSON
        #[arg(long)]
        raw: bool,
    },
    /// Print the embedding of the best face
    Embed {
        image: PathBuf,
        /// The image is already an aligned 112x112 face
        #[arg(long)]
        aligned: bool,
    },
    /// Cosine similarity between the best faces of two images
    Compare { first: PathBuf, second: PathBuf },
    /// Enroll the best face of an image into the gallery
    Enroll {
        image: PathBuf,
        /// Label for this face model (e.g., "alice", "alice-glasses")
        #[arg(short, long)]
        label: String,
    },
    /// Match the best face of an image against the gallery
    Identify { image: PathBuf },
    /// List enrolled face models
    List,
    /// Remove an enrolled face model
    Remove {
        /// Model ID to remove
        id: String,
    },
    /// Show configuration, model artifacts and CPU topology
    Status,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.model_dir {
        config.model_dir = dir;
    }
    if cli.gpu {
        config.use_gpu = true;
    }
    tracing::debug!(?config, "configuration resolved");

    match cli.command {
        Commands::Detect { image, prob, nms, raw } => {
            let thresholds = Thresholds {
                prob: prob.unwrap_or(config.prob_threshold),
                nms: nms.unwrap_or(config.nms_threshold),
            };
            let image = load_image(&image)?;
            let mut detector = FaceDetector::onnx();
            detector.load(&config.model_dir, &config.detector_variant, &load_options(&config))?;
            let detections = detector.detect(&image, thresholds)?;
            if raw {
                println!("{}", serde_json::to_string(&codec::encode(&detections))?);
            } else {
                println!("{}", serde_json::to_string_pretty(&detections)?);
            }
        }
        Commands::Embed { image, aligned } => {
            let image = load_image(&image)?;
            let embedding = if aligned {
                let mut extractor = EmbeddingExtractor::onnx();
                extractor.load(
                    &config.model_dir,
                    &config.recognizer_model,
                    &load_options(&config),
                )?;
                extractor.extract(&image)?
            } else {
                best_face(&mut pipeline(&config)?, &image, &config)?.embedding
            };
            println!("{}", serde_json::to_string_pretty(&embedding)?);
        }
        Commands::Compare { first, second } => {
            let mut pipeline = pipeline(&config)?;
            let a = best_face(&mut pipeline, &load_image(&first)?, &config)?;
            let b = best_face(&mut pipeline, &load_image(&second)?, &config)?;
            let similarity = try_cosine_similarity(&a.embedding.values, &b.embedding.values)?;
            let matched = similarity >= config.similarity_threshold;
            println!(
                "{}",
                serde_json::json!({
                    "similarity": similarity,
                    "threshold": config.similarity_threshold,
                    "matched": matched,
                })
            );
        }
        Commands::Enroll { image, label } => {
            let face = best_face(&mut pipeline(&config)?, &load_image(&image)?, &config)?;
            let mut gallery = Gallery::load(&config.gallery_path)?;
            let id = gallery.enroll(&label, face.embedding)?.id.clone();
            gallery.save(&config.gallery_path)?;
            println!("Enrolled {label} as {id} ({} models)", gallery.len());
        }
        Commands::Identify { image } => {
            let gallery = Gallery::load(&config.gallery_path)?;
            if gallery.is_empty() {
                bail!("no faces enrolled in {}", config.gallery_path.display());
            }
            let face = best_face(&mut pipeline(&config)?, &load_image(&image)?, &config)?;
            let result = gallery.identify(&face.embedding, config.similarity_threshold);
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::List => {
            let gallery = Gallery::load(&config.gallery_path)?;
            if gallery.is_empty() {
                println!("No models enrolled");
            }
            for model in gallery.models() {
                println!(
                    "{}  {:<16} dim={:<4} {}",
                    model.id,
                    model.label,
                    model.embedding.len(),
                    model.created_at
                );
            }
        }
        Commands::Remove { id } => {
            let mut gallery = Gallery::load(&config.gallery_path)?;
            if !gallery.remove(&id) {
                bail!("no model with id {id}");
            }
            gallery.save(&config.gallery_path)?;
            println!("Removed {id}");
        }
        Commands::Status => print_status(&config),
    }

    Ok(())
}

fn load_options(config: &Config) -> LoadOptions {
    LoadOptions::new(config.use_gpu)
}

fn pipeline(config: &Config) -> Result<FacePipeline> {
    let models = PipelineModels {
        model_dir: &config.model_dir,
        detector_variant: &config.detector_variant,
        recognizer_model: &config.recognizer_model,
        options: load_options(config),
    };
    Ok(FacePipeline::onnx(&models)?)
}

fn best_face(
    pipeline: &mut FacePipeline,
    image: &CanonicalImage,
    config: &Config,
) -> Result<AnalyzedFace> {
    pipeline
        .best_face(image, config.thresholds())?
        .context("no face detected")
}

/// Decode an image file and convert it through the bitmap boundary.
fn load_image(path: &Path) -> Result<CanonicalImage> {
    let decoded = image::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut bitmap = facekit_bitmap::from_dynamic_image(&decoded);
    Ok(facekit_bitmap::canonical_from_bitmap(&mut bitmap)?)
}

fn print_status(config: &Config) {
    println!("model dir:       {}", config.model_dir.display());
    println!("gallery:         {}", config.gallery_path.display());
    println!(
        "thresholds:      prob={} nms={} similarity={}",
        config.prob_threshold, config.nms_threshold, config.similarity_threshold
    );
    println!("gpu requested:   {}", config.use_gpu);
    println!("perf cores:      {}", cpu::performance_core_count());

    for id in [detector::model_id(&config.detector_variant), config.recognizer_model.clone()] {
        let artifacts = ModelArtifacts::locate(&config.model_dir, &id);
        match artifacts.check() {
            Ok(()) => println!("{id:<16} ok"),
            Err(e) => println!("{id:<16} {e}"),
        }
    }
}
