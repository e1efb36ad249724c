use anyhow::Context;
use facekit_core::detector::{
    Thresholds, DEFAULT_NMS_THRESHOLD, DEFAULT_PROB_THRESHOLD, DEFAULT_VARIANT,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_RECOGNIZER_MODEL: &str = "mobilefacenet";
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Resolved CLI configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Directory holding `{model}-opt.param` / `{model}-opt.bin` pairs.
    pub model_dir: PathBuf,
    pub recognizer_model: String,
    pub detector_variant: String,
    /// Try the CUDA execution provider before falling back to CPU.
    pub use_gpu: bool,
    pub prob_threshold: f32,
    pub nms_threshold: f32,
    /// Cosine similarity needed for a gallery match.
    pub similarity_threshold: f32,
    /// JSON file with enrolled face models.
    pub gallery_path: PathBuf,
}

/// Optional keys read from a TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub model_dir: Option<PathBuf>,
    pub recognizer_model: Option<String>,
    pub detector_variant: Option<String>,
    pub use_gpu: Option<bool>,
    pub prob_threshold: Option<f32>,
    pub nms_threshold: Option<f32>,
    pub similarity_threshold: Option<f32>,
    pub gallery_path: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }
}

impl Config {
    /// Load from an optional TOML file, then `FACEKIT_*` environment variables.
    ///
    /// Without `path`, `$FACEKIT_CONFIG` is used when set.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FACEKIT_CONFIG").ok().map(PathBuf::from));
        let file = match path {
            Some(p) => FileConfig::load(&p)?,
            None => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    /// Layer `file` over defaults, then `env` over both.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = data_dir(&env);

        Self {
            model_dir: env_path(&env, "FACEKIT_MODEL_DIR")
                .or(file.model_dir)
                .unwrap_or_else(|| data_dir.join("models")),
            recognizer_model: env("FACEKIT_RECOGNIZER_MODEL")
                .or(file.recognizer_model)
                .unwrap_or_else(|| DEFAULT_RECOGNIZER_MODEL.to_string()),
            detector_variant: env("FACEKIT_DETECTOR_VARIANT")
                .or(file.detector_variant)
                .unwrap_or_else(|| DEFAULT_VARIANT.to_string()),
            use_gpu: env("FACEKIT_USE_GPU")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .or(file.use_gpu)
                .unwrap_or(false),
            prob_threshold: env_parse(&env, "FACEKIT_PROB_THRESHOLD")
                .or(file.prob_threshold)
                .unwrap_or(DEFAULT_PROB_THRESHOLD),
            nms_threshold: env_parse(&env, "FACEKIT_NMS_THRESHOLD")
                .or(file.nms_threshold)
                .unwrap_or(DEFAULT_NMS_THRESHOLD),
            similarity_threshold: env_parse(&env, "FACEKIT_SIMILARITY_THRESHOLD")
                .or(file.similarity_threshold)
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            gallery_path: env_path(&env, "FACEKIT_GALLERY_PATH")
                .or(file.gallery_path)
                .unwrap_or_else(|| data_dir.join("gallery.json")),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            prob: self.prob_threshold,
            nms: self.nms_threshold,
        }
    }
}

fn data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facekit")
}

fn env_path(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env(key).map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|v| v.parse().ok())
}
