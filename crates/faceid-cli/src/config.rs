use anyhow::{Context, Result};
use faceid_core::classifier::DEFAULT_CLASSIFIER_THRESHOLD;
use faceid_core::enrollment::{DEFAULT_CAPTURE_EVERY_N_FRAMES, DEFAULT_TARGET_SAMPLES, TRAIN_DIR};
use faceid_core::matcher::{DEFAULT_MARGIN_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD};
use faceid_core::recognizer::{EmbedderOptions, TensorLayout};
use faceid_core::{MatchMode, Thresholds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// CLI configuration: defaults, then an optional TOML file named by
/// `FACEID_CONFIG`, then `FACEID_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root holding `train/<name>/` and `val/<name>/`.
    pub dataset_dir: PathBuf,
    /// Corpus the identity database is built from; `<dataset_dir>/train` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus_dir: Option<PathBuf>,
    /// Directory of the unknown-face ledger.
    pub ledger_dir: PathBuf,
    /// ONNX model producing embeddings (or class scores in classifier mode).
    pub model_path: PathBuf,
    /// `{"name": slot}` JSON used in classifier mode.
    pub class_index_path: PathBuf,
    pub match_mode: MatchMode,
    pub similarity_threshold: f32,
    pub margin_threshold: f32,
    /// Acceptance bar on the top class probability in classifier mode.
    pub classifier_threshold: f32,
    /// Apply softmax to the classifier output.
    pub classifier_logits: bool,
    pub embedding_dim: usize,
    pub input_size: u32,
    pub tensor_layout: TensorLayout,
    pub target_samples: usize,
    /// Sampling stride for `faceid enroll --frames`.
    pub capture_every_n_frames: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dataset_dir: PathBuf::from("dataset_faces"),
            corpus_dir: None,
            ledger_dir: PathBuf::from("logs/unknown_faces"),
            model_path: PathBuf::from("models/face_embedder.onnx"),
            class_index_path: PathBuf::from("models/class_indices.json"),
            match_mode: MatchMode::Similarity,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            margin_threshold: DEFAULT_MARGIN_THRESHOLD,
            classifier_threshold: DEFAULT_CLASSIFIER_THRESHOLD,
            classifier_logits: false,
            embedding_dim: 128,
            input_size: 160,
            tensor_layout: TensorLayout::Nhwc,
            target_samples: DEFAULT_TARGET_SAMPLES,
            capture_every_n_frames: DEFAULT_CAPTURE_EVERY_N_FRAMES,
        }
    }
}

impl Config {
    /// Load the effective configuration for this process.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("FACEID_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `FACEID_*` variables. Unparseable values keep the
    /// current setting.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEID_DATASET_DIR") {
            self.dataset_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_CORPUS_DIR") {
            self.corpus_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("FACEID_LEDGER_DIR") {
            self.ledger_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEID_CLASS_INDEX_PATH") {
            self.class_index_path = PathBuf::from(v);
        }
        env_parse(&lookup, "FACEID_MATCH_MODE", &mut self.match_mode);
        env_parse(&lookup, "FACEID_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env_parse(&lookup, "FACEID_MARGIN_THRESHOLD", &mut self.margin_threshold);
        env_parse(&lookup, "FACEID_CLASSIFIER_THRESHOLD", &mut self.classifier_threshold);
        env_parse(&lookup, "FACEID_CLASSIFIER_LOGITS", &mut self.classifier_logits);
        env_parse(&lookup, "FACEID_EMBEDDING_DIM", &mut self.embedding_dim);
        env_parse(&lookup, "FACEID_INPUT_SIZE", &mut self.input_size);
        env_parse(&lookup, "FACEID_TENSOR_LAYOUT", &mut self.tensor_layout);
        env_parse(&lookup, "FACEID_TARGET_SAMPLES", &mut self.target_samples);
        env_parse(&lookup, "FACEID_CAPTURE_EVERY_N_FRAMES", &mut self.capture_every_n_frames);
    }

    /// Corpus the database is built from: `corpus_dir` if set, otherwise the
    /// training split of the dataset.
    pub fn corpus_dir(&self) -> PathBuf {
        self.corpus_dir
            .clone()
            .unwrap_or_else(|| self.dataset_dir.join(TRAIN_DIR))
    }

    pub fn similarity_thresholds(&self) -> Thresholds {
        Thresholds {
            similarity: self.similarity_threshold,
            margin: self.margin_threshold,
        }
    }

    pub fn classifier_thresholds(&self) -> Thresholds {
        Thresholds {
            similarity: self.classifier_threshold,
            margin: self.margin_threshold,
        }
    }

    pub fn embedder_options(&self, output_dim: usize) -> EmbedderOptions {
        EmbedderOptions {
            input_size: self.input_size,
            layout: self.tensor_layout,
            output_dim,
        }
    }
}

fn env_parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}
