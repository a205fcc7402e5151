use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, SentinelError};
use crate::model_runtime::{ModelConfig, ModelSource, OutputActivation, TensorLayout};

/// One entry of `SENTINEL_MODELS`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelEntry {
    pub name: String,
    pub source: ModelSource,
    pub layout: TensorLayout,
    pub activation: OutputActivation,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Evaluation order; the first model wins confidence ties.
    pub models: Vec<ModelEntry>,
    pub load_timeout_seconds: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub target_image_size: u32,
    pub inference_timeout_seconds: Option<u64>,
    pub work_dir: PathBuf,
    pub model_cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. `from_env` passes the process
    /// environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let names: Vec<String> = var("SENTINEL_MODELS", "yolov5,yolov7")
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(SentinelError::Config("SENTINEL_MODELS lists no models".into()));
        }

        let mut models = Vec::with_capacity(names.len());
        for name in names {
            let key = env_key(&name);
            let path = lookup(&format!("MODEL_{}_PATH", key))
                .unwrap_or_else(|| default_model_path(&name));

            let layout_var = format!("MODEL_{}_LAYOUT", key);
            let layout = match lookup(&layout_var) {
                Some(v) => TensorLayout::parse(&v).ok_or_else(|| {
                    SentinelError::Config(format!("{} must be nhwc or nchw, got '{}'", layout_var, v))
                })?,
                None => TensorLayout::default(),
            };

            let activation_var = format!("MODEL_{}_ACTIVATION", key);
            let activation = match lookup(&activation_var) {
                Some(v) => OutputActivation::parse(&v).ok_or_else(|| {
                    SentinelError::Config(format!(
                        "{} must be identity or softmax, got '{}'",
                        activation_var, v
                    ))
                })?,
                None => OutputActivation::default(),
            };

            models.push(ModelEntry {
                name,
                source: ModelSource::parse(&path),
                layout,
                activation,
            });
        }

        let work_dir = lookup("SENTINEL_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("sentinel"));
        let model_cache_dir = lookup("MODEL_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| work_dir.join("models"));

        let inference_timeout_seconds = match lookup("INFERENCE_TIMEOUT_SECONDS") {
            Some(v) if !v.trim().is_empty() => Some(parse_number("INFERENCE_TIMEOUT_SECONDS", &v)?),
            _ => None,
        };

        let config = Self {
            models,
            load_timeout_seconds: parse_number(
                "MODEL_LOAD_TIMEOUT_SECONDS",
                &var("MODEL_LOAD_TIMEOUT_SECONDS", "60"),
            )?,
            retry_attempts: parse_number(
                "MODEL_LOAD_RETRY_ATTEMPTS",
                &var("MODEL_LOAD_RETRY_ATTEMPTS", "3"),
            )?,
            retry_delay_ms: parse_number(
                "MODEL_LOAD_RETRY_DELAY_MS",
                &var("MODEL_LOAD_RETRY_DELAY_MS", "1000"),
            )?,
            target_image_size: parse_number("TARGET_IMAGE_SIZE", &var("TARGET_IMAGE_SIZE", "640"))?,
            inference_timeout_seconds,
            work_dir,
            model_cache_dir,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.retry_attempts == 0 {
            return Err(SentinelError::Config(
                "MODEL_LOAD_RETRY_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.target_image_size == 0 {
            return Err(SentinelError::Config("TARGET_IMAGE_SIZE must be positive".into()));
        }
        if self.load_timeout_seconds == 0 {
            return Err(SentinelError::Config(
                "MODEL_LOAD_TIMEOUT_SECONDS must be positive".into(),
            ));
        }
        if self.inference_timeout_seconds == Some(0) {
            return Err(SentinelError::Config(
                "INFERENCE_TIMEOUT_SECONDS must be positive; leave it unset for no limit".into(),
            ));
        }
        Ok(())
    }

    /// Per-model registry configuration, in evaluation order.
    pub fn model_configs(&self) -> Vec<ModelConfig> {
        self.models
            .iter()
            .map(|entry| ModelConfig {
                name: entry.name.clone(),
                source: entry.source.clone(),
                format: None,
                input_size: self.target_image_size,
                layout: entry.layout,
                activation: entry.activation,
                load_timeout: Duration::from_secs(self.load_timeout_seconds),
                retry_attempts: self.retry_attempts,
                retry_delay: Duration::from_millis(self.retry_delay_ms),
            })
            .collect()
    }

    pub fn inference_timeout(&self) -> Option<Duration> {
        self.inference_timeout_seconds.map(Duration::from_secs)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        for model in &self.models {
            info!(
                "- Model {}: {} ({:?}, {:?})",
                model.name,
                model.source.describe(),
                model.layout,
                model.activation
            );
        }
        info!("- Load Timeout: {}s", self.load_timeout_seconds);
        info!("- Load Retries: {} x {}ms", self.retry_attempts, self.retry_delay_ms);
        info!("- Target Image Size: {}", self.target_image_size);
        match self.inference_timeout_seconds {
            Some(t) => info!("- Inference Timeout: {}s", t),
            None => info!("- Inference Timeout: none"),
        }
        info!("- Work Dir: {}", self.work_dir.display());
        info!("- Model Cache: {}", self.model_cache_dir.display());
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SentinelError::Config(format!("{} is not a valid number: '{}'", key, value)))
}

/// `yolov5` -> `YOLOV5`, `my-net` -> `MY_NET`.
fn env_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// `yolov5` -> `models/yolov5/modelv5.onnx`.
fn default_model_path(name: &str) -> String {
    match name.strip_prefix("yolo") {
        Some(suffix) if !suffix.is_empty() => format!("models/{}/model{}.onnx", name, suffix),
        _ => format!("models/{}/model.onnx", name),
    }
}
