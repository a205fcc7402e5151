//! Traits and configuration shared by every detection backend.
//!
//! The forward pass itself is opaque to this crate: a backend receives a
//! [`NormalizedImage`] and hands back one raw score vector. Everything around
//! it (loading, retries, warmup, caching) lives in the registry.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::image_normalizer::NormalizedImage;

/// On-disk weight formats the backend loader knows how to recognise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    Onnx,
    /// PyTorch TorchScript / pickled checkpoints.
    TorchScript,
}

impl ModelFormat {
    pub fn extensions(&self) -> &[&str] {
        match self {
            ModelFormat::Onnx => &["onnx"],
            ModelFormat::TorchScript => &["pt", "pth", "torchscript"],
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModelFormat::Onnx => "ONNX Runtime",
            ModelFormat::TorchScript => "TorchScript",
        }
    }
}

/// Memory order of the input tensor a model was exported with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// (batch, height, width, channels)
    Nhwc,
    /// (batch, channels, height, width), the usual YOLO export.
    #[default]
    Nchw,
}

impl TensorLayout {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nhwc" => Some(TensorLayout::Nhwc),
            "nchw" => Some(TensorLayout::Nchw),
            _ => None,
        }
    }
}

/// Post-processing applied to the raw output vector before argmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Scores are already probabilities.
    Identity,
    /// Scores are logits.
    #[default]
    Softmax,
}

impl OutputActivation {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "identity" | "none" => Some(OutputActivation::Identity),
            "softmax" => Some(OutputActivation::Softmax),
            _ => None,
        }
    }
}

/// Where a model's weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelSource {
    Path(PathBuf),
    /// http(s) location, fetched once into the model cache directory.
    Url(String),
}

impl ModelSource {
    pub fn parse(value: &str) -> Self {
        if value.starts_with("http://") || value.starts_with("https://") {
            ModelSource::Url(value.to_string())
        } else {
            ModelSource::Path(PathBuf::from(value))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModelSource::Path(p) => p.display().to_string(),
            ModelSource::Url(u) => u.clone(),
        }
    }
}

/// Static per-model attributes. Built once at startup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub source: ModelSource,
    /// `None` means detect from the file extension.
    pub format: Option<ModelFormat>,
    /// Side length of the square input image.
    pub input_size: u32,
    pub layout: TensorLayout,
    pub activation: OutputActivation,
    pub load_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl ModelConfig {
    pub fn new(name: impl Into<String>, source: ModelSource) -> Self {
        Self {
            name: name.into(),
            source,
            ..Default::default()
        }
    }

    /// Input tensor shape in the model's own layout.
    pub fn expected_shape(&self) -> [usize; 4] {
        let side = self.input_size as usize;
        match self.layout {
            TensorLayout::Nhwc => [1, side, side, 3],
            TensorLayout::Nchw => [1, 3, side, side],
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            source: ModelSource::Path(PathBuf::new()),
            format: None,
            input_size: 640,
            layout: TensorLayout::default(),
            activation: OutputActivation::default(),
            load_timeout: Duration::from_secs(60),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// A loaded, ready-to-run detection model.
#[async_trait]
pub trait DetectionModel: Send + Sync {
    /// Run one forward pass and return the raw class score vector.
    async fn forward(&self, image: &NormalizedImage) -> anyhow::Result<Vec<f32>>;

    /// Release backend resources. Called at most once, by the registry.
    async fn shutdown(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn metadata(&self) -> RuntimeMetadata;
}

/// Turns a model file into a [`DetectionModel`].
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Files that must exist before any load attempt is made.
    fn required_files(&self, _config: &ModelConfig, weights: &Path) -> Vec<PathBuf> {
        vec![weights.to_path_buf()]
    }

    async fn load(
        &self,
        config: &ModelConfig,
        weights: &Path,
    ) -> anyhow::Result<Box<dyn DetectionModel>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub format: Option<ModelFormat>,
    pub runtime_name: String,
    pub version: String,
    pub supports_gpu: bool,
}
