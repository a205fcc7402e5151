//! Default [`ModelLoader`]: picks a backend from the model's weight format.

use async_trait::async_trait;
use std::path::Path;
use tracing::info;

use super::format_detector::FormatDetector;
use super::runtime_trait::*;

#[derive(Debug, Default, Clone, Copy)]
pub struct BackendLoader;

impl BackendLoader {
    pub fn new() -> Self {
        Self
    }

    fn resolve_format(config: &ModelConfig, weights: &Path) -> anyhow::Result<ModelFormat> {
        if let Some(format) = config.format {
            return Ok(format);
        }
        FormatDetector::detect_from_path(weights).ok_or_else(|| {
            anyhow::anyhow!(
                "Could not detect model format from file: {}. Supported formats: {:?}",
                weights.display(),
                FormatDetector::supported_extensions()
            )
        })
    }
}

#[async_trait]
impl ModelLoader for BackendLoader {
    async fn load(
        &self,
        config: &ModelConfig,
        weights: &Path,
    ) -> anyhow::Result<Box<dyn DetectionModel>> {
        let format = Self::resolve_format(config, weights)?;
        info!("Detected format for {}: {}", config.name, format.name());

        match format {
            ModelFormat::Onnx => load_onnx(config, weights).await,
            ModelFormat::TorchScript => Err(anyhow::anyhow!(
                "TorchScript weights ({}) cannot be executed directly; export the model to ONNX",
                weights.display()
            )),
        }
    }
}

#[cfg(feature = "onnx")]
async fn load_onnx(config: &ModelConfig, weights: &Path) -> anyhow::Result<Box<dyn DetectionModel>> {
    let config = config.clone();
    let weights = weights.to_path_buf();
    let runtime = tokio::task::spawn_blocking(move || {
        super::onnx_runtime::OnnxRuntime::open(&config, &weights)
    })
    .await??;
    Ok(Box::new(runtime))
}

#[cfg(not(feature = "onnx"))]
async fn load_onnx(config: &ModelConfig, _weights: &Path) -> anyhow::Result<Box<dyn DetectionModel>> {
    Err(anyhow::anyhow!(
        "Model {} is ONNX but this build has no ONNX backend; rebuild with --features onnx",
        config.name
    ))
}
