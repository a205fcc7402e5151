//! ONNX Runtime backend
//!
//! Runs exported YOLO classification heads through `ort`. The session is not
//! `Sync`-callable (`run` needs `&mut`), so it sits behind a mutex and every
//! forward pass is moved onto the blocking pool.

use async_trait::async_trait;
use ort::session::Session;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::runtime_trait::*;
use crate::image_normalizer::NormalizedImage;

pub struct OnnxRuntime {
    session: Arc<Mutex<Session>>,
    input_name: String,
    output_name: String,
    layout: TensorLayout,
}

impl OnnxRuntime {
    pub fn open(config: &ModelConfig, weights: &Path) -> anyhow::Result<Self> {
        let session = Session::builder()?.commit_from_file(weights)?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| anyhow::anyhow!("ONNX model {} declares no inputs", config.name))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| anyhow::anyhow!("ONNX model {} declares no outputs", config.name))?;

        info!(
            "ONNX session ready for {}: input '{}' ({:?}), output '{}'",
            config.name, input_name, config.layout, output_name
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            input_name,
            output_name,
            layout: config.layout,
        })
    }
}

#[async_trait]
impl DetectionModel for OnnxRuntime {
    async fn forward(&self, image: &NormalizedImage) -> anyhow::Result<Vec<f32>> {
        let shape = image.shape_in(self.layout).to_vec();
        let data = image.to_layout_vec(self.layout);
        let session = self.session.clone();
        let input_name = self.input_name.clone();
        let output_name = self.output_name.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<f32>> {
            let input = ort::value::Value::from_array((shape.as_slice(), data))?;
            let mut session = session
                .lock()
                .map_err(|_| anyhow::anyhow!("ONNX session lock poisoned"))?;
            let outputs = session.run(ort::inputs![input_name.as_str() => input])?;
            let (out_shape, scores) = outputs[output_name.as_str()].try_extract_tensor::<f32>()?;
            debug!("ONNX output shape {:?}", out_shape);
            Ok(scores.to_vec())
        })
        .await?
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            format: Some(ModelFormat::Onnx),
            runtime_name: "ONNX Runtime (ort)".to_string(),
            version: "2.0.0-rc.10".to_string(),
            supports_gpu: false,
        }
    }
}
