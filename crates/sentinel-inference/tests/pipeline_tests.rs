use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use sentinel_inference::labels::{self, DiseaseClass};
use sentinel_inference::model_runtime::{
    DetectionModel, ModelConfig, ModelFetcher, ModelLoader, ModelRegistry, ModelSource,
    OutputActivation, RuntimeMetadata,
};
use sentinel_inference::{DiagnosisPipeline, NormalizedImage, Selection, SentinelError};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SIZE: u32 = 32;

#[derive(Clone)]
enum Script {
    /// Probability `confidence` at `index`, zero elsewhere.
    Predict { index: usize, confidence: f32 },
    Fail,
    /// Answers the warmup pass, then never returns.
    HangAfterWarmup,
    /// Deletes everything staged in the work directory, then predicts.
    ClearWorkDir { index: usize, confidence: f32 },
}

struct ScriptedModel {
    script: Script,
    calls: AtomicUsize,
    work_dir: PathBuf,
}

#[async_trait]
impl DetectionModel for ScriptedModel {
    async fn forward(&self, image: &NormalizedImage) -> anyhow::Result<Vec<f32>> {
        assert_eq!(image.shape(), [1, SIZE as usize, SIZE as usize, 3]);
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            Script::Predict { index, confidence } => {
                let mut scores = vec![0.0; 9];
                scores[*index] = *confidence;
                Ok(scores)
            }
            Script::Fail => anyhow::bail!("forward pass crashed"),
            Script::HangAfterWarmup => {
                if call > 0 {
                    futures::future::pending::<()>().await;
                }
                Ok(vec![1.0; 9])
            }
            Script::ClearWorkDir { index, confidence } => {
                if let Ok(entries) = std::fs::read_dir(&self.work_dir) {
                    for entry in entries.flatten() {
                        let _ = std::fs::remove_file(entry.path());
                    }
                }
                let mut scores = vec![0.0; 9];
                scores[*index] = *confidence;
                Ok(scores)
            }
        }
    }

    fn metadata(&self) -> RuntimeMetadata {
        RuntimeMetadata {
            format: None,
            runtime_name: "scripted".to_string(),
            version: "test".to_string(),
            supports_gpu: false,
        }
    }
}

struct ScriptedLoader {
    scripts: HashMap<String, Script>,
    work_dir: PathBuf,
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(
        &self,
        config: &ModelConfig,
        _weights: &Path,
    ) -> anyhow::Result<Box<dyn DetectionModel>> {
        let script = self
            .scripts
            .get(&config.name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no script for {}", config.name))?;
        Ok(Box::new(ScriptedModel {
            script,
            calls: AtomicUsize::new(0),
            work_dir: self.work_dir.clone(),
        }))
    }
}

struct Harness {
    pipeline: DiagnosisPipeline,
    work_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(models: &[(&str, Script)]) -> Self {
        Self::with_missing(models, &[])
    }

    /// `missing` names get a weights path that does not exist.
    fn with_missing(models: &[(&str, Script)], missing: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("weights.onnx");
        std::fs::write(&weights, b"weights").unwrap();

        let configs = models
            .iter()
            .map(|(name, _)| {
                let path = if missing.contains(name) {
                    dir.path().join("absent.onnx")
                } else {
                    weights.clone()
                };
                let mut config = ModelConfig::new(*name, ModelSource::Path(path));
                config.input_size = SIZE;
                config.activation = OutputActivation::Identity;
                config.retry_delay = Duration::from_millis(1);
                config
            })
            .collect();
        let work_dir = dir.path().join("work");
        let loader = ScriptedLoader {
            scripts: models
                .iter()
                .map(|(name, script)| (name.to_string(), script.clone()))
                .collect(),
            work_dir: work_dir.clone(),
        };
        let registry = ModelRegistry::new(
            configs,
            Arc::new(loader),
            ModelFetcher::new(dir.path().join("cache")),
        )
        .unwrap();

        Self {
            pipeline: DiagnosisPipeline::new(registry, SIZE, &work_dir),
            work_dir,
            _dir: dir,
        }
    }

    fn staged_files(&self) -> usize {
        std::fs::read_dir(&self.work_dir)
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn predict(index: usize, confidence: f32) -> Script {
    Script::Predict { index, confidence }
}

fn rgb_png(width: u32, height: u32) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut cursor, ImageOutputFormat::Png)
        .unwrap();
    Bytes::from(cursor.into_inner())
}

#[tokio::test]
async fn healthy_leaf_resolves_to_most_confident_model() {
    let h = Harness::new(&[("A", predict(1, 0.91)), ("B", predict(1, 0.77))]);

    let result = h.pipeline.diagnose(rgb_png(224, 224)).await.unwrap();

    let primary = &result.primary.prediction;
    assert_eq!(primary.model_name, "A");
    assert_eq!(primary.disease_label, "Healthy");
    assert!((primary.confidence - 0.91).abs() < 1e-6);
    let expected: Vec<String> = DiseaseClass::Healthy
        .recommendations()
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(result.recommendations(), expected.as_slice());

    let models: Vec<_> = result.per_model.iter().map(|p| p.model_name.as_str()).collect();
    assert_eq!(models, vec!["A", "B"]);
    assert!(result.failures.is_empty());
    assert_eq!(h.pipeline.tracker().live(), 0);
}

#[tokio::test]
async fn one_failing_model_still_yields_a_diagnosis() {
    let h = Harness::new(&[("A", predict(2, 0.60)), ("B", Script::Fail)]);

    let result = h
        .pipeline
        .diagnose_upload("leaf.png", rgb_png(300, 200))
        .await
        .unwrap();

    assert_eq!(result.per_model.len(), 1);
    assert_eq!(result.per_model[0].model_name, "A");
    assert_eq!(result.primary.prediction.disease_label, "Late Blight");
    assert_eq!(result.primary.selection, Selection::Sole);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].model, "B");
    assert_eq!(result.failures[0].kind, "InferenceError");

    assert_eq!(h.pipeline.tracker().live(), 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn equal_confidence_goes_to_first_model() {
    let h = Harness::new(&[("A", predict(6, 0.42)), ("B", predict(0, 0.42))]);

    for _ in 0..5 {
        let result = h.pipeline.diagnose(rgb_png(64, 64)).await.unwrap();
        assert_eq!(result.primary.prediction.model_name, "A");
        assert_eq!(result.primary.prediction.disease_label, "Septoria");
        assert_eq!(
            result.primary.selection,
            Selection::Tie {
                tied_with: vec!["B".to_string()]
            }
        );
    }
}

#[tokio::test]
async fn every_model_failing_is_all_models_failed() {
    let h = Harness::new(&[("A", Script::Fail), ("B", Script::Fail)]);

    let err = h
        .pipeline
        .diagnose_upload("leaf.jpg", rgb_png(50, 50))
        .await
        .unwrap_err();

    match err {
        SentinelError::AllModelsFailed { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures.iter().all(|f| f.kind == "InferenceError"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(h.pipeline.tracker().live(), 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn missing_weights_are_reported_per_model() {
    let h = Harness::with_missing(&[("A", predict(3, 0.8)), ("B", predict(1, 0.99))], &["B"]);

    let result = h.pipeline.diagnose(rgb_png(40, 40)).await.unwrap();

    assert_eq!(result.primary.prediction.model_name, "A");
    assert_eq!(result.primary.prediction.disease_label, "Leaf Miner");
    assert_eq!(result.failures[0].kind, "ModelFilesMissing");
    assert_eq!(h.pipeline.registry().load_attempts(), 1);
}

#[tokio::test]
async fn non_image_upload_is_rejected_and_cleaned_up() {
    let h = Harness::new(&[("A", predict(1, 0.9))]);

    let err = h
        .pipeline
        .diagnose_upload("notes.txt", Bytes::from_static(b"just some text, not pixels"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "UnsupportedFormat");
    assert!(!err.is_retryable());
    assert_eq!(h.pipeline.tracker().live(), 0);
    assert_eq!(h.staged_files(), 0);
    // Input errors never touch the registry.
    assert_eq!(h.pipeline.registry().load_attempts(), 0);
}

#[tokio::test]
async fn vanished_staged_copy_does_not_mask_the_diagnosis() {
    let h = Harness::new(&[
        ("A", Script::ClearWorkDir { index: 7, confidence: 0.83 }),
        ("B", predict(1, 0.40)),
    ]);

    let result = h
        .pipeline
        .diagnose_upload("leaf.png", rgb_png(64, 64))
        .await
        .unwrap();

    assert_eq!(result.primary.prediction.model_name, "A");
    assert_eq!(result.primary.prediction.disease_label, labels::label_for_index(7));
    assert_eq!(h.pipeline.tracker().cleanup_failures(), 1);
    assert_eq!(h.pipeline.tracker().live(), 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn dropped_request_releases_its_resources() {
    let h = Harness::new(&[("A", predict(1, 0.9)), ("B", Script::HangAfterWarmup)]);

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        h.pipeline.diagnose_upload("frame.png", rgb_png(64, 48)),
    )
    .await;

    assert!(outcome.is_err(), "request should still be waiting on model B");
    assert_eq!(h.pipeline.tracker().live(), 0);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_load_each_model_once() {
    let h = Harness::new(&[("A", predict(4, 0.7)), ("B", predict(5, 0.8))]);
    let image = rgb_png(128, 96);

    let results = join_all((0..10).map(|_| h.pipeline.diagnose(image.clone()))).await;

    for result in results {
        let result = result.unwrap();
        assert_eq!(result.primary.prediction.model_name, "B");
        assert_eq!(result.primary.prediction.disease_label, labels::label_for_index(5));
    }
    assert_eq!(h.pipeline.registry().load_attempts(), 2);
    assert_eq!(h.pipeline.tracker().live(), 0);
}

#[tokio::test]
async fn result_serializes_to_wire_shape() {
    let h = Harness::new(&[("yolov5", predict(0, 0.55)), ("yolov7", predict(0, 0.35))]);

    let result = h.pipeline.diagnose(rgb_png(20, 20)).await.unwrap();
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["primary"]["model"], "yolov5");
    assert_eq!(json["primary"]["disease"], "Early Blight");
    assert_eq!(json["primary"]["recommendations"].as_array().unwrap().len(), 4);
    assert_eq!(json["perModel"].as_array().unwrap().len(), 2);
    assert_eq!(json["perModel"][1]["model"], "yolov7");
    assert!(json["processingTimeMs"].is_u64());
    assert_eq!(json["requestId"].as_str().unwrap().len(), 36);
}
