//! End-to-end diagnosis of one image.
//!
//! normalize -> load models -> run models -> resolve ensemble, all inside a
//! [`RequestScope`] so every resource the request creates is released on
//! every exit path, including the caller dropping the future.

use bytes::Bytes;
use futures::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::Config;
use crate::ensemble::{EnsembleResolver, EnsembleResult};
use crate::error::{Result, SentinelError};
use crate::image_normalizer::ImageNormalizer;
use crate::inference_runner::{InferenceRunner, ModelOutcome};
use crate::metrics;
use crate::model_runtime::{BackendLoader, ModelFetcher, ModelLoader, ModelRegistry};
use crate::request_cleanup::{RequestScope, ResourceTracker};

lazy_static! {
    static ref UNSAFE_FILENAME_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]+").unwrap();
}

const MAX_FILENAME_LEN: usize = 100;

pub struct DiagnosisPipeline {
    registry: ModelRegistry,
    normalizer: ImageNormalizer,
    runner: InferenceRunner,
    resolver: EnsembleResolver,
    tracker: ResourceTracker,
    work_dir: PathBuf,
}

impl DiagnosisPipeline {
    pub fn new(registry: ModelRegistry, target_size: u32, work_dir: impl Into<PathBuf>) -> Self {
        let tracker = ResourceTracker::new();
        Self {
            registry,
            normalizer: ImageNormalizer::new(target_size, tracker.clone()),
            runner: InferenceRunner::new(tracker.clone()),
            resolver: EnsembleResolver::new(),
            tracker,
            work_dir: work_dir.into(),
        }
    }

    pub fn with_inference_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.runner = self.runner.with_timeout(timeout);
        self
    }

    /// Pipeline backed by the format-dispatching [`BackendLoader`].
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_loader(config, Arc::new(BackendLoader::new()))
    }

    pub fn from_config_with_loader(config: &Config, loader: Arc<dyn ModelLoader>) -> Result<Self> {
        let registry = ModelRegistry::new(
            config.model_configs(),
            loader,
            ModelFetcher::new(&config.model_cache_dir),
        )?;
        Ok(Self::new(registry, config.target_image_size, &config.work_dir)
            .with_inference_timeout(config.inference_timeout()))
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &ResourceTracker {
        &self.tracker
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Diagnose an in-memory image (e.g. a decoded camera frame).
    pub async fn diagnose(&self, image: Bytes) -> Result<EnsembleResult> {
        let started = Instant::now();
        let scope = RequestScope::new(self.tracker.clone());
        let result = self.run_in_scope(&scope, image).await;
        self.finish(scope, started, result)
    }

    /// Diagnose an uploaded file.
    ///
    /// The bytes are staged as a sanitized copy in the work directory and read
    /// back from there; the copy is removed before this returns. The caller
    /// still owns (and deletes) its own upload.
    pub async fn diagnose_upload(&self, filename: &str, contents: Bytes) -> Result<EnsembleResult> {
        let started = Instant::now();
        let scope = RequestScope::new(self.tracker.clone());
        let result = self.stage_and_run(&scope, filename, contents).await;
        self.finish(scope, started, result)
    }

    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn stage_and_run(
        &self,
        scope: &RequestScope,
        filename: &str,
        contents: Bytes,
    ) -> Result<EnsembleResult> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let staged = self
            .work_dir
            .join(format!("{}_{}", scope.id().simple(), sanitize_filename(filename)));
        let path = scope.write_temp_file(staged, &contents).await?;
        drop(contents);

        let image = Bytes::from(tokio::fs::read(&path).await?);
        self.run_in_scope(scope, image).await
    }

    async fn run_in_scope(&self, scope: &RequestScope, image: Bytes) -> Result<EnsembleResult> {
        let normalizer = self.normalizer.clone();
        let normalized = tokio::task::spawn_blocking(move || normalizer.normalize(&image))
            .await
            .map_err(|e| SentinelError::DecodeError(format!("normalization task failed: {}", e)))??;
        let normalized = scope.hold("normalized image", normalized);

        let names = self.registry.model_names();
        let loads = join_all(names.iter().map(|name| self.registry.get(name))).await;

        // Keep a slot per configured model so outcomes stay in evaluation order.
        let mut slots = Vec::with_capacity(names.len());
        let mut handles = Vec::new();
        for (name, loaded) in names.iter().zip(loads) {
            match loaded {
                Ok(handle) => {
                    handles.push(handle);
                    slots.push(None);
                }
                Err(e) => {
                    warn!("Model {} unavailable for this request: {}", name, e);
                    slots.push(Some(ModelOutcome {
                        model: name.clone(),
                        result: Err(e),
                    }));
                }
            }
        }

        let mut ran = self.runner.run_all(&handles, &normalized).await.into_iter();
        let outcomes: Vec<ModelOutcome> = slots
            .into_iter()
            .filter_map(|slot| slot.or_else(|| ran.next()))
            .collect();

        self.resolver.resolve_outcomes(outcomes)
    }

    fn finish(
        &self,
        scope: RequestScope,
        started: Instant,
        result: Result<EnsembleResult>,
    ) -> Result<EnsembleResult> {
        let request_id = scope.id();
        scope.close();

        let elapsed = started.elapsed();
        metrics::observe_diagnosis(elapsed.as_secs_f64());

        match result {
            Ok(mut ensemble) => {
                ensemble.request_id = request_id;
                ensemble.processing_time_ms = elapsed.as_millis() as u64;
                info!(
                    "Request {}: {} ({:.3}) from {} in {}ms",
                    request_id,
                    ensemble.primary.prediction.disease_label,
                    ensemble.primary.prediction.confidence,
                    ensemble.primary.prediction.model_name,
                    ensemble.processing_time_ms
                );
                Ok(ensemble)
            }
            Err(e) => {
                warn!("Request {} failed after {:?}: {}", request_id, elapsed, e);
                Err(e)
            }
        }
    }
}

/// Keep only filename-safe characters; never empty, never hidden.
pub fn sanitize_filename(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(base, "_");
    let cleaned: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_FILENAME_LEN)
        .collect();
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
