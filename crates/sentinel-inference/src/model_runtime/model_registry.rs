//! Model Registry
//!
//! Owns every loaded detection model for the lifetime of the process. Callers
//! ask for a model by name and get back a shared handle; the first request for
//! a name triggers the load and every concurrent request for the same name
//! awaits that one load (single-flight).
//!
//! The load itself runs on a detached task so a caller that goes away cannot
//! abort an attempt half way through. Only the pause between attempts can be
//! interrupted, through [`ModelRegistry::shutdown`].

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::model_fetcher::ModelFetcher;
use super::runtime_trait::*;
use crate::error::{Result, SentinelError};
use crate::image_normalizer::NormalizedImage;
use crate::metrics;

/// A ready model plus the configuration it was loaded with.
pub struct ModelHandle {
    config: Arc<ModelConfig>,
    model: Box<dyn DetectionModel>,
}

impl ModelHandle {
    /// Wrap an already loaded model. The registry builds its handles this way.
    pub fn new(config: impl Into<Arc<ModelConfig>>, model: Box<dyn DetectionModel>) -> Self {
        Self {
            config: config.into(),
            model,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn metadata(&self) -> RuntimeMetadata {
        self.model.metadata()
    }

    pub async fn forward(&self, image: &NormalizedImage) -> anyhow::Result<Vec<f32>> {
        self.model.forward(image).await
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("name", &self.config.name)
            .field("runtime", &self.model.metadata().runtime_name)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub name: String,
    pub state: LoadState,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<ModelHandle>>>>;

/// Why a single attempt did not produce a model.
enum AttemptError {
    /// Stop retrying immediately.
    Fatal(SentinelError),
    Transient(anyhow::Error),
}

struct RegistryInner {
    /// Evaluation order is the configuration order.
    configs: Vec<Arc<ModelConfig>>,
    loader: Arc<dyn ModelLoader>,
    fetcher: ModelFetcher,
    ready: DashMap<String, Arc<ModelHandle>>,
    in_flight: DashMap<String, LoadFuture>,
    failures: DashMap<String, SentinelError>,
    load_attempts: AtomicU64,
    shutdown_tx: watch::Sender<bool>,
}

/// Cheap to clone; all clones share one cache.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(
        configs: Vec<ModelConfig>,
        loader: Arc<dyn ModelLoader>,
        fetcher: ModelFetcher,
    ) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for config in &configs {
            if config.name.trim().is_empty() {
                return Err(SentinelError::Config("model name must not be empty".into()));
            }
            if !seen.insert(config.name.clone()) {
                return Err(SentinelError::Config(format!(
                    "model '{}' is configured twice",
                    config.name
                )));
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(RegistryInner {
                configs: configs.into_iter().map(Arc::new).collect(),
                loader,
                fetcher,
                ready: DashMap::new(),
                in_flight: DashMap::new(),
                failures: DashMap::new(),
                load_attempts: AtomicU64::new(0),
                shutdown_tx,
            }),
        })
    }

    /// Configured model names in evaluation order.
    pub fn model_names(&self) -> Vec<String> {
        self.inner.configs.iter().map(|c| c.name.clone()).collect()
    }

    pub fn config(&self, name: &str) -> Option<&ModelConfig> {
        self.inner.config(name).map(|c| c.as_ref())
    }

    /// Number of times the backend loader has been invoked, across all models.
    pub fn load_attempts(&self) -> u64 {
        self.inner.load_attempts.load(Ordering::Relaxed)
    }

    /// Return the ready handle for `name`, loading it first if needed.
    pub async fn get(&self, name: &str) -> Result<Arc<ModelHandle>> {
        if let Some(handle) = self.inner.ready.get(name) {
            return Ok(handle.clone());
        }

        let config = self
            .inner
            .config(name)
            .cloned()
            .ok_or_else(|| SentinelError::UnknownModel(name.to_string()))?;

        let load = match self.inner.in_flight.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight load for model {}", name);
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                // The previous load may have finished between the fast-path
                // check and taking the entry.
                if let Some(handle) = self.inner.ready.get(name) {
                    return Ok(handle.clone());
                }

                let inner = self.inner.clone();
                let model_name = config.name.clone();
                let task = tokio::spawn(async move { inner.load_and_cache(config).await });
                let load: BoxFuture<'static, Result<Arc<ModelHandle>>> = async move {
                    match task.await {
                        Ok(result) => result,
                        Err(e) => Err(SentinelError::ModelLoadFailed {
                            model: model_name,
                            attempts: 0,
                            last_error: format!("load task aborted: {}", e),
                        }),
                    }
                }
                .boxed();
                let load = load.shared();
                entry.insert(load.clone());
                load
            }
        };

        load.await
    }

    /// Load every configured model concurrently. Returns how many are ready.
    pub async fn preload(&self) -> usize {
        let names = self.model_names();
        let results = join_all(names.iter().map(|name| self.get(name))).await;
        let mut ready = 0;
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(_) => ready += 1,
                Err(e) => error!("Preloading model {} failed: {}", name, e),
            }
        }
        info!("Preloaded {}/{} model(s)", ready, names.len());
        ready
    }

    /// Current lifecycle state of every configured model, in evaluation order.
    pub fn states(&self) -> Vec<ModelStatus> {
        self.inner
            .configs
            .iter()
            .map(|config| {
                let name = &config.name;
                let failure = self.inner.failures.get(name).map(|e| e.to_string());
                let state = if self.inner.ready.contains_key(name) {
                    LoadState::Ready
                } else if self.inner.in_flight.contains_key(name) {
                    LoadState::Loading
                } else if failure.is_some() {
                    LoadState::Failed
                } else {
                    LoadState::Unloaded
                };
                ModelStatus {
                    name: name.clone(),
                    state,
                    source: config.source.describe(),
                    last_error: failure,
                }
            })
            .collect()
    }

    /// Release one cached model, or all of them when `name` is `None`.
    ///
    /// Returns the number of handles removed from the cache. Safe to call
    /// when nothing is cached. A handle still held by a running request is
    /// released when that request drops it.
    pub async fn dispose(&self, name: Option<&str>) -> usize {
        let names: Vec<String> = match name {
            Some(n) => vec![n.to_string()],
            None => self.inner.ready.iter().map(|e| e.key().clone()).collect(),
        };

        let mut disposed = 0;
        for name in names {
            self.inner.failures.remove(&name);
            let Some((_, handle)) = self.inner.ready.remove(&name) else {
                continue;
            };
            disposed += 1;

            match Arc::try_unwrap(handle) {
                Ok(mut handle) => match handle.model.shutdown().await {
                    Ok(()) => info!("Disposed model {}", name),
                    Err(e) => warn!("Shutting down model {} failed: {}", name, e),
                },
                Err(_) => debug!(
                    "Model {} is still referenced by a request; it is released with the last handle",
                    name
                ),
            }
        }
        disposed
    }

    /// Interrupt pending retry waits and dispose every cached model.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let disposed = self.dispose(None).await;
        info!("Model registry shut down ({} model(s) disposed)", disposed);
    }
}

impl RegistryInner {
    fn config(&self, name: &str) -> Option<&Arc<ModelConfig>> {
        self.configs.iter().find(|c| c.name == name)
    }

    async fn load_and_cache(self: Arc<Self>, config: Arc<ModelConfig>) -> Result<Arc<ModelHandle>> {
        let result = self.load_with_retry(&config).await;
        match &result {
            Ok(handle) => {
                self.ready.insert(config.name.clone(), handle.clone());
                self.failures.remove(&config.name);
            }
            Err(e) => {
                self.failures.insert(config.name.clone(), e.clone());
            }
        }
        // Publish to `ready` before retiring the in-flight entry so a new
        // caller never sees neither.
        self.in_flight.remove(&config.name);
        result
    }

    async fn load_with_retry(&self, config: &Arc<ModelConfig>) -> Result<Arc<ModelHandle>> {
        let name = config.name.as_str();

        if let ModelSource::Path(path) = &config.source {
            self.check_files(config, path)?;
        }

        let max_attempts = config.retry_attempts.max(1);
        let mut attempts = 0;
        let mut last_error = String::new();
        let mut last_timed_out = false;

        while attempts < max_attempts {
            attempts += 1;
            info!(
                "Loading model {} from {} (attempt {}/{})",
                name,
                config.source.describe(),
                attempts,
                max_attempts
            );

            let started = Instant::now();
            match tokio::time::timeout(config.load_timeout, self.attempt_load(config)).await {
                Ok(Ok(model)) => {
                    metrics::inc_load_attempt(name, "ok");
                    let handle = ModelHandle::new(config.clone(), model);
                    info!(
                        "✅ Model {} loaded in {:?} (runtime: {})",
                        name,
                        started.elapsed(),
                        handle.metadata().runtime_name
                    );
                    self.warmup(&handle).await;
                    return Ok(Arc::new(handle));
                }
                Ok(Err(AttemptError::Fatal(e))) => {
                    error!("Model {} cannot be loaded: {}", name, e);
                    return Err(e);
                }
                Ok(Err(AttemptError::Transient(e))) => {
                    metrics::inc_load_attempt(name, "error");
                    warn!("Load attempt {} for model {} failed: {:#}", attempts, name, e);
                    last_error = format!("{:#}", e);
                    last_timed_out = false;
                }
                Err(_) => {
                    metrics::inc_load_attempt(name, "timeout");
                    warn!(
                        "Load attempt {} for model {} timed out after {:?}",
                        attempts, name, config.load_timeout
                    );
                    last_error = format!("attempt timed out after {:?}", config.load_timeout);
                    last_timed_out = true;
                }
            }

            if attempts < max_attempts && !self.wait_before_retry(config.retry_delay).await {
                warn!("Retry of model {} cancelled by shutdown", name);
                break;
            }
        }

        let err = if last_timed_out {
            SentinelError::ModelLoadTimeout {
                model: name.to_string(),
                attempts,
                timeout_ms: config.load_timeout.as_millis() as u64,
            }
        } else {
            SentinelError::ModelLoadFailed {
                model: name.to_string(),
                attempts,
                last_error,
            }
        };
        error!("{}", err);
        Err(err)
    }

    async fn attempt_load(
        &self,
        config: &ModelConfig,
    ) -> std::result::Result<Box<dyn DetectionModel>, AttemptError> {
        let weights = self
            .fetcher
            .fetch(config)
            .await
            .map_err(AttemptError::Transient)?;
        if matches!(config.source, ModelSource::Url(_)) {
            self.check_files(config, &weights)
                .map_err(AttemptError::Fatal)?;
        }

        self.load_attempts.fetch_add(1, Ordering::Relaxed);
        self.loader
            .load(config, &weights)
            .await
            .map_err(AttemptError::Transient)
    }

    fn check_files(&self, config: &ModelConfig, weights: &Path) -> Result<()> {
        for file in self.loader.required_files(config, weights) {
            if !file.is_file() {
                return Err(SentinelError::ModelFilesMissing {
                    model: config.name.clone(),
                    path: file.display().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Sleep for `delay`. Returns `false` if shutdown was requested first.
    async fn wait_before_retry(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown_tx.subscribe();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = async {
                let _ = shutdown.wait_for(|stopped| *stopped).await;
            } => false,
        }
    }

    async fn warmup(&self, handle: &ModelHandle) {
        let dummy = NormalizedImage::zeros(handle.config.input_size);
        let started = Instant::now();
        let limit = handle.config.load_timeout;
        match tokio::time::timeout(limit, handle.forward(&dummy)).await {
            Ok(Ok(scores)) => debug!(
                "Warmup for model {} produced {} scores in {:?}",
                handle.name(),
                scores.len(),
                started.elapsed()
            ),
            Ok(Err(e)) => warn!(
                "Warmup inference for model {} failed, keeping it loaded: {:#}",
                handle.name(),
                e
            ),
            Err(_) => warn!(
                "Warmup inference for model {} did not finish within {:?}, keeping it loaded",
                handle.name(),
                limit
            ),
        }
    }
}
