//! Resolves a model source to a local weights file, downloading http(s)
//! sources into the model cache directory on first use.

use anyhow::Context;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::runtime_trait::{ModelConfig, ModelSource};

#[derive(Clone)]
pub struct ModelFetcher {
    cache_dir: PathBuf,
    http_client: reqwest::Client,
}

impl ModelFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Where the weights for `config` live (or will live) on disk.
    pub fn local_path(&self, config: &ModelConfig) -> PathBuf {
        match &config.source {
            ModelSource::Path(path) => path.clone(),
            ModelSource::Url(url) => {
                let file_name = url
                    .split(['?', '#'])
                    .next()
                    .and_then(|u| u.rsplit('/').next())
                    .filter(|name| !name.is_empty())
                    .unwrap_or("model.onnx");
                self.cache_dir.join(&config.name).join(file_name)
            }
        }
    }

    /// Ensure the weights are on disk and return their path.
    ///
    /// Local sources are returned untouched; remote ones are downloaded once
    /// and reused afterwards.
    pub async fn fetch(&self, config: &ModelConfig) -> anyhow::Result<PathBuf> {
        let target = self.local_path(config);
        let url = match &config.source {
            ModelSource::Path(_) => return Ok(target),
            ModelSource::Url(url) => url,
        };

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!("Using cached weights for {}: {}", config.name, target.display());
            return Ok(target);
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating model cache dir {}", parent.display()))?;
        }

        info!("Downloading weights for {} from {}", config.name, url);
        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Model download request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Model download returned HTTP {} for {}",
                response.status(),
                url
            ));
        }

        // Write to a side file and rename so a half-finished download is never
        // mistaken for a cached model.
        let partial = target.with_extension("part");
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("creating {}", partial.display()))?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("Model download interrupted: {}", e))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&partial, &target).await?;

        info!(
            "Downloaded {} bytes of weights for {} to {}",
            written,
            config.name,
            target.display()
        );
        Ok(target)
    }
}
