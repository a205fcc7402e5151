//! Runs every requested model against one normalized image.
//!
//! Models are evaluated concurrently and independently: one model failing
//! (or timing out) is recorded against that model only. Score buffers are
//! counted by the runner's [`ResourceTracker`] and released before `run`
//! returns.

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ModelFailure, Result, SentinelError};
use crate::image_normalizer::NormalizedImage;
use crate::labels;
use crate::metrics;
use crate::model_runtime::{ModelHandle, OutputActivation};
use crate::request_cleanup::ResourceTracker;

/// One model's answer for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    #[serde(rename = "model")]
    pub model_name: String,
    #[serde(rename = "disease")]
    pub disease_label: String,
    /// Always within [0, 1].
    pub confidence: f32,
    #[serde(skip)]
    pub class_index: usize,
}

/// Outcome of a single model within a run, in evaluation order.
#[derive(Debug, Clone)]
pub struct ModelOutcome {
    pub model: String,
    pub result: Result<PredictionResult>,
}

#[derive(Debug, Clone)]
pub struct InferenceRunner {
    tracker: ResourceTracker,
    inference_timeout: Option<Duration>,
}

impl InferenceRunner {
    pub fn new(tracker: ResourceTracker) -> Self {
        Self {
            tracker,
            inference_timeout: None,
        }
    }

    /// Bound each forward pass. Unset means no limit.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inference_timeout = timeout;
        self
    }

    /// Run all models; fails with `AllModelsFailed` only if none succeeded.
    pub async fn run(
        &self,
        models: &[Arc<ModelHandle>],
        image: &NormalizedImage,
    ) -> Result<Vec<ModelOutcome>> {
        let outcomes = self.run_all(models, image).await;
        if outcomes.iter().all(|o| o.result.is_err()) {
            let failures = outcomes
                .iter()
                .filter_map(|o| o.result.as_ref().err().map(|e| ModelFailure::from_error(&o.model, e)))
                .collect();
            return Err(SentinelError::AllModelsFailed { failures });
        }
        Ok(outcomes)
    }

    /// Run all models and report each outcome, successful or not.
    pub async fn run_all(
        &self,
        models: &[Arc<ModelHandle>],
        image: &NormalizedImage,
    ) -> Vec<ModelOutcome> {
        let results = join_all(models.iter().map(|m| self.run_one(m, image))).await;
        models
            .iter()
            .zip(results)
            .map(|(model, result)| ModelOutcome {
                model: model.name().to_string(),
                result,
            })
            .collect()
    }

    async fn run_one(&self, handle: &ModelHandle, image: &NormalizedImage) -> Result<PredictionResult> {
        let name = handle.name();
        let started = Instant::now();

        let result = self.predict(handle, image).await;
        match &result {
            Ok(prediction) => {
                metrics::inc_inference(name, "ok");
                debug!(
                    "Model {} predicted {} ({:.3}) in {:?}",
                    name,
                    prediction.disease_label,
                    prediction.confidence,
                    started.elapsed()
                );
            }
            Err(e) => {
                metrics::inc_inference(name, "error");
                warn!("{}", e);
            }
        }
        result
    }

    async fn predict(&self, handle: &ModelHandle, image: &NormalizedImage) -> Result<PredictionResult> {
        let name = handle.name();
        let fail = |message: String| SentinelError::InferenceError {
            model: name.to_string(),
            message,
        };

        let config = handle.config();
        let expected = config.expected_shape();
        let actual = image.shape_in(config.layout);
        if actual != expected {
            return Err(fail(format!(
                "input shape {:?} does not match the model's expected shape {:?}",
                actual, expected
            )));
        }

        let forward = handle.forward(image);
        let raw = match self.inference_timeout {
            Some(limit) => match tokio::time::timeout(limit, forward).await {
                Ok(result) => result,
                Err(_) => return Err(fail(format!("forward pass exceeded {:?}", limit))),
            },
            None => forward.await,
        }
        .map_err(|e| fail(format!("{:#}", e)))?;

        let raw = self.tracker.track("raw scores", raw);
        let scores = self.tracker.track(
            "activated scores",
            activate(&raw, config.activation).map_err(fail)?,
        );
        let (class_index, score) = argmax(&scores).ok_or_else(|| fail("model returned no scores".into()))?;

        Ok(PredictionResult {
            model_name: name.to_string(),
            disease_label: labels::label_for_index(class_index).to_string(),
            confidence: score.clamp(0.0, 1.0),
            class_index,
        })
    }
}

/// Apply the model's output activation. Rejects empty or non-finite output.
pub fn activate(scores: &[f32], activation: OutputActivation) -> std::result::Result<Vec<f32>, String> {
    if scores.is_empty() {
        return Err("model returned no scores".to_string());
    }
    if let Some(pos) = scores.iter().position(|v| !v.is_finite()) {
        return Err(format!("score {} is not finite ({})", pos, scores[pos]));
    }
    Ok(match activation {
        OutputActivation::Identity => scores.to_vec(),
        OutputActivation::Softmax => softmax(scores),
    })
}

/// Numerically stable softmax.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Index and value of the largest score. The first maximum wins ties.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
}
