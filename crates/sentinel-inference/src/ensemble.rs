//! Reconciles per-model predictions into one answer.
//!
//! The primary result is the prediction with the strictly highest confidence.
//! On an exact tie the model evaluated first wins. Confidences from the two
//! models are compared as-is, without calibration.

use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ModelFailure, Result, SentinelError};
use crate::inference_runner::{ModelOutcome, PredictionResult};
use crate::labels;

/// How the primary prediction was chosen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum Selection {
    /// Only one model produced a prediction.
    Sole,
    /// Beat the runner-up by `margin`.
    HigherConfidence { margin: f32 },
    /// Same confidence as the listed later models; evaluation order decided.
    Tie {
        #[serde(rename = "tiedWith")]
        tied_with: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrimaryResult {
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub recommendations: Vec<String>,
    pub selection: Selection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnsembleResult {
    pub request_id: Uuid,
    pub primary: PrimaryResult,
    /// Successful predictions in evaluation order; failed models are absent.
    pub per_model: Vec<PredictionResult>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ModelFailure>,
    pub processing_time_ms: u64,
}

impl EnsembleResult {
    pub fn recommendations(&self) -> &[String] {
        &self.primary.recommendations
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnsembleResolver;

impl EnsembleResolver {
    pub fn new() -> Self {
        Self
    }

    /// Pick a primary from `predictions` and attach its recommendations.
    ///
    /// `predictions` must be in evaluation order. An empty list is an
    /// `AllModelsFailed` error with no recorded failures.
    pub fn resolve(&self, predictions: Vec<PredictionResult>) -> Result<EnsembleResult> {
        self.build(predictions, Vec::new())
    }

    /// Like [`resolve`](Self::resolve), keeping failed models as failure
    /// records instead of dropping them silently.
    pub fn resolve_outcomes(&self, outcomes: Vec<ModelOutcome>) -> Result<EnsembleResult> {
        let mut predictions = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(prediction) => predictions.push(prediction),
                Err(e) => failures.push(ModelFailure::from_error(&outcome.model, &e)),
            }
        }
        self.build(predictions, failures)
    }

    fn build(
        &self,
        predictions: Vec<PredictionResult>,
        failures: Vec<ModelFailure>,
    ) -> Result<EnsembleResult> {
        let Some(best) = select_primary(&predictions) else {
            return Err(SentinelError::AllModelsFailed { failures });
        };

        let winner = &predictions[best];
        let selection = describe_selection(&predictions, best);
        debug!(
            "Primary is {} ({} @ {:.3}), selection {:?}",
            winner.model_name, winner.disease_label, winner.confidence, selection
        );

        let primary = PrimaryResult {
            prediction: winner.clone(),
            recommendations: labels::recommendations_for(&winner.disease_label),
            selection,
        };

        Ok(EnsembleResult {
            request_id: Uuid::new_v4(),
            primary,
            per_model: predictions,
            failures,
            processing_time_ms: 0,
        })
    }
}

/// Index of the first prediction holding the maximum confidence.
fn select_primary(predictions: &[PredictionResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, p) in predictions.iter().enumerate() {
        match best {
            Some(b) if p.confidence <= predictions[b].confidence => {}
            _ => best = Some(i),
        }
    }
    best
}

fn describe_selection(predictions: &[PredictionResult], best: usize) -> Selection {
    if predictions.len() == 1 {
        return Selection::Sole;
    }

    let top = predictions[best].confidence;
    let tied_with: Vec<String> = predictions
        .iter()
        .enumerate()
        .filter(|(i, p)| *i != best && p.confidence == top)
        .map(|(_, p)| p.model_name.clone())
        .collect();
    if !tied_with.is_empty() {
        return Selection::Tie { tied_with };
    }

    let runner_up = predictions
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != best)
        .map(|(_, p)| p.confidence)
        .fold(f32::NEG_INFINITY, f32::max);
    Selection::HigherConfidence {
        margin: top - runner_up,
    }
}
