//! Error taxonomy for the inference core.
//!
//! Every failure that crosses the crate boundary is a [`SentinelError`]. Backend
//! adapters work with `anyhow` internally; their messages are folded into the
//! matching variant at the registry and runner boundaries.
//!
//! The enum is `Clone` so a single in-flight model load can hand the same
//! outcome to every caller waiting on it.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SentinelError {
    /// Backing files for a model are absent. Configuration problem, never retried.
    #[error("model files missing for '{model}': {path}")]
    ModelFilesMissing { model: String, path: String },

    /// The final load attempt exceeded its time budget.
    #[error("loading model '{model}' timed out after {attempts} attempt(s) ({timeout_ms} ms per attempt)")]
    ModelLoadTimeout {
        model: String,
        attempts: u32,
        timeout_ms: u64,
    },

    #[error("loading model '{model}' failed after {attempts} attempt(s): {last_error}")]
    ModelLoadFailed {
        model: String,
        attempts: u32,
        last_error: String,
    },

    #[error("model '{0}' is not configured")]
    UnknownModel(String),

    #[error("failed to decode image: {0}")]
    DecodeError(String),

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    /// One model's forward pass failed. Scoped to a single request.
    #[error("inference failed for model '{model}': {message}")]
    InferenceError { model: String, message: String },

    #[error("all {} model(s) failed: {}", .failures.len(), summarize(.failures))]
    AllModelsFailed { failures: Vec<ModelFailure> },

    /// Releasing a request resource failed. Logged by the cleanup scope, never
    /// returned as the outcome of a request.
    #[error("cleanup of {resource} failed: {message}")]
    CleanupFailure { resource: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// A per-model failure recorded alongside successful predictions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFailure {
    pub model: String,
    pub kind: String,
    pub message: String,
}

impl ModelFailure {
    pub fn from_error(model: &str, err: &SentinelError) -> Self {
        Self {
            model: model.to_string(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

fn summarize(failures: &[ModelFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.model, f.kind))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SentinelError {
    /// Stable machine-readable code for callers that format their own envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            SentinelError::ModelFilesMissing { .. } => "ModelFilesMissing",
            SentinelError::ModelLoadTimeout { .. } => "ModelLoadTimeout",
            SentinelError::ModelLoadFailed { .. } => "ModelLoadFailed",
            SentinelError::UnknownModel(_) => "UnknownModel",
            SentinelError::DecodeError(_) => "DecodeError",
            SentinelError::UnsupportedFormat(_) => "UnsupportedFormat",
            SentinelError::InferenceError { .. } => "InferenceError",
            SentinelError::AllModelsFailed { .. } => "AllModelsFailed",
            SentinelError::CleanupFailure { .. } => "CleanupFailure",
            SentinelError::Config(_) => "Config",
            SentinelError::Io(_) => "Io",
        }
    }

    /// Whether repeating the same request could plausibly succeed.
    ///
    /// Input and configuration errors need a fix first; load and inference
    /// failures may be transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SentinelError::ModelLoadTimeout { .. }
                | SentinelError::ModelLoadFailed { .. }
                | SentinelError::InferenceError { .. }
                | SentinelError::AllModelsFailed { .. }
                | SentinelError::Io(_)
        )
    }
}

impl From<std::io::Error> for SentinelError {
    fn from(err: std::io::Error) -> Self {
        SentinelError::Io(err.to_string())
    }
}

impl From<image::ImageError> for SentinelError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Unsupported(e) => SentinelError::UnsupportedFormat(e.to_string()),
            other => SentinelError::DecodeError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SentinelError::ModelLoadFailed {
            model: "yolov5".to_string(),
            attempts: 3,
            last_error: "bad header".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "loading model 'yolov5' failed after 3 attempt(s): bad header"
        );
    }

    #[test]
    fn test_all_models_failed_lists_models() {
        let failures = vec![
            ModelFailure::from_error(
                "yolov5",
                &SentinelError::InferenceError {
                    model: "yolov5".into(),
                    message: "boom".into(),
                },
            ),
            ModelFailure::from_error("yolov7", &SentinelError::UnknownModel("yolov7".into())),
        ];
        let err = SentinelError::AllModelsFailed { failures };
        let text = err.to_string();
        assert!(text.starts_with("all 2 model(s) failed"));
        assert!(text.contains("yolov5 (InferenceError)"));
        assert!(text.contains("yolov7 (UnknownModel)"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SentinelError = io_err.into();
        assert_eq!(err.kind(), "Io");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!SentinelError::ModelFilesMissing {
            model: "m".into(),
            path: "p".into()
        }
        .is_retryable());
        assert!(!SentinelError::DecodeError("x".into()).is_retryable());
        assert!(SentinelError::ModelLoadTimeout {
            model: "m".into(),
            attempts: 1,
            timeout_ms: 10
        }
        .is_retryable());
    }
}
