//! Dual-model plant disease inference core.
//!
//! Raw image bytes go in, an [`EnsembleResult`] comes out: the image is
//! normalized, both detection models run concurrently, and their answers are
//! reconciled into one diagnosis with treatment recommendations.

pub mod config;
pub mod ensemble;
pub mod error;
pub mod image_normalizer;
pub mod inference_runner;
pub mod labels;
pub mod metrics;
pub mod model_runtime;
pub mod pipeline;
pub mod request_cleanup;
pub mod telemetry;

// Public API exports
pub use config::Config;
pub use ensemble::{EnsembleResolver, EnsembleResult, PrimaryResult, Selection};
pub use error::{ModelFailure, Result, SentinelError};
pub use image_normalizer::{ImageNormalizer, NormalizedImage, DEFAULT_TARGET_SIZE};
pub use inference_runner::{InferenceRunner, ModelOutcome, PredictionResult};
pub use labels::DiseaseClass;
pub use model_runtime::{ModelConfig, ModelHandle, ModelRegistry};
pub use pipeline::DiagnosisPipeline;
pub use request_cleanup::{RequestScope, ResourceTracker};
