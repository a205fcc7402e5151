//! Model Runtime Module
//!
//! Loading and hosting of the detection models behind a trait-based backend
//! system.
//!
//! Architecture:
//! - `ModelLoader` turns weights on disk into a `DetectionModel`
//! - `ModelRegistry` owns loaded models and the retry/timeout policy
//! - `ModelFetcher` resolves remote weight URLs into the local cache
//! - Automatic format detection from file extension
pub mod runtime_trait;
pub mod format_detector;
pub mod backend_loader;
pub mod model_fetcher;
pub mod model_registry;
#[cfg(feature = "onnx")]
pub mod onnx_runtime;

pub use runtime_trait::{
    DetectionModel, ModelConfig, ModelFormat, ModelLoader, ModelSource, OutputActivation,
    RuntimeMetadata, TensorLayout,
};
pub use format_detector::FormatDetector;
pub use backend_loader::BackendLoader;
pub use model_fetcher::ModelFetcher;
pub use model_registry::{LoadState, ModelHandle, ModelRegistry, ModelStatus};
#[cfg(feature = "onnx")]
pub use onnx_runtime::OnnxRuntime;
