//! Format Detector
//! Detects the weight format of a model file from its extension.
use super::runtime_trait::ModelFormat;
use std::path::Path;
use tracing::debug;

const KNOWN_FORMATS: [ModelFormat; 2] = [ModelFormat::Onnx, ModelFormat::TorchScript];

pub struct FormatDetector;

impl FormatDetector {
    pub fn detect_from_path(path: &Path) -> Option<ModelFormat> {
        let extension = path.extension()?.to_str()?.to_lowercase();

        let format = KNOWN_FORMATS
            .iter()
            .copied()
            .find(|f| f.extensions().contains(&extension.as_str()));

        if let Some(fmt) = format {
            debug!("Detected model format: {} for file: {}", fmt.name(), path.display());
        }
        format
    }

    pub fn supported_extensions() -> Vec<String> {
        KNOWN_FORMATS
            .iter()
            .flat_map(|f| f.extensions().iter().map(|e| e.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_onnx_detection() {
        let path = PathBuf::from("models/yolov5/modelv5.onnx");
        assert_eq!(FormatDetector::detect_from_path(&path), Some(ModelFormat::Onnx));
    }

    #[test]
    fn test_torchscript_detection_is_case_insensitive() {
        let path = PathBuf::from("models/yolov7/modelv7.PT");
        assert_eq!(
            FormatDetector::detect_from_path(&path),
            Some(ModelFormat::TorchScript)
        );
    }

    #[test]
    fn test_unknown_extension() {
        assert_eq!(FormatDetector::detect_from_path(&PathBuf::from("model.gguf")), None);
        assert_eq!(FormatDetector::detect_from_path(&PathBuf::from("model")), None);
    }

    #[test]
    fn test_supported_extensions_lists_all_formats() {
        let exts = FormatDetector::supported_extensions();
        assert!(exts.contains(&"onnx".to_string()));
        assert!(exts.contains(&"pt".to_string()));
    }
}
