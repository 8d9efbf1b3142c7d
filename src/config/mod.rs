//! Application Configuration
//!
//! Settings for the capture, panorama and detection flows, stored in TOML format.
//! Every section falls back to its defaults, so partial files are valid.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::capture::SourceId;
use crate::panorama::StitchAxis;
use crate::storage::ImageEncoding;
use crate::vision::YoloConfig;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Multi-camera still capture
    pub capture: CaptureConfig,
    /// Video to panorama
    pub panorama: PanoramaConfig,
    /// Live detection pipeline
    pub detection: DetectionConfig,
    /// Text recognition
    pub ocr: OcrConfig,
    /// Record store
    pub storage: StorageConfig,
    /// Preview window and annotation
    pub display: DisplayConfig,
}

/// Capture-related settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sources to grab one frame from
    pub sources: Vec<SourceId>,
    /// Delay between opening a source and reading from it
    pub warmup_ms: u64,
    /// Directory for `camera_<id>.jpg` files
    pub output_dir: PathBuf,
    /// Write captured frames to disk
    pub save: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sources: (0..4).map(SourceId::Device).collect(),
            warmup_ms: 100,
            output_dir: PathBuf::from("."),
            save: true,
        }
    }
}

/// Panorama settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanoramaConfig {
    /// Keep every Nth decoded frame
    pub stride: usize,
    /// Concatenation direction
    pub axis: StitchAxis,
    /// Destination JPEG
    pub output: PathBuf,
    /// JPEG quality of the written panorama (1 - 100)
    pub jpeg_quality: u8,
}

impl Default for PanoramaConfig {
    fn default() -> Self {
        Self {
            stride: 10,
            axis: StitchAxis::Horizontal,
            output: PathBuf::from("stitched_image.jpg"),
            jpeg_quality: 90,
        }
    }
}

/// How product and label detections are obtained from the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelMode {
    /// Run the detector twice and use both outputs unfiltered
    SameDetections,
    /// Run the detector once and split by class id
    ClassFilter,
}

/// Detection pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Live source
    pub source: SourceId,
    /// YOLO ONNX export
    pub model_path: PathBuf,
    /// Fetched into the models directory when `model_path` does not exist
    pub model_url: Option<String>,
    /// Process frames whose index is a multiple of this
    pub every_nth_frame: u64,
    /// Blocking worker pool size
    pub worker_threads: usize,
    /// Square model input size
    pub input_size: u32,
    /// Minimum detection confidence (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// NMS IoU threshold (0.0 - 1.0)
    pub iou_threshold: f32,
    /// Detections kept per frame
    pub max_detections: usize,
    pub label_mode: LabelMode,
    /// Class ids treated as products in `class_filter` mode
    pub product_classes: Vec<usize>,
    /// Class ids treated as price labels in `class_filter` mode
    pub label_classes: Vec<usize>,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let yolo = YoloConfig::default();
        Self {
            source: SourceId::Device(0),
            model_path: PathBuf::from("yolov5n.onnx"),
            model_url: None,
            every_nth_frame: 5,
            worker_threads: 4,
            input_size: yolo.input_size,
            confidence_threshold: yolo.confidence_threshold,
            iou_threshold: yolo.iou_threshold,
            max_detections: yolo.max_detections,
            label_mode: LabelMode::SameDetections,
            product_classes: Vec::new(),
            label_classes: Vec::new(),
            max_frames: None,
        }
    }
}

impl DetectionConfig {
    /// Detector parameters from this section
    pub fn yolo_config(&self) -> YoloConfig {
        YoloConfig {
            input_size: self.input_size,
            confidence_threshold: self.confidence_threshold,
            iou_threshold: self.iou_threshold,
            max_detections: self.max_detections,
        }
    }
}

/// OCR engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OcrBackend {
    /// `tesseract` command line tool
    Tesseract,
    /// PaddleOCR recognition model via ONNX Runtime
    Paddle,
}

/// OCR settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub backend: OcrBackend,
    /// Tesseract language code
    pub language: String,
    /// Tesseract executable
    pub tesseract_binary: String,
    /// Tesseract `--psm` value
    pub page_segmentation: Option<u8>,
    /// PaddleOCR recognition model, downloaded to the data directory when unset
    pub recognition_model: Option<PathBuf>,
    /// PaddleOCR dictionary, downloaded to the data directory when unset
    pub dictionary: Option<PathBuf>,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            backend: OcrBackend::Tesseract,
            language: "eng".to_string(),
            tesseract_binary: "tesseract".to_string(),
            page_segmentation: None,
            recognition_model: None,
            dictionary: None,
        }
    }
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite file
    pub database: PathBuf,
    /// Compression of stored product crops
    pub encoding: ImageEncoding,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("store_products.db"),
            encoding: ImageEncoding::Png,
        }
    }
}

/// Display settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Skip the preview window
    pub headless: bool,
    /// TrueType font for overlay text; the bundled DejaVu Sans when unset
    pub font_path: Option<PathBuf>,
    /// Overlay text height in pixels
    pub font_size: f32,
    /// Also write annotated frames to this directory
    pub annotated_dir: Option<PathBuf>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            headless: false,
            font_path: None,
            font_size: 16.0,
            annotated_dir: None,
        }
    }
}

impl AppConfig {
    /// Reject values the flows cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.panorama.stride == 0 {
            bail!("panorama.stride must be at least 1");
        }
        if self.detection.every_nth_frame == 0 {
            bail!("detection.every_nth_frame must be at least 1");
        }
        if self.detection.worker_threads == 0 {
            bail!("detection.worker_threads must be at least 1");
        }
        if self.detection.input_size == 0 {
            bail!("detection.input_size must be positive");
        }
        for (name, value) in [
            ("confidence_threshold", self.detection.confidence_threshold),
            ("iou_threshold", self.detection.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("detection.{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.detection.label_mode == LabelMode::ClassFilter
            && (self.detection.product_classes.is_empty() || self.detection.label_classes.is_empty())
        {
            bail!("label_mode = \"class_filter\" needs product_classes and label_classes");
        }
        if !(1..=100).contains(&self.panorama.jpeg_quality) {
            bail!("panorama.jpeg_quality must be within 1..=100");
        }
        if let ImageEncoding::Jpeg { quality } = self.storage.encoding {
            if !(1..=100).contains(&quality) {
                bail!("storage.encoding.quality must be within 1..=100");
            }
        }
        if self.display.font_size <= 0.0 {
            bail!("display.font_size must be positive");
        }
        Ok(())
    }
}

/// Default location of the configuration file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load an explicit file, or the default location when it exists, or the defaults
pub fn load_or_default(explicit: Option<&Path>) -> Result<AppConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => match default_config_path() {
            Ok(path) if path.exists() => load_config(&path),
            _ => Ok(AppConfig::default()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        // Check capture defaults
        assert_eq!(config.capture.sources.len(), 4);
        assert_eq!(config.capture.sources[3], SourceId::Device(3));
        assert_eq!(config.capture.warmup_ms, 100);

        // Check panorama defaults
        assert_eq!(config.panorama.stride, 10);
        assert_eq!(config.panorama.axis, StitchAxis::Horizontal);
        assert_eq!(config.panorama.output, PathBuf::from("stitched_image.jpg"));

        // Check detection defaults
        assert_eq!(config.detection.every_nth_frame, 5);
        assert_eq!(config.detection.worker_threads, 4);
        assert_eq!(config.detection.label_mode, LabelMode::SameDetections);
        assert!((config.detection.confidence_threshold - 0.25).abs() < 0.001);

        // Check storage and OCR defaults
        assert_eq!(config.storage.database, PathBuf::from("store_products.db"));
        assert_eq!(config.storage.encoding, ImageEncoding::Png);
        assert_eq!(config.ocr.backend, OcrBackend::Tesseract);
        assert_eq!(config.ocr.language, "eng");

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.capture.sources, parsed.capture.sources);
        assert_eq!(config.panorama.stride, parsed.panorama.stride);
        assert_eq!(config.detection.model_path, parsed.detection.model_path);
        assert_eq!(config.storage.encoding, parsed.storage.encoding);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [capture]
            sources = [2, "shelf.png"]

            [detection]
            every_nth_frame = 3
            label_mode = "class_filter"
            product_classes = [0]
            label_classes = [1]
            "#,
        )
        .unwrap();

        assert_eq!(
            parsed.capture.sources,
            vec![SourceId::Device(2), SourceId::Path(PathBuf::from("shelf.png"))]
        );
        assert_eq!(parsed.capture.warmup_ms, 100);
        assert_eq!(parsed.detection.every_nth_frame, 3);
        assert_eq!(parsed.detection.label_mode, LabelMode::ClassFilter);
        assert_eq!(parsed.panorama.stride, 10);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.panorama.stride = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.every_nth_frame = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.worker_threads = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.iou_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.label_mode = LabelMode::ClassFilter;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.storage.encoding = ImageEncoding::Jpeg { quality: 0 };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.detection.max_frames = Some(42);
        config.display.headless = true;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();

        let loaded = load_config(temp_file.path()).unwrap();
        assert_eq!(loaded.detection.max_frames, Some(42));
        assert!(loaded.display.headless);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
        assert!(load_or_default(Some(Path::new("/nonexistent/path/config.toml"))).is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_yolo_config_from_section() {
        let mut detection = DetectionConfig::default();
        detection.input_size = 320;
        detection.iou_threshold = 0.6;

        let yolo = detection.yolo_config();
        assert_eq!(yolo.input_size, 320);
        assert!((yolo.iou_threshold - 0.6).abs() < 1e-6);
    }
}
