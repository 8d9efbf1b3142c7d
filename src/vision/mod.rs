//! Vision Layer
//!
//! Object detection and text recognition on decoded frames.
//! Supports:
//! - YOLO object detection via ONNX Runtime
//! - Tesseract OCR (external process)
//! - PaddleOCR text recognition via ONNX Runtime

pub mod association;
pub mod detection;
pub mod models;
pub mod ocr;
pub mod preprocess;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use association::{associate_nearest_label, Association};
pub use detection::{YoloConfig, YoloDetector};
pub use models::{ModelAsset, ModelManager, OnnxModel};
pub use ocr::{PaddleRecognizer, TesseractOcr};

/// Errors raised by detectors and recognizers
#[derive(Debug, Error)]
pub enum VisionError {
    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: String, reason: String },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("unexpected model output: {0}")]
    OutputShape(String),
    #[error("OCR process failed: {0}")]
    OcrProcess(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ort::Error> for VisionError {
    fn from(err: ort::Error) -> Self {
        VisionError::Inference(err.to_string())
    }
}

/// Axis-aligned integer bounding box in frame pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Integer center, floor division as in the box corner arithmetic
    pub fn center(&self) -> (i64, i64) {
        (
            (self.x1 as i64 + self.x2 as i64).div_euclid(2),
            (self.y1 as i64 + self.y2 as i64).div_euclid(2),
        )
    }

    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }

    /// Clamp to an image of the given size; returns (x, y, width, height) or `None`
    /// when nothing of the box lies inside the image
    pub fn clamped_region(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp_x = |v: i32| v.clamp(0, image_width as i32) as u32;
        let clamp_y = |v: i32| v.clamp(0, image_height as i32) as u32;

        let (x1, x2) = (clamp_x(self.x1), clamp_x(self.x2));
        let (y1, y2) = (clamp_y(self.y1), clamp_y(self.y2));

        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1, y1, x2 - x1, y2 - y1))
    }
}

/// A single detector output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Class index in the model's label set
    pub class_id: usize,
}

/// Object detector over RGB frames
pub trait ObjectDetector: Send {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, VisionError>;
}

/// Text recognizer over an image region
pub trait TextRecognizer: Send {
    /// Recognized text, possibly empty
    fn recognize(&mut self, image: &RgbImage) -> Result<String, VisionError>;
}

/// Copy a box region out of an image. `None` when the clamped region is empty.
pub fn crop(image: &RgbImage, bbox: &BoundingBox) -> Option<RgbImage> {
    let (x, y, width, height) = bbox.clamped_region(image.width(), image.height())?;
    Some(image::imageops::crop_imm(image, x, y, width, height).to_image())
}
