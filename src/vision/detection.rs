//! YOLO object detection via ONNX Runtime
//!
//! Accepts both output layouts found in YOLO ONNX exports:
//! - `[1, N, 5 + C]` (v5 style): cx, cy, w, h, objectness, class scores
//! - `[1, 4 + C, N]` (v8 style): cx, cy, w, h, class scores, transposed

use image::RgbImage;
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use super::models::OnnxModel;
use super::preprocess::{preprocess_for_detection, Letterbox};
use super::{BoundingBox, Detection, ObjectDetector, VisionError};

/// Detector parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YoloConfig {
    /// Square model input size (640 typical)
    pub input_size: u32,
    /// Minimum confidence for a detection (0.0 - 1.0)
    pub confidence_threshold: f32,
    /// IoU above which overlapping boxes of the same class are suppressed
    pub iou_threshold: f32,
    /// Maximum number of detections returned per frame
    pub max_detections: usize,
}

impl Default for YoloConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            max_detections: 300,
        }
    }
}

/// Candidate box in frame coordinates before NMS
#[derive(Debug, Clone, Copy)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
    class_id: usize,
}

/// Output tensor layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    /// Rows are predictions, with objectness at column 4
    RowsWithObjectness { rows: usize, cols: usize },
    /// Columns are predictions, no objectness
    Transposed { rows: usize, cols: usize },
}

/// YOLO detector backed by an ONNX session
pub struct YoloDetector {
    model: OnnxModel,
    config: YoloConfig,
}

impl YoloDetector {
    /// Load a YOLO ONNX export
    pub fn new(model_path: &Path, config: YoloConfig) -> Result<Self, VisionError> {
        let model = OnnxModel::load(model_path)?;
        info!(
            "YOLO detector ready (input {}, conf {}, iou {})",
            config.input_size, config.confidence_threshold, config.iou_threshold
        );
        Ok(Self { model, config })
    }

    fn run(&mut self, image: &RgbImage) -> Result<(Vec<i64>, Vec<f32>, Letterbox), VisionError> {
        let (tensor, placement) = preprocess_for_detection(image, self.config.input_size);
        let (shape, data) = self.model.infer(Tensor::from_array(tensor)?)?;
        Ok((shape, data, placement))
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<Detection>, VisionError> {
        let start = Instant::now();
        let (shape, data, placement) = self.run(image)?;

        let layout = infer_layout(&shape)?;
        let candidates = decode(&data, layout, self.config.confidence_threshold, &placement);
        let mut kept = non_maximum_suppression(candidates, self.config.iou_threshold);
        kept.truncate(self.config.max_detections);

        let detections: Vec<Detection> = kept.into_iter().map(to_detection).collect();
        debug!("YOLO inference complete in {:?}: {} detections", start.elapsed(), detections.len());
        Ok(detections)
    }
}

/// Work out the prediction layout from the output shape
fn infer_layout(shape: &[i64]) -> Result<Layout, VisionError> {
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    let (rows, cols) = match dims.as_slice() {
        [1, rows, cols] => (*rows, *cols),
        [rows, cols] => (*rows, *cols),
        _ => {
            return Err(VisionError::OutputShape(format!(
                "expected [1, N, C] output, got {:?}",
                shape
            )))
        }
    };

    // Predictions vastly outnumber attributes in both layouts
    if rows >= cols {
        if cols < 6 {
            return Err(VisionError::OutputShape(format!("too few attributes: {:?}", shape)));
        }
        Ok(Layout::RowsWithObjectness { rows, cols })
    } else {
        if rows < 5 {
            return Err(VisionError::OutputShape(format!("too few attributes: {:?}", shape)));
        }
        Ok(Layout::Transposed { rows, cols })
    }
}

/// Turn raw predictions into scored candidates in frame coordinates
fn decode(data: &[f32], layout: Layout, threshold: f32, placement: &Letterbox) -> Vec<Candidate> {
    let (count, attributes) = match layout {
        Layout::RowsWithObjectness { rows, cols } => (rows, cols),
        Layout::Transposed { rows, cols } => (cols, rows),
    };
    let (class_start, has_objectness) = match layout {
        Layout::RowsWithObjectness { .. } => (5, true),
        Layout::Transposed { .. } => (4, false),
    };
    let at = |p: usize, a: usize| attribute(data, layout, p, a);

    let mut candidates = Vec::new();
    for p in 0..count {
        let objectness = if has_objectness { at(p, 4) } else { 1.0 };
        if objectness < threshold {
            continue;
        }

        let (class_id, class_score) = (class_start..attributes)
            .map(|a| (a - class_start, at(p, a)))
            .fold((0, f32::NEG_INFINITY), |best, next| if next.1 > best.1 { next } else { best });

        let score = objectness * class_score;
        if score.is_nan() || score < threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(p, 0), at(p, 1), at(p, 2), at(p, 3));
        if ![cx, cy, w, h].iter().all(|v| v.is_finite()) {
            continue;
        }
        let (x1, y1) = placement.to_frame(cx - w / 2.0, cy - h / 2.0);
        let (x2, y2) = placement.to_frame(cx + w / 2.0, cy + h / 2.0);

        candidates.push(Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            class_id,
        });
    }

    candidates
}

/// Attribute `a` of prediction `p`
fn attribute(data: &[f32], layout: Layout, p: usize, a: usize) -> f32 {
    match layout {
        Layout::RowsWithObjectness { cols, .. } => data[p * cols + a],
        Layout::Transposed { cols, .. } => data[a * cols + p],
    }
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let area_a = (a.x2 - a.x1).max(0.0) * (a.y2 - a.y1).max(0.0);
    let area_b = (b.x2 - b.x1).max(0.0) * (b.y2 - b.y1).max(0.0);
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Class-aware non-maximum suppression, highest score first
fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && iou(k, &candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

fn to_detection(candidate: Candidate) -> Detection {
    // Truncate toward zero like an int() cast of the box corners
    Detection {
        bbox: BoundingBox::new(
            candidate.x1 as i32,
            candidate.y1 as i32,
            candidate.x2 as i32,
            candidate.y2 as i32,
        ),
        confidence: candidate.score,
        class_id: candidate.class_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: Letterbox = Letterbox {
        scale: 1.0,
        pad_x: 0.0,
        pad_y: 0.0,
    };

    fn candidate(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class_id: usize) -> Candidate {
        Candidate {
            x1,
            y1,
            x2,
            y2,
            score,
            class_id,
        }
    }

    #[test]
    fn test_infer_layout() {
        assert_eq!(
            infer_layout(&[1, 25200, 85]).unwrap(),
            Layout::RowsWithObjectness { rows: 25200, cols: 85 }
        );
        assert_eq!(
            infer_layout(&[1, 84, 8400]).unwrap(),
            Layout::Transposed { rows: 84, cols: 8400 }
        );
        assert!(infer_layout(&[1, 2, 3, 4]).is_err());
    }

    #[test]
    fn test_decode_rows_with_objectness() {
        // Two predictions, two classes: [cx, cy, w, h, obj, c0, c1]
        let data = vec![
            50.0, 50.0, 20.0, 10.0, 0.9, 0.2, 0.8, //
            10.0, 10.0, 4.0, 4.0, 0.1, 0.9, 0.1,
        ];
        let layout = Layout::RowsWithObjectness { rows: 2, cols: 7 };

        let candidates = decode(&data, layout, 0.25, &IDENTITY);

        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!(c.class_id, 1);
        assert!((c.score - 0.72).abs() < 1e-5);
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (40.0, 45.0, 60.0, 55.0));
    }

    #[test]
    fn test_decode_drops_non_finite_predictions() {
        let data = vec![
            f32::INFINITY, 50.0, 20.0, 10.0, 0.9, 0.9, //
            50.0, 50.0, 20.0, 10.0, f32::NAN, 0.9, //
            50.0, 50.0, 20.0, 10.0, 0.9, 0.9,
        ];
        let layout = Layout::RowsWithObjectness { rows: 3, cols: 6 };

        let candidates = decode(&data, layout, 0.25, &IDENTITY);

        assert_eq!(candidates.len(), 1);
        assert_eq!((candidates[0].x1, candidates[0].x2), (40.0, 60.0));
    }

    #[test]
    fn test_decode_transposed_and_letterbox() {
        // Attributes-major: 4 box rows + 1 class row, 2 predictions
        let data = vec![
            30.0, 0.0, // cx
            40.0, 0.0, // cy
            10.0, 0.0, // w
            20.0, 0.0, // h
            0.6, 0.1, // class 0
        ];
        let layout = Layout::Transposed { rows: 5, cols: 2 };
        let placement = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 10.0,
        };

        let candidates = decode(&data, layout, 0.25, &placement);

        assert_eq!(candidates.len(), 1);
        let c = candidates[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (50.0, 40.0, 70.0, 80.0));
    }

    #[test]
    fn test_nms_suppresses_same_class_overlap() {
        let candidates = vec![
            candidate(0.0, 0.0, 10.0, 10.0, 0.8, 0),
            candidate(1.0, 1.0, 11.0, 11.0, 0.9, 0),
            candidate(1.0, 1.0, 11.0, 11.0, 0.7, 1),
            candidate(50.0, 50.0, 60.0, 60.0, 0.5, 0),
        ];

        let kept = non_maximum_suppression(candidates, 0.45);

        assert_eq!(kept.len(), 3);
        assert!((kept[0].score - 0.9).abs() < 1e-6);
        assert_eq!(kept[1].class_id, 1);
        assert!((kept[2].score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_iou() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 1.0, 0);
        let b = candidate(5.0, 0.0, 15.0, 10.0, 1.0, 0);
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(iou(&a, &candidate(20.0, 20.0, 30.0, 30.0, 1.0, 0)), 0.0);
    }

    #[test]
    fn test_to_detection_truncates() {
        let detection = to_detection(candidate(10.9, 10.2, 49.7, 50.99, 0.5, 3));
        assert_eq!(detection.bbox, BoundingBox::new(10, 10, 49, 50));
        assert_eq!(detection.class_id, 3);
    }
}
