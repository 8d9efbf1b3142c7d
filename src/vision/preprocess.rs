//! Image preprocessing for ONNX models
//!
//! Handles letterboxing for YOLO detection and fixed-height resizing for PaddleOCR
//! recognition, plus normalization and tensor layout conversion.

use image::imageops::FilterType;
use image::{Rgb, RgbImage};
use ndarray::{Array3, Array4};

/// Grey used by YOLO exports for letterbox padding
pub const LETTERBOX_FILL: u8 = 114;

/// Preprocessing configuration for the recognition model
#[derive(Debug, Clone)]
pub struct RecognitionPreprocess {
    /// Target height for recognition model (typically 32 or 48)
    pub target_height: u32,
    /// Maximum width for recognition
    pub max_width: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for RecognitionPreprocess {
    fn default() -> Self {
        Self {
            target_height: 48,
            max_width: 640,
            // (pixel / 255.0 - 0.5) / 0.5 maps [0, 255] -> [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// Placement of the original frame inside a letterboxed model input
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    /// Scale applied to the original frame
    pub scale: f32,
    /// Horizontal padding on the left, in model pixels
    pub pad_x: f32,
    /// Vertical padding on the top, in model pixels
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a point from model input coordinates back to frame coordinates
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Convert RGB image data to an HWC f32 array in 0-1
pub fn rgb_to_f32(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    let mut rgb = Array3::<f32>::zeros((height as usize, width as usize, 3));

    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            rgb[[y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }

    rgb
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut normalized = image.clone();
    for ((_, _, c), value) in normalized.indexed_iter_mut() {
        *value = (*value - mean[c]) / std[c];
    }
    normalized
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    let mut tensor = Array4::<f32>::zeros((1, c, h, w));

    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                tensor[[0, ch, y, x]] = image[[y, x, ch]];
            }
        }
    }

    tensor
}

/// Resize into a square `size` x `size` canvas keeping aspect ratio, centered on grey padding
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (w, h) = image.dimensions();
    let scale = (size as f32 / w as f32).min(size as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Full preprocessing pipeline for detection: letterbox, scale to 0-1, NCHW
pub fn preprocess_for_detection(image: &RgbImage, input_size: u32) -> (Array4<f32>, Letterbox) {
    let (boxed, placement) = letterbox(image, input_size);
    (hwc_to_nchw(&rgb_to_f32(&boxed)), placement)
}

/// Full preprocessing pipeline for recognition: fixed height, normalize, NCHW
pub fn preprocess_for_recognition(image: &RgbImage, config: &RecognitionPreprocess) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let scale = config.target_height as f32 / h as f32;
    let new_w = ((w as f32 * scale).ceil() as u32).clamp(1, config.max_width);

    let resized = image::imageops::resize(image, new_w, config.target_height, FilterType::Triangle);
    let normalized = normalize(&rgb_to_f32(&resized), &config.mean, &config.std);

    hwc_to_nchw(&normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_f32() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 255, 0]));

        let rgb = rgb_to_f32(&image);

        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(rgb[[0, 0, 1]].abs() < 0.01);
        assert!(rgb[[0, 1, 0]].abs() < 0.01);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);

        let nchw = hwc_to_nchw(&hwc);

        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize() {
        let image = Array3::<f32>::from_elem((2, 2, 3), 1.0);
        let normalized = normalize(&image, &[0.5; 3], &[0.5; 3]);
        assert!((normalized[[1, 1, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_letterbox_wide_frame() {
        let image = RgbImage::from_pixel(200, 100, Rgb([10, 20, 30]));
        let (boxed, placement) = letterbox(&image, 64);

        assert_eq!(boxed.dimensions(), (64, 64));
        assert!((placement.scale - 0.32).abs() < 1e-6);
        assert_eq!(placement.pad_x, 0.0);
        assert_eq!(placement.pad_y, 16.0);
        assert_eq!(boxed.get_pixel(0, 0), &Rgb([LETTERBOX_FILL; 3]));
        assert_eq!(boxed.get_pixel(32, 32), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_letterbox_maps_back_to_frame() {
        let placement = Letterbox {
            scale: 0.5,
            pad_x: 0.0,
            pad_y: 10.0,
        };
        assert_eq!(placement.to_frame(20.0, 30.0), (40.0, 40.0));
    }

    #[test]
    fn test_recognition_tensor_shape() {
        let image = RgbImage::from_pixel(100, 24, Rgb([255, 255, 255]));
        let tensor = preprocess_for_recognition(&image, &RecognitionPreprocess::default());

        assert_eq!(tensor.dim(), (1, 3, 48, 200));
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 1e-5);
    }
}
