//! OCR (Optical Character Recognition) module
//!
//! Two recognizers behind [`TextRecognizer`]:
//! - [`TesseractOcr`] pipes the region as PNG through the `tesseract` CLI
//! - [`PaddleRecognizer`] runs a PaddleOCR CRNN model via ONNX Runtime with greedy CTC decoding

use image::RgbImage;
use ort::value::Tensor;
use std::io::{Cursor, Write};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use super::models::OnnxModel;
use super::preprocess::{preprocess_for_recognition, RecognitionPreprocess};
use super::{TextRecognizer, VisionError};

/// Recognizer that shells out to the Tesseract command line tool
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    binary: String,
    language: String,
    page_segmentation: Option<u8>,
}

impl TesseractOcr {
    /// Recognizer using `tesseract` from PATH
    pub fn new(language: &str) -> Self {
        Self {
            binary: "tesseract".to_string(),
            language: language.to_string(),
            page_segmentation: None,
        }
    }

    /// Use a specific tesseract executable
    pub fn with_binary(mut self, binary: &str) -> Self {
        self.binary = binary.to_string();
        self
    }

    /// Set the `--psm` page segmentation mode
    pub fn with_page_segmentation(mut self, psm: Option<u8>) -> Self {
        self.page_segmentation = psm;
        self
    }

    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "-l".to_string(),
            self.language.clone(),
        ];
        if let Some(psm) = self.page_segmentation {
            args.push("--psm".to_string());
            args.push(psm.to_string());
        }
        args
    }
}

impl TextRecognizer for TesseractOcr {
    fn recognize(&mut self, image: &RgbImage) -> Result<String, VisionError> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| VisionError::OcrProcess(format!("failed to encode region: {}", e)))?;

        let mut child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VisionError::OcrProcess(format!("cannot run {} (is it installed?): {}", self.binary, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&png)?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VisionError::OcrProcess(format!("{} failed: {}", self.binary, stderr.trim())));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        debug!("tesseract recognized {:?}", text);
        Ok(text)
    }
}

/// PaddleOCR text line recognizer
pub struct PaddleRecognizer {
    model: OnnxModel,
    dictionary: Vec<String>,
    preprocess: RecognitionPreprocess,
}

impl PaddleRecognizer {
    /// Load the recognition model and its character dictionary
    pub fn new(model_path: &Path, dictionary_path: &Path) -> Result<Self, VisionError> {
        let model = OnnxModel::load(model_path)?;
        let dictionary = load_dictionary(dictionary_path)?;
        info!("PaddleOCR recognizer ready ({} characters)", dictionary.len());

        Ok(Self {
            model,
            dictionary,
            preprocess: RecognitionPreprocess::default(),
        })
    }
}

impl TextRecognizer for PaddleRecognizer {
    fn recognize(&mut self, image: &RgbImage) -> Result<String, VisionError> {
        let tensor = preprocess_for_recognition(image, &self.preprocess);
        let (shape, data) = self.model.infer(Tensor::from_array(tensor)?)?;

        let (steps, classes) = match shape.as_slice() {
            [1, steps, classes] if *classes > 0 => (*steps as usize, *classes as usize),
            other => {
                return Err(VisionError::OutputShape(format!(
                    "expected [1, T, C] recognition output, got {:?}",
                    other
                )))
            }
        };

        let (text, confidence) = ctc_greedy_decode(&data, steps, classes, &self.dictionary);
        debug!("PaddleOCR recognized {:?} (confidence {:.2})", text, confidence);
        Ok(text)
    }
}

/// Read one character per line; the model's last class is the space character
pub fn load_dictionary(path: &Path) -> Result<Vec<String>, VisionError> {
    let content = std::fs::read_to_string(path)?;
    let mut dictionary: Vec<String> = content
        .lines()
        .map(|line| line.trim_end_matches('\r').to_string())
        .collect();
    dictionary.push(" ".to_string());
    Ok(dictionary)
}

/// Greedy CTC decoding: argmax per step, collapse repeats, drop blanks (class 0).
///
/// Class `i > 0` maps to `dictionary[i - 1]`. Returns the text and the mean
/// probability of the emitted characters.
pub fn ctc_greedy_decode(data: &[f32], steps: usize, classes: usize, dictionary: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut score_sum = 0.0;
    let mut emitted = 0usize;
    let mut previous = 0usize;

    for step in data.chunks_exact(classes).take(steps) {
        let (best, score) = step
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |acc, (i, v)| if v > acc.1 { (i, v) } else { acc });

        if best != 0 && best != previous {
            if let Some(ch) = dictionary.get(best - 1) {
                text.push_str(ch);
                score_sum += score;
                emitted += 1;
            }
        }
        previous = best;
    }

    let confidence = if emitted == 0 { 0.0 } else { score_sum / emitted as f32 };
    (text, confidence)
}
