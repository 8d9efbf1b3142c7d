//! Overlay of product boxes and recognized label text

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{debug, warn};

use crate::vision::BoundingBox;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
/// Outline thickness in pixels
pub const BOX_THICKNESS: u32 = 2;
/// Text baseline offset below the box's bottom edge
pub const TEXT_OFFSET: i32 = 20;

/// Font compiled into the binary
static BUNDLED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf");

/// One product to draw
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub bbox: BoundingBox,
    pub text: String,
}

/// Draws product boxes and their label text
pub struct Annotator {
    font: Option<FontArc>,
    font_scale: PxScale,
}

impl Annotator {
    /// Use the font at `font_path` when it loads, the bundled DejaVu Sans otherwise
    pub fn new(font_path: Option<&Path>, font_size: f32) -> Self {
        let font = font_path.and_then(load_font).or_else(bundled_font);
        if font.is_none() {
            warn!("No usable font, label text will not be drawn");
        }

        Self {
            font,
            font_scale: PxScale::from(font_size),
        }
    }

    /// Annotator that only draws boxes
    pub fn boxes_only() -> Self {
        Self {
            font: None,
            font_scale: PxScale::from(16.0),
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw every annotation onto the frame
    pub fn draw(&self, image: &mut RgbImage, annotations: &[Annotation]) {
        for annotation in annotations {
            self.draw_box(image, &annotation.bbox);

            if let Some(font) = &self.font {
                if !annotation.text.is_empty() {
                    let x = annotation.bbox.x1;
                    let y = annotation.bbox.y2 + TEXT_OFFSET;
                    draw_text_mut(image, TEXT_COLOR, x, y, self.font_scale, font, &annotation.text);
                }
            }
        }
    }

    fn draw_box(&self, image: &mut RgbImage, bbox: &BoundingBox) {
        for inset in 0..BOX_THICKNESS as i32 {
            let width = bbox.width() - 2 * inset;
            let height = bbox.height() - 2 * inset;
            if width <= 0 || height <= 0 {
                break;
            }
            let rect = Rect::at(bbox.x1 + inset, bbox.y1 + inset).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(image, rect, BOX_COLOR);
        }
    }
}

fn bundled_font() -> Option<FontArc> {
    FontArc::try_from_slice(BUNDLED_FONT)
        .map_err(|e| warn!("Bundled font is invalid: {}", e))
        .ok()
}

fn load_font(path: &Path) -> Option<FontArc> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("Cannot read font {:?}, using the bundled one: {}", path, e);
            return None;
        }
    };
    match FontArc::try_from_vec(data) {
        Ok(font) => {
            debug!("Loaded overlay font {:?}", path);
            Some(font)
        }
        Err(e) => {
            warn!("Invalid font {:?}, using the bundled one: {}", path, e);
            None
        }
    }
}
