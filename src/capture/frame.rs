//! Frame data structures for decoded camera and video content

use image::RgbImage;

/// A decoded frame from a camera, video or image source
#[derive(Debug, Clone)]
pub struct Frame {
    /// RGB pixel data
    pub image: RgbImage,
    /// Position of the frame in its source, starting at 0
    pub index: u64,
}

impl Frame {
    pub fn new(image: RgbImage, index: u64) -> Self {
        Self { image, index }
    }

    /// Frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_dimensions() {
        let frame = Frame::new(RgbImage::new(64, 48), 7);
        assert_eq!(frame.dimensions(), (64, 48));
        assert_eq!(frame.index, 7);
    }
}
