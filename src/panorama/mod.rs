//! Sequence to panorama
//!
//! Samples every Nth frame of a video and concatenates the samples after resizing
//! them to a common height (or width). There is no feature matching or blending.

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info, warn};

use crate::capture::{open_source, FrameSource, SourceId};

/// Concatenation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchAxis {
    /// Side by side, common height
    Horizontal,
    /// Stacked, common width
    Vertical,
}

/// Keep frames at positions 0, stride, 2*stride, ... until the source ends.
///
/// A read error ends the sequence like end-of-stream does.
pub fn extract_frames(source: &mut dyn FrameSource, stride: usize) -> Vec<RgbImage> {
    let stride = stride.max(1);
    let mut kept = Vec::new();
    let mut position = 0usize;

    loop {
        match source.next_frame() {
            Ok(Some(frame)) => {
                if position % stride == 0 {
                    kept.push(frame.image);
                }
                position += 1;
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Read failed on {} after {} frames: {}", source.describe(), position, e);
                break;
            }
        }
    }

    info!("Decoded {} frames, kept {}", position, kept.len());
    kept
}

/// Open a video and sample it. An unopenable video yields no frames.
pub fn extract_frames_from(id: &SourceId, stride: usize) -> Vec<RgbImage> {
    match open_source(id) {
        Ok(mut source) => extract_frames(source.as_mut(), stride),
        Err(e) => {
            error!("Could not open {}: {}", id, e);
            Vec::new()
        }
    }
}

/// Resize every frame to the shared cross-axis size and concatenate in order.
/// Returns `None` for an empty sequence.
pub fn stitch(frames: &[RgbImage], axis: StitchAxis) -> Option<RgbImage> {
    if frames.is_empty() {
        warn!("No frames to stitch");
        return None;
    }

    let resized: Vec<RgbImage> = match axis {
        StitchAxis::Horizontal => {
            let height = frames.iter().map(|f| f.height()).min().unwrap_or(1).max(1);
            frames
                .iter()
                .map(|f| {
                    let width = scaled_length(f.width(), height, f.height());
                    image::imageops::resize(f, width, height, FilterType::Triangle)
                })
                .collect()
        }
        StitchAxis::Vertical => {
            let width = frames.iter().map(|f| f.width()).min().unwrap_or(1).max(1);
            frames
                .iter()
                .map(|f| {
                    let height = scaled_length(f.height(), width, f.width());
                    image::imageops::resize(f, width, height, FilterType::Triangle)
                })
                .collect()
        }
    };

    let (total_width, total_height) = match axis {
        StitchAxis::Horizontal => (resized.iter().map(|f| f.width()).sum(), resized[0].height()),
        StitchAxis::Vertical => (resized[0].width(), resized.iter().map(|f| f.height()).sum()),
    };

    let mut canvas = RgbImage::new(total_width, total_height);
    let mut offset = 0i64;
    for frame in &resized {
        match axis {
            StitchAxis::Horizontal => {
                image::imageops::replace(&mut canvas, frame, offset, 0);
                offset += frame.width() as i64;
            }
            StitchAxis::Vertical => {
                image::imageops::replace(&mut canvas, frame, 0, offset);
                offset += frame.height() as i64;
            }
        }
    }

    Some(canvas)
}

/// `length * target / reference`, truncated and at least 1
fn scaled_length(length: u32, target: u32, reference: u32) -> u32 {
    if reference == 0 {
        return 1;
    }
    ((length as u64 * target as u64) / reference as u64).max(1) as u32
}

/// Write an image as JPEG. Nothing is written when encoding fails.
pub fn write_jpeg(image: &RgbImage, path: &Path, quality: u8) -> Result<()> {
    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, quality.clamp(1, 100))
        .encode_image(image)
        .with_context(|| format!("Failed to encode {:?}", path))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, encoded).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Full flow: sample, stitch, write. Fails when nothing could be stitched.
pub fn run(source: &SourceId, stride: usize, axis: StitchAxis, output: &Path, quality: u8) -> Result<RgbImage> {
    if stride == 0 {
        bail!("Frame stride must be at least 1");
    }

    let frames = extract_frames_from(source, stride);
    let Some(panorama) = stitch(&frames, axis) else {
        bail!("No frames decoded from {}", source);
    };

    write_jpeg(&panorama, output, quality)?;
    info!(
        "Wrote {}x{} panorama from {} frames to {:?}",
        panorama.width(),
        panorama.height(),
        frames.len(),
        output
    );
    Ok(panorama)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Frame, ImageSequenceSource, SourceError};
    use image::Rgb;

    fn solid(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    /// Yields a few frames, then fails
    struct FailingSource {
        remaining: u32,
    }

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.remaining == 0 {
                return Err(SourceError::Decode("corrupt packet".to_string()));
            }
            self.remaining -= 1;
            Ok(Some(Frame::new(solid(4, 4, 1), 0)))
        }

        fn describe(&self) -> String {
            "failing".to_string()
        }
    }

    #[test]
    fn test_extract_keeps_every_nth_unmodified() {
        let images: Vec<RgbImage> = (0..25).map(|i| solid(8, 6, i as u8)).collect();
        let mut source = ImageSequenceSource::from_images(images.clone());

        let kept = extract_frames(&mut source, 10);

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0], images[0]);
        assert_eq!(kept[1], images[10]);
        assert_eq!(kept[2], images[20]);
    }

    #[test]
    fn test_extract_stride_one_keeps_all() {
        let images: Vec<RgbImage> = (0..4).map(|i| solid(2, 2, i as u8)).collect();
        let mut source = ImageSequenceSource::from_images(images.clone());
        assert_eq!(extract_frames(&mut source, 1), images);
    }

    #[test]
    fn test_read_error_is_end_of_stream() {
        let mut source = FailingSource { remaining: 3 };
        assert_eq!(extract_frames(&mut source, 1).len(), 3);
    }

    #[test]
    fn test_unopenable_source_yields_nothing() {
        let id = SourceId::Path("/nonexistent/shelf_video_dir".into());
        assert!(extract_frames_from(&id, 10).is_empty());
    }

    #[test]
    fn test_stitch_horizontal_dimensions() {
        let frames = vec![solid(100, 50, 10), solid(60, 40, 20), solid(30, 45, 30)];

        let panorama = stitch(&frames, StitchAxis::Horizontal).unwrap();

        // 100*40/50 = 80, 60*40/40 = 60, 30*40/45 = 26.67 -> 26
        assert_eq!(panorama.height(), 40);
        assert_eq!(panorama.width(), 80 + 60 + 26);
        assert_eq!(panorama.get_pixel(10, 10), &Rgb([10, 10, 10]));
        assert_eq!(panorama.get_pixel(100, 10), &Rgb([20, 20, 20]));
        assert_eq!(panorama.get_pixel(150, 10), &Rgb([30, 30, 30]));
    }

    #[test]
    fn test_stitch_vertical_dimensions() {
        let frames = vec![solid(50, 100, 1), solid(40, 60, 2)];

        let panorama = stitch(&frames, StitchAxis::Vertical).unwrap();

        assert_eq!(panorama.width(), 40);
        assert_eq!(panorama.height(), 80 + 60);
    }

    #[test]
    fn test_stitch_clamps_to_one_pixel() {
        let frames = vec![solid(1, 100, 1), solid(50, 2, 2)];
        let panorama = stitch(&frames, StitchAxis::Horizontal).unwrap();
        // 1*2/100 truncates to 0 and is clamped to 1
        assert_eq!(panorama.dimensions(), (1 + 50, 2));
    }

    #[test]
    fn test_stitch_empty_is_none() {
        assert!(stitch(&[], StitchAxis::Horizontal).is_none());
        assert!(stitch(&[], StitchAxis::Vertical).is_none());
    }

    #[test]
    fn test_run_writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12u8 {
            solid(16, 8, i * 20).save(dir.path().join(format!("frame_{:02}.png", i))).unwrap();
        }
        let output = dir.path().join("out").join("stitched_image.jpg");

        let panorama = run(
            &SourceId::Path(dir.path().to_path_buf()),
            5,
            StitchAxis::Horizontal,
            &output,
            90,
        )
        .unwrap();

        assert_eq!(panorama.dimensions(), (48, 8));
        let written = image::open(&output).unwrap();
        assert_eq!((written.width(), written.height()), (48, 8));
    }

    #[test]
    fn test_run_without_frames_fails_and_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("stitched_image.jpg");
        let missing = SourceId::Path(dir.path().join("missing.mp4"));

        assert!(run(&missing, 10, StitchAxis::Horizontal, &output, 90).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_oversized_panorama_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("stitched_image.jpg");
        // Beyond the JPEG dimension limit
        let panorama = RgbImage::new(70_000, 2);

        assert!(write_jpeg(&panorama, &output, 90).is_err());
        assert!(!output.exists());
    }
}
