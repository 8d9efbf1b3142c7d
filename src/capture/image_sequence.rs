//! Still-image and animated GIF sources
//!
//! A single image file yields one frame, a directory yields its images in file name
//! order, and a GIF yields each animation frame.

use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, ImageFormat, RgbImage};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Frame, FrameSource, SourceError};

enum Sequence {
    Stills { paths: Vec<PathBuf>, next: usize },
    Animation(image::Frames<'static>),
    #[cfg(test)]
    Memory(std::vec::IntoIter<RgbImage>),
}

/// Frame source backed by image files
pub struct ImageSequenceSource {
    origin: String,
    sequence: Sequence,
    frame_index: u64,
}

impl ImageSequenceSource {
    /// Open an image file, a directory of images or an animated GIF
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            id: path.display().to_string(),
            reason,
        };

        if !path.exists() {
            return Err(open_error("path does not exist".to_string()));
        }

        let sequence = if path.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && ImageFormat::from_path(p).is_ok())
                .collect();
            paths.sort();
            if paths.is_empty() {
                return Err(open_error("directory contains no images".to_string()));
            }
            debug!("Found {} images in {:?}", paths.len(), path);
            Sequence::Stills { paths, next: 0 }
        } else {
            match ImageFormat::from_path(path) {
                Ok(ImageFormat::Gif) => {
                    let reader = BufReader::new(File::open(path)?);
                    let decoder = GifDecoder::new(reader).map_err(|e| open_error(e.to_string()))?;
                    Sequence::Animation(decoder.into_frames())
                }
                Ok(_) => Sequence::Stills {
                    paths: vec![path.to_path_buf()],
                    next: 0,
                },
                Err(e) => return Err(open_error(e.to_string())),
            }
        };

        Ok(Self {
            origin: path.display().to_string(),
            sequence,
            frame_index: 0,
        })
    }

    /// In-memory sequence, used to drive the flows from tests
    #[cfg(test)]
    pub fn from_images(images: Vec<RgbImage>) -> Self {
        Self {
            origin: "memory".to_string(),
            sequence: Sequence::Memory(images.into_iter()),
            frame_index: 0,
        }
    }

    fn next_image(&mut self) -> Result<Option<RgbImage>, SourceError> {
        match &mut self.sequence {
            Sequence::Stills { paths, next } => {
                let Some(path) = paths.get(*next) else {
                    return Ok(None);
                };
                *next += 1;
                let image = image::open(path)
                    .map_err(|e| SourceError::Decode(format!("{}: {}", path.display(), e)))?;
                Ok(Some(image.to_rgb8()))
            }
            Sequence::Animation(frames) => match frames.next() {
                Some(Ok(frame)) => Ok(Some(DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())),
                Some(Err(e)) => Err(SourceError::Decode(e.to_string())),
                None => Ok(None),
            },
            #[cfg(test)]
            Sequence::Memory(images) => Ok(images.next()),
        }
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(image) = self.next_image()? else {
            return Ok(None);
        };
        let frame = Frame::new(image, self.frame_index);
        self.frame_index += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("image sequence {}", self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::codecs::gif::GifEncoder;
    use image::{Delay, Rgb, Rgba, RgbaImage};

    #[test]
    fn test_single_image_yields_one_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shelf.png");
        RgbImage::from_pixel(5, 3, Rgb([1, 2, 3])).save(&path).unwrap();

        let mut source = ImageSequenceSource::open(&path).unwrap();
        let frame = source.next_frame().unwrap().unwrap();
        assert_eq!(frame.dimensions(), (5, 3));
        assert_eq!(frame.image.get_pixel(4, 2), &Rgb([1, 2, 3]));
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_directory_sorted_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for (name, value) in [("b.png", 20u8), ("a.png", 10), ("c.png", 30)] {
            RgbImage::from_pixel(2, 2, Rgb([value, 0, 0]))
                .save(dir.path().join(name))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();

        let mut source = ImageSequenceSource::open(dir.path()).unwrap();
        let mut reds = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            reds.push((frame.index, frame.image.get_pixel(0, 0)[0]));
        }
        assert_eq!(reds, vec![(0, 10), (1, 20), (2, 30)]);
    }

    #[test]
    fn test_gif_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.gif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = GifEncoder::new(file);
            let frames = [0u8, 255].map(|v| {
                image::Frame::from_parts(
                    RgbaImage::from_pixel(4, 4, Rgba([v, v, v, 255])),
                    0,
                    0,
                    Delay::from_numer_denom_ms(100, 1),
                )
            });
            encoder.encode_frames(frames).unwrap();
        }

        let mut source = ImageSequenceSource::open(&path).unwrap();
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert!(source.next_frame().unwrap().is_none());
        assert_eq!(first.image.get_pixel(0, 0)[0], 0);
        assert_eq!(second.image.get_pixel(0, 0)[0], 255);
        assert_eq!(second.index, 1);
    }

    #[test]
    fn test_missing_path_fails_to_open() {
        let result = ImageSequenceSource::open(Path::new("/nonexistent/shelf.png"));
        assert!(matches!(result, Err(SourceError::Open { .. })));
    }

    #[test]
    fn test_empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::open(dir.path()).is_err());
    }
}
