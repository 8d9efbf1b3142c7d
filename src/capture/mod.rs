//! Frame Acquisition Layer
//!
//! Opens cameras, videos and image sequences behind a single [`FrameSource`] trait and
//! implements the multi-camera still capture flow.

pub mod frame;
pub mod image_sequence;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "v4l")]
pub mod v4l;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use frame::Frame;
pub use image_sequence::ImageSequenceSource;

/// Video container extensions handed to the FFmpeg backend
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "mkv", "webm", "m4v", "mpg", "mpeg"];

/// Errors raised while opening or reading a frame source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("could not open {id}: {reason}")]
    Open { id: String, reason: String },
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error("unsupported source {0}")]
    Unsupported(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

/// Identifies a frame source: a camera index or a filesystem path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceId {
    /// Camera device index (`/dev/video<N>`)
    Device(u32),
    /// Image file, image directory, animated GIF, video file or device node
    Path(PathBuf),
}

impl SourceId {
    /// Short label used in output file names (`camera_<label>.jpg`)
    pub fn file_label(&self) -> String {
        match self {
            SourceId::Device(index) => index.to_string(),
            SourceId::Path(path) => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_string()),
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceId::Device(index) => write!(f, "{}", index),
            SourceId::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl FromStr for SourceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().parse::<u32>() {
            Ok(index) => SourceId::Device(index),
            Err(_) => SourceId::Path(PathBuf::from(s)),
        })
    }
}

/// A source of decoded frames
pub trait FrameSource {
    /// Read the next frame; `Ok(None)` means end-of-stream
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Human readable description for logs
    fn describe(&self) -> String;
}

/// Open a source from its identifier
pub fn open_source(id: &SourceId) -> Result<Box<dyn FrameSource>, SourceError> {
    match id {
        SourceId::Device(index) => open_camera(&format!("/dev/video{}", index)),
        SourceId::Path(path) => open_path(path),
    }
}

fn open_path(path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
    if path.starts_with("/dev") {
        return open_camera(&path.to_string_lossy());
    }

    if is_video_file(path) {
        return open_video_file(path);
    }

    Ok(Box::new(ImageSequenceSource::open(path)?))
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(feature = "v4l")]
fn open_camera(device_path: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(v4l::V4lCamera::open(device_path)?))
}

#[cfg(not(feature = "v4l"))]
fn open_camera(device_path: &str) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unsupported(format!(
        "{} (camera support requires the `v4l` feature)",
        device_path
    )))
}

#[cfg(feature = "ffmpeg")]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(Box::new(ffmpeg::FfmpegVideo::open(path)?))
}

#[cfg(not(feature = "ffmpeg"))]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>, SourceError> {
    Err(SourceError::Unsupported(format!(
        "{} (video decoding requires the `ffmpeg` feature)",
        path.display()
    )))
}

/// Capture a single frame from every source concurrently.
///
/// One worker thread per source: open, warm up, read one frame, release. The result has
/// one slot per identifier, in input order, and a slot is `None` where the source could
/// not be opened or produced no frame.
pub fn capture_from_all<F>(ids: &[SourceId], warmup: Duration, open: F) -> Vec<Option<Frame>>
where
    F: Fn(&SourceId) -> Result<Box<dyn FrameSource>, SourceError> + Sync,
{
    let open = &open;

    thread::scope(|scope| {
        let handles: Vec<_> = ids
            .iter()
            .map(|id| scope.spawn(move || capture_one(id, warmup, open)))
            .collect();

        handles
            .into_iter()
            .zip(ids)
            .map(|(handle, id)| match handle.join() {
                Ok(frame) => frame,
                Err(_) => {
                    error!("Capture worker for camera {} panicked", id);
                    None
                }
            })
            .collect()
    })
}

fn capture_one<F>(id: &SourceId, warmup: Duration, open: &F) -> Option<Frame>
where
    F: Fn(&SourceId) -> Result<Box<dyn FrameSource>, SourceError>,
{
    let mut source = match open(id) {
        Ok(source) => source,
        Err(e) => {
            error!("Camera {} could not be opened: {}", id, e);
            return None;
        }
    };
    debug!("Opened {}", source.describe());

    // Let auto exposure settle before grabbing
    thread::sleep(warmup);

    match source.next_frame() {
        Ok(Some(frame)) => {
            let (width, height) = frame.dimensions();
            info!("Image captured from camera {} ({}x{})", id, width, height);
            Some(frame)
        }
        Ok(None) => {
            warn!("Failed to capture image from camera {}: no frame available", id);
            None
        }
        Err(e) => {
            warn!("Failed to capture image from camera {}: {}", id, e);
            None
        }
    }
}

/// Write every captured frame as `camera_<label>.jpg` into `dir`. Labels shared by
/// several sources get the slot index appended (`camera_<label>_<slot>.jpg`).
/// Returns the written paths, in input order, skipping empty slots.
pub fn save_captures(
    ids: &[SourceId],
    frames: &[Option<Frame>],
    dir: &Path,
) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for ((id, name), frame) in ids.iter().zip(output_names(ids)).zip(frames) {
        let Some(frame) = frame else {
            continue;
        };
        let path = dir.join(name);
        frame
            .image
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .map_err(|e| anyhow::anyhow!("Failed to write {:?}: {}", path, e))?;
        info!("Saved camera {} to {:?}", id, path);
        written.push(path);
    }

    Ok(written)
}

fn output_names(ids: &[SourceId]) -> Vec<String> {
    let labels: Vec<String> = ids.iter().map(SourceId::file_label).collect();
    labels
        .iter()
        .enumerate()
        .map(|(slot, label)| {
            if labels.iter().filter(|other| *other == label).count() > 1 {
                format!("camera_{}_{}.jpg", label, slot)
            } else {
                format!("camera_{}.jpg", label)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct SolidSource {
        color: u8,
        remaining: usize,
    }

    impl FrameSource for SolidSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let image = RgbImage::from_pixel(8, 6, Rgb([self.color, self.color, self.color]));
            Ok(Some(Frame::new(image, 0)))
        }

        fn describe(&self) -> String {
            format!("solid source {}", self.color)
        }
    }

    fn fake_open(id: &SourceId) -> Result<Box<dyn FrameSource>, SourceError> {
        match id {
            SourceId::Device(index) if index % 2 == 1 => Err(SourceError::Open {
                id: id.to_string(),
                reason: "no such device".to_string(),
            }),
            SourceId::Device(index) => Ok(Box::new(SolidSource {
                color: *index as u8 * 10,
                remaining: 1,
            })),
            SourceId::Path(_) => Ok(Box::new(SolidSource {
                color: 0,
                remaining: 0,
            })),
        }
    }

    #[test]
    fn test_source_id_parsing() {
        assert_eq!("2".parse::<SourceId>().unwrap(), SourceId::Device(2));
        assert_eq!(
            "shelf.gif".parse::<SourceId>().unwrap(),
            SourceId::Path(PathBuf::from("shelf.gif"))
        );
        assert_eq!(SourceId::Device(3).file_label(), "3");
        assert_eq!(SourceId::Path(PathBuf::from("/tmp/aisle_4.png")).file_label(), "aisle_4");
    }

    #[test]
    fn test_source_id_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            cameras: Vec<SourceId>,
        }

        let parsed: Wrapper = toml::from_str(r#"cameras = [0, 2, "clip.gif"]"#).unwrap();
        assert_eq!(
            parsed.cameras,
            vec![
                SourceId::Device(0),
                SourceId::Device(2),
                SourceId::Path(PathBuf::from("clip.gif")),
            ]
        );
    }

    #[test]
    fn test_capture_keeps_slots_for_failed_sources() {
        let ids: Vec<SourceId> = (0..5).map(SourceId::Device).collect();
        let frames = capture_from_all(&ids, Duration::from_millis(1), fake_open);

        assert_eq!(frames.len(), 5);
        for (index, frame) in frames.iter().enumerate() {
            if index % 2 == 1 {
                assert!(frame.is_none(), "slot {} should be empty", index);
            } else {
                let frame = frame.as_ref().expect("even cameras open");
                assert_eq!(frame.image.get_pixel(0, 0)[0], index as u8 * 10);
            }
        }
    }

    #[test]
    fn test_capture_source_without_frames_leaves_slot_empty() {
        let ids = vec![SourceId::Device(0), SourceId::Path(PathBuf::from("empty"))];
        let frames = capture_from_all(&ids, Duration::ZERO, fake_open);

        assert!(frames[0].is_some());
        assert!(frames[1].is_none());
    }

    #[test]
    fn test_capture_opens_each_source_once() {
        let opened = AtomicUsize::new(0);
        let ids: Vec<SourceId> = vec![SourceId::Device(0), SourceId::Device(2), SourceId::Device(4)];

        let frames = capture_from_all(&ids, Duration::ZERO, |id| {
            opened.fetch_add(1, Ordering::SeqCst);
            fake_open(id)
        });

        assert_eq!(opened.load(Ordering::SeqCst), 3);
        assert!(frames.iter().all(Option::is_some));
    }

    #[test]
    fn test_capture_empty_id_list() {
        let frames = capture_from_all(&[], Duration::ZERO, fake_open);
        assert!(frames.is_empty());
    }

    #[test]
    fn test_save_captures_skips_missing_frames() {
        let dir = tempfile::tempdir().unwrap();
        let ids = vec![SourceId::Device(0), SourceId::Device(1), SourceId::Device(2)];
        let frames = vec![
            Some(Frame::new(RgbImage::from_pixel(4, 4, Rgb([200, 10, 10])), 0)),
            None,
            Some(Frame::new(RgbImage::from_pixel(4, 4, Rgb([10, 200, 10])), 0)),
        ];

        let written = save_captures(&ids, &frames, dir.path()).unwrap();

        assert_eq!(written.len(), 2);
        assert!(dir.path().join("camera_0.jpg").exists());
        assert!(!dir.path().join("camera_1.jpg").exists());
        assert!(dir.path().join("camera_2.jpg").exists());
    }

    #[test]
    fn test_save_captures_keeps_sources_with_same_name_apart() {
        let dir = tempfile::tempdir().unwrap();
        let ids = vec![
            SourceId::Path(PathBuf::from("/a/shelf.png")),
            SourceId::Path(PathBuf::from("/b/shelf.png")),
            SourceId::Path(PathBuf::from("/b/aisle.png")),
        ];
        let frames: Vec<Option<Frame>> = (0..3)
            .map(|i| Some(Frame::new(RgbImage::from_pixel(4, 4, Rgb([i * 100, 0, 0])), 0)))
            .collect();

        let written = save_captures(&ids, &frames, dir.path()).unwrap();

        assert_eq!(
            written,
            vec![
                dir.path().join("camera_shelf_0.jpg"),
                dir.path().join("camera_shelf_1.jpg"),
                dir.path().join("camera_aisle.jpg"),
            ]
        );
        assert!(written.iter().all(|path| path.exists()));
    }

    #[test]
    fn test_capture_workers_warm_up_in_parallel() {
        let ids: Vec<SourceId> = [0, 2, 4, 6].into_iter().map(SourceId::Device).collect();
        let warmup = Duration::from_millis(200);

        let start = Instant::now();
        let frames = capture_from_all(&ids, warmup, fake_open);
        let elapsed = start.elapsed();

        assert!(frames.iter().all(Option::is_some));
        assert!(elapsed >= warmup);
        // Sequential warm-ups would take 800 ms
        assert!(elapsed < Duration::from_millis(600), "took {:?}", elapsed);
    }

    #[test]
    fn test_video_extension_detection() {
        assert!(is_video_file(Path::new("aisle.MP4")));
        assert!(is_video_file(Path::new("clip.mkv")));
        assert!(!is_video_file(Path::new("clip.gif")));
        assert!(!is_video_file(Path::new("frames")));
    }

    #[cfg(not(feature = "v4l"))]
    #[test]
    fn test_camera_requires_feature() {
        let result = open_source(&SourceId::Device(0));
        assert!(matches!(result, Err(SourceError::Unsupported(_))));
    }
}
