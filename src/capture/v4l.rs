//! V4L2 camera source
//!
//! Requests 640x480 YUYV and converts whatever the driver settles on (YUYV, RGB3 or
//! MJPG) to RGB.

use image::RgbImage;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{Frame, FrameSource, SourceError};

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const BUFFER_COUNT: u32 = 4;

/// Live camera opened through V4L2 memory-mapped streaming
pub struct V4lCamera {
    // Declared before the device so the buffers are unmapped first
    stream: Stream<'static>,
    _device: Device,
    device_path: String,
    width: u32,
    height: u32,
    fourcc: [u8; 4],
    frame_index: u64,
}

impl V4lCamera {
    /// Open a camera by device node, e.g. `/dev/video0`
    pub fn open(device_path: &str) -> Result<Self, SourceError> {
        let open_error = |reason: String| SourceError::Open {
            id: device_path.to_string(),
            reason,
        };

        let device = Device::with_path(device_path).map_err(|e| open_error(e.to_string()))?;

        let mut format = device.format().map_err(|e| open_error(e.to_string()))?;
        format.width = REQUESTED_WIDTH;
        format.height = REQUESTED_HEIGHT;
        format.fourcc = FourCC::new(b"YUYV");
        let format = device
            .set_format(&format)
            .map_err(|e| open_error(e.to_string()))?;

        let stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| open_error(e.to_string()))?;

        info!(
            "Opened camera {} at {}x{} ({})",
            device_path, format.width, format.height, format.fourcc
        );

        Ok(Self {
            stream,
            _device: device,
            device_path: device_path.to_string(),
            width: format.width,
            height: format.height,
            fourcc: format.fourcc.repr,
            frame_index: 0,
        })
    }

    fn convert(&self, buffer: &[u8]) -> Result<RgbImage, SourceError> {
        let rgb = match &self.fourcc {
            b"YUYV" => yuyv_to_rgb(buffer),
            b"RGB3" => buffer.to_vec(),
            b"MJPG" => {
                return image::load_from_memory_with_format(buffer, image::ImageFormat::Jpeg)
                    .map(|image| image.to_rgb8())
                    .map_err(|e| SourceError::Decode(e.to_string()));
            }
            other => {
                return Err(SourceError::Unsupported(format!(
                    "pixel format {}",
                    String::from_utf8_lossy(other)
                )))
            }
        };

        let expected = (self.width * self.height * 3) as usize;
        if rgb.len() < expected {
            return Err(SourceError::Decode(format!(
                "short buffer: {} bytes, expected {}",
                rgb.len(),
                expected
            )));
        }

        RgbImage::from_raw(self.width, self.height, rgb[..expected].to_vec())
            .ok_or_else(|| SourceError::Decode("buffer does not match frame size".to_string()))
    }
}

impl FrameSource for V4lCamera {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let (buffer, meta) = self.stream.next()?;
        debug!("{}: buffer {} ({} bytes)", self.device_path, meta.sequence, buffer.len());
        let buffer = buffer.to_vec();

        let image = self.convert(&buffer)?;
        let frame = Frame::new(image, self.frame_index);
        self.frame_index += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        format!("V4L2 camera {} ({}x{})", self.device_path, self.width, self.height)
    }
}

/// Convert packed YUYV 4:2:2 to RGB24
fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);

    for chunk in yuyv.chunks_exact(4) {
        let u = chunk[1] as f32 - 128.0;
        let v = chunk[3] as f32 - 128.0;

        for y in [chunk[0] as f32, chunk[2] as f32] {
            let r = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
            let g = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
            let b = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
            rgb.extend_from_slice(&[r, g, b]);
        }
    }

    rgb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_gray_pixels() {
        // Neutral chroma keeps luma as gray
        let rgb = yuyv_to_rgb(&[100, 128, 200, 128]);
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_ignores_trailing_bytes() {
        let rgb = yuyv_to_rgb(&[16, 128, 16, 128, 99]);
        assert_eq!(rgb.len(), 6);
    }
}
