//! Video file source using FFmpeg.
//!
//! Frames are decoded sequentially from the best video stream and scaled to RGB24.

use anyhow::Context;
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use std::path::Path;
use tracing::info;

use super::{Frame, FrameSource, SourceError};

pub struct FfmpegVideo {
    path: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    eof_sent: bool,
    frame_index: u64,
}

impl FfmpegVideo {
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        Self::try_open(path).map_err(|e| SourceError::Open {
            id: path.display().to_string(),
            reason: format!("{:#}", e),
        })
    }

    fn try_open(path: &Path) -> anyhow::Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path).context("open input with ffmpeg")?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("file has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        info!(
            "Opened video {} ({}x{})",
            path.display(),
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            path: path.display().to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            eof_sent: false,
            frame_index: 0,
        })
    }

    fn emit(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame, SourceError> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .map_err(|e| SourceError::Decode(format!("scale frame to RGB: {}", e)))?;
        let image = frame_to_image(&rgb_frame)?;

        let frame = Frame::new(image, self.frame_index);
        self.frame_index += 1;
        Ok(frame)
    }
}

impl FrameSource for FfmpegVideo {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let mut decoded = ffmpeg::frame::Video::empty();

        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.emit(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }

            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));

            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .map_err(|e| SourceError::Decode(format!("send packet: {}", e)))?;
                }
                Some(_) => continue,
                None => {
                    self.decoder
                        .send_eof()
                        .map_err(|e| SourceError::Decode(format!("flush decoder: {}", e)))?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn describe(&self) -> String {
        format!("video {}", self.path)
    }
}

fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .ok_or_else(|| SourceError::Decode("ffmpeg frame row is out of bounds".to_string()))?,
        );
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| SourceError::Decode("frame buffer does not match dimensions".to_string()))
}
