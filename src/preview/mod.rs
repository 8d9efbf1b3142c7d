//! Preview windows
//!
//! An egui gallery for captured stills (any key closes it) and a live viewer
//! for the annotated detection stream (`q` quits).

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use eframe::egui;
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::pipeline::{FrameSink, SinkControl};

/// Frames waiting for the live viewer
const LIVE_QUEUE: usize = 2;

fn to_color_image(image: &RgbImage) -> egui::ColorImage {
    egui::ColorImage::from_rgb([image.width() as usize, image.height() as usize], image.as_raw())
}

fn any_key_pressed(ctx: &egui::Context) -> bool {
    ctx.input(|i| {
        i.events
            .iter()
            .any(|event| matches!(event, egui::Event::Key { pressed: true, .. }))
    })
}

/// Shows one panel per captured frame
struct GalleryApp {
    frames: Vec<(String, RgbImage)>,
    textures: Vec<(String, egui::TextureHandle)>,
}

impl GalleryApp {
    fn new(frames: Vec<(String, RgbImage)>) -> Self {
        Self {
            frames,
            textures: Vec::new(),
        }
    }

    fn load_textures(&mut self, ctx: &egui::Context) {
        if !self.textures.is_empty() || self.frames.is_empty() {
            return;
        }
        for (title, image) in self.frames.drain(..) {
            let texture = ctx.load_texture(title.clone(), to_color_image(&image), egui::TextureOptions::LINEAR);
            self.textures.push((title, texture));
        }
    }
}

impl eframe::App for GalleryApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.load_textures(ctx);

        if any_key_pressed(ctx) {
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            let count = self.textures.len().max(1) as f32;
            let available = ui.available_size();
            let panel_width = (available.x / count) - 8.0;

            ui.horizontal(|ui| {
                for (title, texture) in &self.textures {
                    ui.vertical(|ui| {
                        ui.label(title);
                        let size = texture.size_vec2();
                        let scale = (panel_width / size.x).min((available.y - 24.0) / size.y).max(0.01);
                        ui.image((texture.id(), size * scale));
                    });
                }
            });
        });
    }
}

/// Show captured frames until a key is pressed or the window is closed
pub fn show_gallery(frames: Vec<(String, RgbImage)>) -> Result<()> {
    if frames.is_empty() {
        info!("Nothing to preview");
        return Ok(());
    }

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([1280.0, 400.0])
            .with_title("ShelfSight Capture"),
        ..Default::default()
    };

    let app = GalleryApp::new(frames);
    eframe::run_native("ShelfSight Capture", options, Box::new(|_cc| Ok(Box::new(app))))
        .map_err(|e| anyhow::anyhow!("Preview window failed: {}", e))
}

/// Displays frames pushed by the pipeline thread
struct LiveViewer {
    frames: Receiver<RgbImage>,
    stop: Arc<AtomicBool>,
    texture: Option<egui::TextureHandle>,
    finished: bool,
}

impl eframe::App for LiveViewer {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        if ctx.input(|i| i.key_pressed(egui::Key::Q)) {
            info!("Quit key pressed");
            self.stop.store(true, Ordering::SeqCst);
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        }

        // Show only the newest pending frame
        let mut latest = None;
        loop {
            match self.frames.try_recv() {
                Ok(frame) => latest = Some(frame),
                Err(crossbeam_channel::TryRecvError::Empty) => break,
                Err(crossbeam_channel::TryRecvError::Disconnected) => {
                    self.finished = true;
                    break;
                }
            }
        }

        if let Some(frame) = latest {
            let image = to_color_image(&frame);
            let size = image.size;
            if let Some(texture) = self.texture.as_mut().filter(|t| t.size() == size) {
                texture.set(image, egui::TextureOptions::LINEAR);
            } else {
                self.texture = Some(ctx.load_texture("live", image, egui::TextureOptions::LINEAR));
            }
        }

        egui::CentralPanel::default().show(ctx, |ui| match &self.texture {
            Some(texture) => {
                let available = ui.available_size();
                let size = texture.size_vec2();
                let scale = (available.x / size.x).min(available.y / size.y).max(0.01);
                ui.centered_and_justified(|ui| {
                    ui.image((texture.id(), size * scale));
                });
            }
            None => {
                ui.centered_and_justified(|ui| {
                    ui.label("Waiting for frames...");
                });
            }
        });

        if self.finished {
            debug!("Frame stream ended, closing viewer");
            ctx.send_viewport_cmd(egui::ViewportCommand::Close);
        } else {
            ctx.request_repaint_after(Duration::from_millis(15));
        }
    }
}

impl Drop for LiveViewer {
    fn drop(&mut self) {
        // Window closed by the user also ends the pipeline
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Run the live viewer on the calling thread until `q`, window close or end of stream
pub fn run_live_viewer(frames: Receiver<RgbImage>, stop: Arc<AtomicBool>) -> Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([960.0, 720.0])
            .with_title("ShelfSight Detection"),
        ..Default::default()
    };

    let app = LiveViewer {
        frames,
        stop,
        texture: None,
        finished: false,
    };
    eframe::run_native("ShelfSight Detection", options, Box::new(|_cc| Ok(Box::new(app))))
        .map_err(|e| anyhow::anyhow!("Preview window failed: {}", e))
}

/// Pipeline side of the live viewer
pub struct PreviewSink {
    sender: Sender<RgbImage>,
    stop: Arc<AtomicBool>,
}

/// Create a connected sink and receiver for [`run_live_viewer`]
pub fn live_channel(stop: Arc<AtomicBool>) -> (PreviewSink, Receiver<RgbImage>) {
    let (sender, receiver) = crossbeam_channel::bounded(LIVE_QUEUE);
    (PreviewSink { sender, stop }, receiver)
}

impl FrameSink for PreviewSink {
    fn show(&mut self, frame: &RgbImage, _index: u64) -> Result<SinkControl> {
        if self.stop.load(Ordering::SeqCst) {
            return Ok(SinkControl::Quit);
        }
        match self.sender.try_send(frame.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => Ok(SinkControl::Continue),
            Err(TrySendError::Disconnected(_)) => Ok(SinkControl::Quit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_color_image_conversion() {
        let image = RgbImage::from_pixel(3, 2, Rgb([10, 20, 30]));
        let color = to_color_image(&image);
        assert_eq!(color.size, [3, 2]);
        assert_eq!(color.pixels[5], egui::Color32::from_rgb(10, 20, 30));
    }

    #[test]
    fn test_preview_sink_delivers_frames() {
        let stop = Arc::new(AtomicBool::new(false));
        let (mut sink, receiver) = live_channel(Arc::clone(&stop));

        let frame = RgbImage::new(4, 4);
        assert_eq!(sink.show(&frame, 0).unwrap(), SinkControl::Continue);
        assert_eq!(receiver.try_recv().unwrap().dimensions(), (4, 4));
    }

    #[test]
    fn test_preview_sink_drops_frames_when_full() {
        let stop = Arc::new(AtomicBool::new(false));
        let (mut sink, _receiver) = live_channel(stop);
        for index in 0..5 {
            assert_eq!(sink.show(&RgbImage::new(2, 2), index).unwrap(), SinkControl::Continue);
        }
    }

    #[test]
    fn test_preview_sink_quits_when_viewer_gone() {
        let stop = Arc::new(AtomicBool::new(false));
        let (mut sink, receiver) = live_channel(Arc::clone(&stop));
        drop(receiver);
        assert_eq!(sink.show(&RgbImage::new(2, 2), 0).unwrap(), SinkControl::Quit);

        let (mut sink, _receiver) = live_channel(Arc::clone(&stop));
        stop.store(true, Ordering::SeqCst);
        assert_eq!(sink.show(&RgbImage::new(2, 2), 0).unwrap(), SinkControl::Quit);
    }
}
