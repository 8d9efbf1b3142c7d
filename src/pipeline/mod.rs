//! Live detection, OCR and persistence pipeline
//!
//! Reads frames from a live source, runs detection on every Nth frame, pairs each
//! product with its nearest price label, reads the label text and stores the product
//! crop with that text. Every frame is handed to a [`FrameSink`], annotated when processed.
//!
//! Each blocking step runs on tokio's bounded blocking pool and is awaited before the
//! next one starts, so frames are never pipelined.

pub mod annotate;

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::capture::FrameSource;
use crate::config::LabelMode;
use crate::storage::{ImageEncoding, ProductStore};
use crate::vision::{associate_nearest_label, crop, Association, Detection, ObjectDetector, TextRecognizer};

pub use annotate::{Annotation, Annotator};

/// Shared detector handle
pub type SharedDetector = Arc<Mutex<Box<dyn ObjectDetector>>>;
/// Shared recognizer handle
pub type SharedRecognizer = Arc<Mutex<Box<dyn TextRecognizer>>>;

/// What a sink wants the loop to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkControl {
    Continue,
    Quit,
}

/// Destination of rendered frames
pub trait FrameSink: Send {
    fn show(&mut self, frame: &RgbImage, index: u64) -> Result<SinkControl>;
}

/// Discards frames
pub struct NullSink;

impl FrameSink for NullSink {
    fn show(&mut self, _frame: &RgbImage, _index: u64) -> Result<SinkControl> {
        Ok(SinkControl::Continue)
    }
}

/// Writes every rendered frame as `frame_<index>.jpg`
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        Ok(Self { dir: dir.to_path_buf() })
    }
}

impl FrameSink for DirectorySink {
    fn show(&mut self, frame: &RgbImage, index: u64) -> Result<SinkControl> {
        let path = self.dir.join(format!("frame_{:06}.jpg", index));
        frame
            .save_with_format(&path, image::ImageFormat::Jpeg)
            .with_context(|| format!("Failed to write {:?}", path))?;
        Ok(SinkControl::Continue)
    }
}

/// Fans each frame out to several sinks; any sink can end the loop
pub struct MultiSink(pub Vec<Box<dyn FrameSink>>);

impl FrameSink for MultiSink {
    fn show(&mut self, frame: &RgbImage, index: u64) -> Result<SinkControl> {
        let mut control = SinkControl::Continue;
        for sink in &mut self.0 {
            if sink.show(frame, index)? == SinkControl::Quit {
                control = SinkControl::Quit;
            }
        }
        Ok(control)
    }
}

/// Pipeline parameters
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Process frames whose 0-based count is a multiple of this
    pub every_nth_frame: u64,
    /// Blocking pool size
    pub worker_threads: usize,
    pub label_mode: LabelMode,
    pub product_classes: Vec<usize>,
    pub label_classes: Vec<usize>,
    pub encoding: ImageEncoding,
    /// Stop after this many frames
    pub max_frames: Option<u64>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            every_nth_frame: 5,
            worker_threads: 4,
            label_mode: LabelMode::SameDetections,
            product_classes: Vec::new(),
            label_classes: Vec::new(),
            encoding: ImageEncoding::Png,
            max_frames: None,
        }
    }
}

/// Counters reported when the loop ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub frames_read: u64,
    pub frames_processed: u64,
    pub records_stored: u64,
}

/// Outcome of one processed frame
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub products: usize,
    pub labels: usize,
    pub stored_ids: Vec<i64>,
    pub annotations: Vec<Annotation>,
}

/// The detection pipeline and the handles it owns
pub struct DetectionPipeline {
    detector: SharedDetector,
    recognizer: SharedRecognizer,
    store: Arc<Mutex<ProductStore>>,
    options: PipelineOptions,
}

impl DetectionPipeline {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        recognizer: Box<dyn TextRecognizer>,
        store: ProductStore,
        options: PipelineOptions,
    ) -> Self {
        if options.label_mode == LabelMode::SameDetections {
            warn!("Products and labels both come from unfiltered detector output; every box is paired with itself");
        }
        Self {
            detector: Arc::new(Mutex::new(detector)),
            recognizer: Arc::new(Mutex::new(recognizer)),
            store: Arc::new(Mutex::new(store)),
            options,
        }
    }

    /// Handle to the record store
    pub fn store(&self) -> Arc<Mutex<ProductStore>> {
        Arc::clone(&self.store)
    }

    /// Whether the frame at this 0-based count gets processed
    pub fn should_process(&self, count: u64) -> bool {
        count % self.options.every_nth_frame.max(1) == 0
    }

    /// Run detection, association, OCR and storage on one frame
    pub async fn process_frame(&self, frame: Arc<RgbImage>) -> Result<FrameReport> {
        let (products, labels) = match self.options.label_mode {
            LabelMode::SameDetections => {
                let products = self.detect(Arc::clone(&frame)).await?;
                let labels = self.detect(Arc::clone(&frame)).await?;
                (products, labels)
            }
            LabelMode::ClassFilter => {
                let detections = self.detect(Arc::clone(&frame)).await?;
                split_by_class(detections, &self.options.product_classes, &self.options.label_classes)
            }
        };
        debug!("{} products, {} labels", products.len(), labels.len());

        let mut report = FrameReport {
            products: products.len(),
            labels: labels.len(),
            ..FrameReport::default()
        };

        let associations = blocking(move || Ok(associate_all(&products, &labels))).await?;

        for association in associations {
            let text = self.read_label(Arc::clone(&frame), association.label.clone()).await;

            let Some(id) = self
                .store_product(Arc::clone(&frame), association.product.clone(), text.clone())
                .await?
            else {
                continue;
            };

            report.stored_ids.push(id);
            report.annotations.push(Annotation {
                bbox: association.product.bbox,
                text,
            });
        }

        Ok(report)
    }

    async fn detect(&self, frame: Arc<RgbImage>) -> Result<Vec<Detection>> {
        let detector = Arc::clone(&self.detector);
        blocking(move || {
            let detections = detector.lock().detect(&frame)?;
            Ok(detections)
        })
        .await
    }

    /// OCR the label crop. Failures give an empty string.
    async fn read_label(&self, frame: Arc<RgbImage>, label: Detection) -> String {
        let recognizer = Arc::clone(&self.recognizer);
        let result = blocking(move || {
            let Some(region) = crop(&frame, &label.bbox) else {
                return Ok(String::new());
            };
            let text = recognizer.lock().recognize(&region)?;
            Ok(text)
        })
        .await;

        match result {
            Ok(text) => text,
            Err(e) => {
                warn!("OCR failed, storing empty label text: {:#}", e);
                String::new()
            }
        }
    }

    /// Encode the product crop and insert it. `None` when the crop is empty.
    async fn store_product(&self, frame: Arc<RgbImage>, product: Detection, text: String) -> Result<Option<i64>> {
        let store = Arc::clone(&self.store);
        let encoding = self.options.encoding;
        blocking(move || {
            let Some(region) = crop(&frame, &product.bbox) else {
                warn!("Skipping product with empty crop {:?}", product.bbox);
                return Ok(None);
            };
            let payload = encoding.encode_base64(&region)?;
            let id = store.lock().insert_product(&payload, &text)?;
            Ok(Some(id))
        })
        .await
    }

    /// Release the record store
    pub fn close(&self) -> Result<()> {
        self.store.lock().close()?;
        Ok(())
    }

    /// Frame loop. Ends when the source runs dry, a sink asks to quit, `stop` is set or
    /// `max_frames` is reached.
    pub async fn run_loop(
        &self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        annotator: &Annotator,
        stop: &AtomicBool,
    ) -> Result<PipelineSummary> {
        let mut summary = PipelineSummary::default();

        while !stop.load(Ordering::SeqCst) {
            if let Some(max) = self.options.max_frames {
                if summary.frames_read >= max {
                    info!("Reached frame limit of {}", max);
                    break;
                }
            }

            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("{} has no more frames", source.describe());
                    break;
                }
                Err(e) => {
                    warn!("Read failed on {}: {}", source.describe(), e);
                    break;
                }
            };

            let count = summary.frames_read;
            summary.frames_read += 1;

            let mut image = frame.image;
            if self.should_process(count) {
                let shared = Arc::new(image);
                let report = self.process_frame(Arc::clone(&shared)).await?;
                summary.frames_processed += 1;
                summary.records_stored += report.stored_ids.len() as u64;

                image = Arc::try_unwrap(shared).unwrap_or_else(|shared| (*shared).clone());
                annotator.draw(&mut image, &report.annotations);
            }

            if sink.show(&image, count)? == SinkControl::Quit {
                info!("Quit requested");
                break;
            }

            // Give signal handlers a chance to run on the single-threaded runtime
            tokio::task::yield_now().await;
        }

        Ok(summary)
    }

    /// Run the loop on a current-thread runtime with a bounded blocking pool.
    /// The store is closed whether or not the loop succeeds.
    pub fn run(
        &self,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        annotator: &Annotator,
        stop: Arc<AtomicBool>,
        watch_ctrl_c: bool,
    ) -> Result<PipelineSummary> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .max_blocking_threads(self.options.worker_threads.max(1))
            .enable_all()
            .build()
            .context("Failed to create tokio runtime")?;

        let result = runtime.block_on(async {
            if watch_ctrl_c {
                let stop = Arc::clone(&stop);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("Ctrl-C received, stopping");
                        stop.store(true, Ordering::SeqCst);
                    }
                });
            }
            self.run_loop(source, sink, annotator, &stop).await
        });

        let closed = self.close();
        match (&result, closed) {
            (Ok(summary), Ok(())) => info!(
                "Pipeline finished: {} frames read, {} processed, {} records stored",
                summary.frames_read, summary.frames_processed, summary.records_stored
            ),
            (Err(e), _) => error!("Pipeline failed: {:#}", e),
            (Ok(_), Err(e)) => return Err(e),
        }
        result
    }
}

/// Run a blocking closure on the worker pool and wait for it
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| anyhow!("worker task failed: {}", e))?
}

/// Pair every product with its nearest label; products without a label are dropped
pub fn associate_all(products: &[Detection], labels: &[Detection]) -> Vec<Association> {
    products
        .iter()
        .filter_map(|product| match associate_nearest_label(product, labels) {
            Some(label) => Some(Association {
                product: product.clone(),
                label: label.clone(),
            }),
            None => {
                debug!("No label for product at {:?}", product.bbox);
                None
            }
        })
        .collect()
}

/// Split one detection pass into products and labels by class id
pub fn split_by_class(
    detections: Vec<Detection>,
    product_classes: &[usize],
    label_classes: &[usize],
) -> (Vec<Detection>, Vec<Detection>) {
    let mut products = Vec::new();
    let mut labels = Vec::new();
    for detection in detections {
        if label_classes.contains(&detection.class_id) {
            labels.push(detection.clone());
        }
        if product_classes.contains(&detection.class_id) {
            products.push(detection);
        }
    }
    (products, labels)
}
