//! ShelfSight - Retail shelf imaging
//!
//! Captures stills from several cameras, stitches naive panoramas from shelf
//! videos and runs a live product/price-label detection pipeline that stores
//! product crops with their OCR'd label text in SQLite.

mod capture;
mod config;
mod panorama;
mod pipeline;
mod preview;
mod storage;
mod vision;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::capture::{open_source, SourceId};
use crate::config::{AppConfig, DetectionConfig, OcrBackend, OcrConfig};
use crate::panorama::StitchAxis;
use crate::pipeline::{
    Annotator, DetectionPipeline, DirectorySink, FrameSink, MultiSink, NullSink, PipelineOptions, PipelineSummary,
};
use crate::storage::{codec, ProductStore};
use crate::vision::{ModelAsset, ModelManager, ObjectDetector, PaddleRecognizer, TesseractOcr, TextRecognizer, YoloDetector};

/// ShelfSight - retail shelf imaging
#[derive(Parser, Debug)]
#[command(name = "shelfsight")]
#[command(about = "Multi-camera capture, shelf panoramas and product/price-label detection")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Grab one frame from every camera concurrently
    Capture {
        /// Camera indices or paths (overrides the configured list)
        sources: Vec<SourceId>,
        /// Directory for camera_<id>.jpg files
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Do not write the captured frames
        #[arg(long)]
        no_save: bool,
        /// Do not open the preview window
        #[arg(long)]
        headless: bool,
        /// Delay before grabbing, in milliseconds
        #[arg(long)]
        warmup_ms: Option<u64>,
    },
    /// Stitch sampled frames of a video into one image
    Panorama {
        /// Video file, GIF or image directory
        input: SourceId,
        /// Keep every Nth frame
        #[arg(short, long)]
        stride: Option<usize>,
        /// Stack frames vertically instead of side by side
        #[arg(long)]
        vertical: bool,
        /// Destination JPEG
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Detect products and price labels on a live source and store them
    Detect {
        /// Camera index or path
        #[arg(long)]
        source: Option<SourceId>,
        /// YOLO ONNX model
        #[arg(long)]
        model: Option<PathBuf>,
        /// Download the model from here when it is not on disk
        #[arg(long)]
        model_url: Option<String>,
        /// Process every Nth frame
        #[arg(long)]
        every: Option<u64>,
        /// Blocking worker pool size
        #[arg(long)]
        workers: Option<usize>,
        /// OCR engine
        #[arg(long, value_enum)]
        ocr: Option<OcrBackend>,
        /// SQLite record store
        #[arg(long)]
        db: Option<PathBuf>,
        /// Stop after this many frames
        #[arg(long)]
        max_frames: Option<u64>,
        /// Write annotated frames to this directory
        #[arg(long)]
        annotated_dir: Option<PathBuf>,
        /// Run without a window; Ctrl-C stops
        #[arg(long)]
        headless: bool,
    },
    /// List stored product records
    Records {
        /// SQLite record store
        #[arg(long)]
        db: Option<PathBuf>,
        /// Show at most this many records
        #[arg(short, long)]
        limit: Option<usize>,
        /// Export stored images into this directory
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Write the default configuration file
    InitConfig {
        /// Destination (defaults to --config or the user config directory)
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Command::InitConfig { path, force } = &cli.command {
        return init_config(path.as_deref().or(cli.config.as_deref()), *force);
    }

    let mut config = config::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Capture {
            sources,
            output_dir,
            no_save,
            headless,
            warmup_ms,
        } => {
            if !sources.is_empty() {
                config.capture.sources = sources;
            }
            if let Some(dir) = output_dir {
                config.capture.output_dir = dir;
            }
            if let Some(ms) = warmup_ms {
                config.capture.warmup_ms = ms;
            }
            config.capture.save &= !no_save;
            config.display.headless |= headless;
            config.validate()?;
            run_capture(&config)
        }
        Command::Panorama {
            input,
            stride,
            vertical,
            output,
        } => {
            if let Some(stride) = stride {
                config.panorama.stride = stride;
            }
            if vertical {
                config.panorama.axis = StitchAxis::Vertical;
            }
            if let Some(output) = output {
                config.panorama.output = output;
            }
            config.validate()?;
            panorama::run(
                &input,
                config.panorama.stride,
                config.panorama.axis,
                &config.panorama.output,
                config.panorama.jpeg_quality,
            )
            .map(|_| ())
        }
        Command::Detect {
            source,
            model,
            model_url,
            every,
            workers,
            ocr,
            db,
            max_frames,
            annotated_dir,
            headless,
        } => {
            if let Some(source) = source {
                config.detection.source = source;
            }
            if let Some(model) = model {
                config.detection.model_path = model;
            }
            if model_url.is_some() {
                config.detection.model_url = model_url;
            }
            if let Some(every) = every {
                config.detection.every_nth_frame = every;
            }
            if let Some(workers) = workers {
                config.detection.worker_threads = workers;
            }
            if let Some(ocr) = ocr {
                config.ocr.backend = ocr;
            }
            if let Some(db) = db {
                config.storage.database = db;
            }
            if max_frames.is_some() {
                config.detection.max_frames = max_frames;
            }
            if annotated_dir.is_some() {
                config.display.annotated_dir = annotated_dir;
            }
            config.display.headless |= headless;
            config.validate()?;
            run_detect(&config)
        }
        Command::Records { db, limit, export } => {
            let db = db.unwrap_or_else(|| config.storage.database.clone());
            run_records(&db, limit, export.as_deref())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Write the default configuration
fn init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_config_path()?,
    };
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    config::save_config(&AppConfig::default(), &path)?;
    info!("Wrote default configuration to {:?}", path);
    Ok(())
}

/// Multi-camera still capture
fn run_capture(config: &AppConfig) -> Result<()> {
    let ids = &config.capture.sources;
    info!("Capturing from {} sources", ids.len());

    let frames = capture::capture_from_all(ids, Duration::from_millis(config.capture.warmup_ms), open_source);
    let captured = frames.iter().filter(|f| f.is_some()).count();
    info!("Captured {} of {} frames", captured, ids.len());
    if captured == 0 {
        warn!("No source produced a frame");
    }

    if config.capture.save {
        capture::save_captures(ids, &frames, &config.capture.output_dir)?;
    }

    if !config.display.headless {
        let gallery = ids
            .iter()
            .zip(frames)
            .filter_map(|(id, frame)| frame.map(|f| (format!("Camera {}", id), f.image)))
            .collect();
        preview::show_gallery(gallery)?;
    }

    Ok(())
}

fn build_detector(config: &DetectionConfig) -> Result<Box<dyn ObjectDetector>> {
    let model_path = ModelManager::new()?.locate_detector(&config.model_path, config.model_url.as_deref())?;
    Ok(Box::new(YoloDetector::new(&model_path, config.yolo_config())?))
}

fn build_recognizer(config: &OcrConfig) -> Result<Box<dyn TextRecognizer>> {
    match config.backend {
        OcrBackend::Tesseract => Ok(Box::new(
            TesseractOcr::new(&config.language)
                .with_binary(&config.tesseract_binary)
                .with_page_segmentation(config.page_segmentation),
        )),
        OcrBackend::Paddle => {
            let (model, dictionary) = match (&config.recognition_model, &config.dictionary) {
                (Some(model), Some(dictionary)) => (model.clone(), dictionary.clone()),
                (model, dictionary) => {
                    let manager = ModelManager::new()?;
                    let model = match model {
                        Some(model) => model.clone(),
                        None => manager.ensure(&ModelAsset::paddle_recognition())?,
                    };
                    let dictionary = match dictionary {
                        Some(dictionary) => dictionary.clone(),
                        None => manager.ensure(&ModelAsset::paddle_dictionary())?,
                    };
                    (model, dictionary)
                }
            };
            Ok(Box::new(PaddleRecognizer::new(&model, &dictionary)?))
        }
    }
}

/// Open the live source and run the loop. The store is closed on every path.
fn run_pipeline(
    pipeline: &DetectionPipeline,
    source_id: &SourceId,
    sink: &mut dyn FrameSink,
    annotator: &Annotator,
    stop: Arc<AtomicBool>,
) -> Result<PipelineSummary> {
    let mut source = match open_source(source_id) {
        Ok(source) => source,
        Err(e) => {
            pipeline.close()?;
            return Err(anyhow!("Could not open live source {}: {}", source_id, e));
        }
    };
    info!("Reading from {}", source.describe());
    pipeline.run(source.as_mut(), sink, annotator, stop, true)
}

fn build_sink(config: &AppConfig, display: Option<Box<dyn FrameSink>>) -> Result<MultiSink> {
    let mut sinks: Vec<Box<dyn FrameSink>> = Vec::new();
    if let Some(dir) = &config.display.annotated_dir {
        sinks.push(Box::new(DirectorySink::new(dir)?));
    }
    sinks.push(display.unwrap_or_else(|| Box::new(NullSink)));
    Ok(MultiSink(sinks))
}

/// Live detection, OCR and persistence
fn run_detect(config: &AppConfig) -> Result<()> {
    let detector = build_detector(&config.detection)?;
    let recognizer = build_recognizer(&config.ocr)?;
    let store = ProductStore::open(&config.storage.database)
        .with_context(|| format!("Failed to open record store {:?}", config.storage.database))?;

    let options = PipelineOptions {
        every_nth_frame: config.detection.every_nth_frame,
        worker_threads: config.detection.worker_threads,
        label_mode: config.detection.label_mode,
        product_classes: config.detection.product_classes.clone(),
        label_classes: config.detection.label_classes.clone(),
        encoding: config.storage.encoding,
        max_frames: config.detection.max_frames,
    };
    let pipeline = DetectionPipeline::new(detector, recognizer, store, options);
    let annotator = Annotator::new(config.display.font_path.as_deref(), config.display.font_size);
    let stop = Arc::new(AtomicBool::new(false));

    if config.display.headless {
        let mut sink = match build_sink(config, None) {
            Ok(sink) => sink,
            Err(e) => {
                pipeline.close()?;
                return Err(e);
            }
        };
        run_pipeline(&pipeline, &config.detection.source, &mut sink, &annotator, stop)?;
        return Ok(());
    }

    let (preview_sink, frames) = preview::live_channel(Arc::clone(&stop));
    let mut sink = match build_sink(config, Some(Box::new(preview_sink))) {
        Ok(sink) => sink,
        Err(e) => {
            pipeline.close()?;
            return Err(e);
        }
    };
    let source_id = config.detection.source.clone();
    let worker_stop = Arc::clone(&stop);

    // The window must own the main thread; the pipeline runs beside it
    let worker = std::thread::Builder::new()
        .name("pipeline".to_string())
        .spawn(move || run_pipeline(&pipeline, &source_id, &mut sink, &annotator, worker_stop))
        .context("Failed to start pipeline thread")?;

    let viewer = preview::run_live_viewer(frames, Arc::clone(&stop));
    stop.store(true, Ordering::SeqCst);

    let summary = worker
        .join()
        .map_err(|_| anyhow!("Pipeline thread panicked"))?;

    if let Err(e) = &viewer {
        error!("{:#}", e);
    }
    summary?;
    viewer
}

/// Read-only listing of stored records
fn run_records(db: &Path, limit: Option<usize>, export: Option<&Path>) -> Result<()> {
    if !db.exists() {
        bail!("Record store {:?} does not exist", db);
    }
    let mut store = ProductStore::open_read_only(db)?;

    if let Some(dir) = export {
        std::fs::create_dir_all(dir)?;
    }

    println!("{} records in {}", store.count()?, db.display());
    for product in store.list(limit)? {
        let bytes = match codec::decode_base64(&product.product_image) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Record {} has an unreadable image: {}", product.product_id, e);
                continue;
            }
        };
        let size = image::load_from_memory(&bytes)
            .map(|img| format!("{}x{}", img.width(), img.height()))
            .unwrap_or_else(|_| "undecodable".to_string());
        println!("{:>6}  {:<10}  {:?}", product.product_id, size, product.label_text);

        if let Some(dir) = export {
            let path = dir.join(format!("product_{}.{}", product.product_id, codec::sniff_extension(&bytes)));
            std::fs::write(&path, &bytes).with_context(|| format!("Failed to write {:?}", path))?;
        }
    }

    store.close()?;
    Ok(())
}
