//! Model files
//!
//! A [`ModelAsset`] names one file the vision layer needs. [`ModelManager`] finds it on
//! disk or fetches it into the models directory, and [`OnnxModel`] loads an ONNX file
//! for inference.

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::VisionError;

/// Environment variable that disables model downloads
pub const OFFLINE_ENV: &str = "SHELFSIGHT_OFFLINE";

/// Fetch history kept next to the models
const FETCH_LOG: &str = "models.json";

const PADDLE_REPO: &str = "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english";

/// Anything smaller cannot hold a YOLO graph
const MIN_DETECTOR_BYTES: u64 = 64 * 1024;

/// One model file and where it can be fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub file_name: String,
    pub url: Option<String>,
    /// Plausible sizes in bytes; anything outside is treated as a broken file
    pub size_range: RangeInclusive<u64>,
    pub sha256: Option<String>,
}

impl ModelAsset {
    /// YOLO detector weights named by `detection.model_path`
    pub fn detector(model_path: &Path, url: Option<&str>) -> Result<Self> {
        let file_name = model_path
            .file_name()
            .with_context(|| format!("Detector model path {:?} has no file name", model_path))?;
        Ok(Self {
            file_name: file_name.to_string_lossy().into_owned(),
            url: url.map(str::to_string),
            size_range: MIN_DETECTOR_BYTES..=u64::MAX,
            sha256: None,
        })
    }

    /// PaddleOCR English CRNN recognition model
    pub fn paddle_recognition() -> Self {
        Self {
            file_name: "rec.onnx".to_string(),
            url: Some(format!("{}/rec.onnx", PADDLE_REPO)),
            size_range: 7_000_000..=10_000_000,
            sha256: None,
        }
    }

    /// Character dictionary matching [`ModelAsset::paddle_recognition`]
    pub fn paddle_dictionary() -> Self {
        Self {
            file_name: "dict.txt".to_string(),
            url: Some(format!("{}/dict.txt", PADDLE_REPO)),
            size_range: 500..=10_000,
            sha256: None,
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|meta| meta.is_file() && self.size_range.contains(&meta.len()))
            .unwrap_or(false)
    }
}

/// What was fetched, from where, and when
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRecord {
    pub url: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub fetched_at: u64,
}

/// Fetch records keyed by file name
pub type FetchLog = BTreeMap<String, FetchRecord>;

/// Locates model files and fills the models directory on demand
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Manager over `<data_dir>/models`
    pub fn new() -> Result<Self> {
        Self::with_dir(crate::storage::get_data_dir()?.join("models"))
    }

    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    /// Where `asset` lives once fetched
    pub fn cached_path(&self, asset: &ModelAsset) -> PathBuf {
        self.models_dir.join(&asset.file_name)
    }

    pub fn is_cached(&self, asset: &ModelAsset) -> bool {
        asset.accepts(&self.cached_path(asset))
    }

    /// Detector weights: the configured path when it exists, otherwise the copy in the
    /// models directory, otherwise a download from `url`.
    pub fn locate_detector(&self, configured: &Path, url: Option<&str>) -> Result<PathBuf> {
        if configured.is_file() {
            return Ok(configured.to_path_buf());
        }
        let asset = ModelAsset::detector(configured, url)?;
        if asset.url.is_none() && !self.is_cached(&asset) {
            bail!(
                "Detector model {:?} not found in {:?} and detection.model_url is not set; \
                 export a YOLO model to ONNX and point detection.model_path at it",
                configured,
                self.models_dir
            );
        }
        self.ensure(&asset)
    }

    /// Path to `asset`, fetching it first when the cached copy is missing or broken
    pub fn ensure(&self, asset: &ModelAsset) -> Result<PathBuf> {
        let path = self.cached_path(asset);
        if self.is_cached(asset) {
            debug!("Using cached model {:?}", path);
            return Ok(path);
        }
        self.fetch(asset)?;
        Ok(path)
    }

    fn fetch(&self, asset: &ModelAsset) -> Result<()> {
        let Some(url) = asset.url.as_deref() else {
            bail!("No download URL for {}", asset.file_name);
        };
        let path = self.cached_path(asset);
        if std::env::var_os(OFFLINE_ENV).is_some() {
            bail!("{} is set; download {} manually to {:?}", OFFLINE_ENV, url, path);
        }

        info!("Fetching {} from {}", asset.file_name, url);
        let partial = path.with_extension("part");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start download runtime")?;
        let outcome = runtime.block_on(download(url, &partial)).and_then(|(size, sha256)| {
            if !asset.size_range.contains(&size) {
                bail!("{} has implausible size {} bytes", asset.file_name, size);
            }
            if let Some(expected) = asset.sha256.as_deref().filter(|e| *e != sha256) {
                bail!("{} checksum mismatch: expected {}, got {}", asset.file_name, expected, sha256);
            }
            Ok((size, sha256))
        });

        let (size_bytes, sha256) = match outcome {
            Ok(done) => done,
            Err(e) => {
                let _ = std::fs::remove_file(&partial);
                return Err(e);
            }
        };
        std::fs::rename(&partial, &path).with_context(|| format!("Failed to move {:?} into place", partial))?;
        info!("Stored {} ({} bytes)", asset.file_name, size_bytes);

        self.record_fetch(
            &asset.file_name,
            FetchRecord {
                url: url.to_string(),
                size_bytes,
                sha256,
                fetched_at: unix_timestamp(),
            },
        )
    }

    /// Previously fetched files; empty when nothing was fetched yet
    pub fn fetch_log(&self) -> Result<FetchLog> {
        let path = self.models_dir.join(FETCH_LOG);
        if !path.exists() {
            return Ok(FetchLog::new());
        }
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).with_context(|| format!("Corrupt fetch log {:?}", path))
    }

    fn record_fetch(&self, file_name: &str, record: FetchRecord) -> Result<()> {
        let mut log = self.fetch_log().unwrap_or_else(|e| {
            warn!("Starting a new fetch log: {:#}", e);
            FetchLog::new()
        });
        log.insert(file_name.to_string(), record);
        std::fs::write(self.models_dir.join(FETCH_LOG), serde_json::to_string_pretty(&log)?)?;
        Ok(())
    }
}

/// Stream `url` into `dest`, returning the byte count and SHA-256
async fn download(url: &str, dest: &Path) -> Result<(u64, String)> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;

    let mut file = std::fs::File::create(dest).with_context(|| format!("Failed to create {:?}", dest))?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
    }
    file.sync_all()?;

    Ok((size, format!("{:x}", hasher.finalize())))
}

/// A loaded ONNX graph with a single output of interest
pub struct OnnxModel {
    session: Session,
    output: String,
}

impl OnnxModel {
    pub fn load(path: &Path) -> Result<Self, VisionError> {
        let load_error = |reason: String| VisionError::ModelLoad {
            path: path.display().to_string(),
            reason,
        };

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(4))
            .and_then(|b| b.commit_from_file(path))
            .map_err(|e| load_error(e.to_string()))?;
        let output = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| load_error("model has no outputs".to_string()))?;

        info!("Loaded {:?} (output {})", path, output);
        Ok(Self { session, output })
    }

    /// Run one input tensor and copy out the first output with its shape
    pub fn infer(&mut self, input: Tensor<f32>) -> Result<(Vec<i64>, Vec<f32>), VisionError> {
        let outputs = self.session.run(ort::inputs![input])?;
        let (shape, data) = outputs[self.output.as_str()].try_extract_tensor::<f32>()?;
        Ok((shape.to_vec(), data.to_vec()))
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
