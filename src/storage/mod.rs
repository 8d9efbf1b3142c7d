//! Storage Layer
//!
//! Persistence of detected products in SQLite plus the application's
//! data and configuration directories.

pub mod codec;
pub mod database;

use anyhow::Result;
use std::path::PathBuf;
use thiserror::Error;

pub use codec::ImageEncoding;
pub use database::{ProductStore, StoredProduct};

/// Errors raised by the record store and its image codec
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("store is closed")]
    Closed,
}

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "shelfsight", "ShelfSight")
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;

    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;

    Ok(config_dir)
}
