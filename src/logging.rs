//! Log file setup

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::image::ModuleImage;

/// Errors setting up logging
#[derive(Debug, Error)]
pub enum LogError {
    /// Log file couldn't be created
    #[error("failed to create {path:?}: {source}")]
    Io {
        /// Log file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// A global subscriber is already installed
    #[error("failed to install subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Sends all `tracing` output to a fresh file at `path`.
///
/// The level defaults to `info` and can be changed through `RUST_LOG`.
pub fn init<P: AsRef<Path>>(path: P) -> Result<(), LogError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| LogError::Io {
        path: path.to_owned(),
        source,
    })?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish()
        .try_init()?;
    Ok(())
}

/// Logs which module is being fixed and where it's loaded
pub fn log_module(image: &ModuleImage) {
    info!("-------------------------------------");
    info!("Module Name: {}", image.name().unwrap_or("<unknown>"));
    match image.path() {
        Some(path) => info!("Module Path: {}", path.display()),
        None => info!("Module Path: <unknown>"),
    }
    info!("Module Addr: {:#x}", image.base());
    info!("Module Size: {:#x}", image.size());
}
