//! Structured error types for rp
//!
//! Using thiserror for automatic Display implementation and error chaining.

use rp_common::Modality;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file {0} not found")]
    NotFound(PathBuf),

    #[error("Failed to read config file {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },

    #[error("Failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
}

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("could not create {modality} profile {path}: {source}")]
    ArtifactCreate { modality: Modality, path: PathBuf, source: std::io::Error },

    #[error("Failed to write {modality} profile: {source}")]
    ArtifactWrite { modality: Modality, source: std::io::Error },

    #[error("{0} collector is already running")]
    CollectorBusy(Modality),

    #[error("{modality} collector failed: {reason}")]
    CollectorFailed { modality: Modality, reason: String },

    #[error("{0} capture task panicked")]
    TaskPanicked(Modality),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CaptureError {
    /// Wrap an I/O error raised while flushing a modality's artifact
    pub fn write(modality: Modality) -> impl Fn(std::io::Error) -> Self + Copy {
        move |source| CaptureError::ArtifactWrite { modality, source }
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to bind profile service on port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
