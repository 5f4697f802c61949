//! Domain model for rp
//!
//! This module contains core domain types and errors that provide:
//! - One place naming where each modality's artifact goes
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{Artifact, ArtifactPaths, ProfileSettings};

pub use errors::{CaptureError, ConfigError, ServiceError};
