//! Caller-keyed resolution of capture settings
//!
//! Module names match by substring containment against the caller's source
//! path. Every matching entry overrides the port; output directory and
//! duration are only taken from entries that set them, so the last matching
//! entry with a non-empty field wins for that field.

use log::{info, warn};
use rand::Rng;
use rp_common::{DEFAULT_PROFILE_PORT, RANDOM_PORT_MAX, RANDOM_PORT_MIN};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::SetupConfig;
use crate::domain::{ArtifactPaths, ProfileSettings};

/// Port used when no module entry matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortFallback {
    Fixed(u16),
    /// Uniform in `[RANDOM_PORT_MIN, RANDOM_PORT_MAX)`
    Random,
}

impl Default for PortFallback {
    fn default() -> Self {
        PortFallback::Fixed(DEFAULT_PROFILE_PORT)
    }
}

impl PortFallback {
    fn port(self) -> u16 {
        match self {
            PortFallback::Fixed(port) => port,
            PortFallback::Random => random_port(RANDOM_PORT_MIN, RANDOM_PORT_MAX),
        }
    }
}

/// Trim a caller's source file to its crate-relative form.
///
/// Unlike a plain "everything after `src`" cut, this keeps one leading
/// component: the crate directory that owns the last `src` component, so
/// `/home/ci/work/billing/src/api/mod.rs` becomes `billing/src/api/mod.rs`
/// and module names can be crate names. Paths without such a marker are
/// returned as-is.
#[must_use]
pub fn caller_source_path(file: &str) -> String {
    let components: Vec<Component<'_>> = Path::new(file).components().collect();
    let marker = components
        .iter()
        .rposition(|c| matches!(c, Component::Normal(name) if *name == "src"));

    match marker {
        Some(index) if index > 0 && matches!(components[index - 1], Component::Normal(_)) => {
            components[index - 1..]
                .iter()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        }
        _ => file.to_string(),
    }
}

/// Resolve settings for `caller`, rooting default files in the working directory
#[must_use]
pub fn resolve(caller: &str, config: &SetupConfig, fallback: PortFallback) -> ProfileSettings {
    let working_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    resolve_in(caller, config, fallback, &working_dir)
}

/// Resolve settings for `caller`, rooting default files in `working_dir`
///
/// Never fails: with no table or no match the defaults come back. Output
/// directories named by matching entries are created on the way.
#[must_use]
pub fn resolve_in(
    caller: &str,
    config: &SetupConfig,
    fallback: PortFallback,
    working_dir: &Path,
) -> ProfileSettings {
    info!("caller file : {caller}");

    let mut settings = ProfileSettings::defaults_in(working_dir);
    let mut port = None;

    info!("ready to load config : {:?}", config.name);
    for module in &config.modules {
        let Some(name) = module.matching_name(caller) else {
            continue;
        };
        port = Some(module.profile_service_port);

        let output = module.profile_output_dir.as_str();
        if !output.is_empty() {
            ensure_output_dir(Path::new(output));
            settings.paths = ArtifactPaths::for_module(Path::new(output), name);
        }

        if let Ok(seconds @ 1..) = u64::try_from(module.profile_seconds) {
            info!("debug profile seconds : {seconds}");
            settings.duration = Duration::from_secs(seconds);
        }
    }

    settings.port = port.unwrap_or_else(|| fallback.port());
    settings
}

/// Uniform port in `[min, max)`; `min` when the range is empty
#[must_use]
pub fn random_port(min: u16, max: u16) -> u16 {
    if min >= max {
        return min;
    }
    rand::thread_rng().gen_range(min..max)
}

fn ensure_output_dir(dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(dir) {
        warn!("Failed to create profile output dir {}: {e}", dir.display());
    }
}
