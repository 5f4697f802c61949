//! Pre-flight checks for rp
//!
//! Validates the resolved settings before the service starts so a bad output
//! directory or a taken port fails at startup, not on the first trigger.

use anyhow::{bail, Context, Result};
use rp_common::Modality;
use std::fs::OpenOptions;
use std::net::{Ipv4Addr, TcpListener};
use std::path::Path;

use crate::domain::ProfileSettings;

/// Run all pre-flight checks for `settings`
///
/// # Errors
/// Returns an error naming the first check that failed
pub fn run_preflight_checks(settings: &ProfileSettings, quiet: bool) -> Result<()> {
    for modality in Modality::ALL {
        if let Some(path) = settings.paths.path_for(modality) {
            check_artifact_dir(path)?;
        }
    }
    check_port_available(settings.port)?;
    check_allocator(quiet);
    Ok(())
}

/// Check that the directory of `artifact` exists and accepts new files
///
/// # Errors
/// Returns an error if the directory is missing or not writable
pub fn check_artifact_dir(artifact: &Path) -> Result<()> {
    let dir = match artifact.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    if !dir.is_dir() {
        bail!(
            "Output directory not found: {}\n\n\
             Create it or pass --output-dir.",
            dir.display()
        );
    }

    let scratch = dir.join(format!(".rp-preflight-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&scratch)
        .with_context(|| format!("Output directory {} is not writable", dir.display()))?;
    std::fs::remove_file(&scratch).ok();
    Ok(())
}

/// Check that nothing is listening on `port` yet
///
/// # Errors
/// Returns an error if the port is taken
pub fn check_port_available(port: u16) -> Result<()> {
    if port == 0 {
        return Ok(());
    }
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).with_context(|| {
        format!(
            "Port {port} is already in use\n\n\
             Pick another with --port or use --random-port."
        )
    })?;
    Ok(())
}

fn check_allocator(quiet: bool) {
    if quiet {
        return;
    }
    if !crate::capture::memory::allocator_installed() {
        eprintln!("warning: SamplingAllocator is not the global allocator, memory profiles will be empty");
    }
}
