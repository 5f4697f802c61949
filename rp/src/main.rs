//! # rp - Main Entry Point
//!
//! Resolves capture settings from the module table and the command line,
//! serves the trigger endpoint until Ctrl+C, and optionally drives a
//! synthetic workload so captures of this very process have content.

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;

use rp::capture::block::ContentionMutex;
use rp::capture::memory::SamplingAllocator;
use rp::capture::trace::TraceLayer;
use rp::capture::EXIT_ARTIFACT_FAILURE;
use rp::cli::Args;
use rp::config::{caller_source_path, resolve, ConfigStore, PortFallback, SetupConfig};
use rp::domain::{ArtifactPaths, ProfileSettings};
use rp::preflight::run_preflight_checks;
use rp_common::{Modality, DEFAULT_PROFILE_PORT};

#[global_allocator]
static ALLOC: SamplingAllocator = SamplingAllocator::system();

// Exit codes (usage errors exit with 2 from clap)
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = err.to_string().to_lowercase();
    if msg.contains("output directory") {
        EXIT_ARTIFACT_FAILURE
    } else {
        EXIT_ERROR
    }
}

/// Module table plus command-line overrides
///
/// A missing or malformed module table is logged and treated as empty.
fn resolve_settings(args: &Args) -> Result<ProfileSettings> {
    let store = match &args.config {
        Some(path) => ConfigStore::load_or_default(path),
        None => ConfigStore::new(SetupConfig::default()),
    };

    let caller = args.module.clone().unwrap_or_else(|| caller_source_path(file!()));
    let fallback = if args.random_port {
        PortFallback::Random
    } else {
        PortFallback::Fixed(args.port.unwrap_or(DEFAULT_PROFILE_PORT))
    };
    let mut settings = resolve(&caller, &store.snapshot(), fallback);

    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(seconds) = args.seconds {
        settings.duration = Duration::from_secs(seconds);
    }
    if let Some(dir) = &args.output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create output directory {}", dir.display()))?;
        settings.paths = ArtifactPaths::in_working_dir(dir);
    }
    Ok(settings)
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let settings = resolve_settings(&args)?;
    run_preflight_checks(&settings, quiet)?;

    tracing::subscriber::set_global_default(tracing_subscriber::registry().with(TraceLayer::new()))
        .context("Failed to install trace layer")?;

    if !quiet {
        println!("rp v{}", env!("CARGO_PKG_VERSION"));
        println!("seconds: {}", settings.duration.as_secs());
        for modality in Modality::ALL {
            if let Some(path) = settings.paths.path_for(modality) {
                println!("{modality}: {}", path.display());
            }
        }
    }

    let service = rp::start_profile(settings).await?;
    if !quiet {
        println!("trigger: curl 'http://127.0.0.1:{}/rp?mode=0'", service.local_addr().port());
    }

    let stop_workload = CancellationToken::new();
    let workload = args.workload.then(|| tokio::spawn(synthetic_workload(stop_workload.clone())));

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("interrupted, shutting down");

    stop_workload.cancel();
    if let Some(handle) = workload {
        if let Err(e) = handle.await {
            warn!("workload task failed: {e}");
        }
    }
    service.shutdown().await;
    Ok(())
}

/// Load for every collector: CPU burn, allocation churn, a contended lock and spans
async fn synthetic_workload(stop: CancellationToken) {
    let ledger = Arc::new(ContentionMutex::new(Vec::<u64>::new()));
    let mut workers = tokio::task::JoinSet::new();

    for worker in 0..4u64 {
        let ledger = Arc::clone(&ledger);
        let stop = stop.clone();
        workers.spawn_blocking(move || {
            let mut round = 0u64;
            while !stop.is_cancelled() {
                let _span = tracing::info_span!("workload_round", worker, round).entered();
                let checksum = burn_cpu(worker ^ round);
                let mut entries = ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                entries.push(checksum);
                if entries.len() > 4096 {
                    entries.clear();
                }
                std::thread::sleep(Duration::from_micros(200));
                drop(entries);
                round += 1;
            }
        });
    }

    while workers.join_next().await.is_some() {}
}

fn burn_cpu(seed: u64) -> u64 {
    let mut buffers: Vec<Vec<u64>> = Vec::with_capacity(16);
    let mut acc = seed;
    for i in 0..16u64 {
        let buffer: Vec<u64> = (0..256).map(|j| acc.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(i + j)).collect();
        acc = buffer.iter().fold(acc, |a, b| a.rotate_left(5) ^ b);
        buffers.push(buffer);
    }
    tracing::debug!(checksum = acc, "round finished");
    acc
}
