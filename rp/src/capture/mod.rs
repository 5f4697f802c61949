//! # Capture Tasks
//!
//! One task per modality. A task owns one output file and one enabled
//! collector for its lifetime:
//!
//! ```text
//! create file ─▶ collector.start() ─▶ wait on StopSource ─▶ collector.stop(file) ─▶ close ─▶ done
//! ```
//!
//! ## Submodules
//!
//! - `cpu`: signal-based stack sampling via `pprof`
//! - `memory`: sampling global allocator and heap profile writer
//! - `block`: contention recorder and instrumented mutex
//! - `trace`: `tracing` layer exporting Chrome Trace Event JSON
//!
//! Each collector toggles a process-global knob on `start` and puts the
//! previous value back on `stop`, and again on drop if the task never got
//! to stop (a cancelled or panicking task).

pub mod block;
pub mod cpu;
pub mod memory;
pub mod trace;

use log::{error, info, warn};
use rp_common::Modality;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::{Artifact, CaptureError};

/// Exit code used when an artifact cannot be created under [`ArtifactFailurePolicy::Abort`]
pub const EXIT_ARTIFACT_FAILURE: i32 = 74;

/// A runtime collection mechanism for one modality
pub trait Collector: Send {
    /// Enable collection
    ///
    /// # Errors
    /// Returns an error if the mechanism is unavailable or already held
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Disable collection and write what was gathered to `out`
    ///
    /// # Errors
    /// Returns an error if the samples cannot be encoded or written
    fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError>;
}

/// Builds the collector for a modality
pub type CollectorFactory = Arc<dyn Fn(Modality) -> Box<dyn Collector> + Send + Sync>;

/// The four real collectors
#[must_use]
pub fn default_collector(modality: Modality) -> Box<dyn Collector> {
    match modality {
        Modality::Cpu => Box::new(cpu::CpuCollector::new()),
        Modality::Memory => Box::new(memory::MemoryCollector::new()),
        Modality::Block => Box::new(block::BlockCollector::new()),
        Modality::Trace => Box::new(trace::TraceCollector::new()),
    }
}

/// What ends a running capture
///
/// Exactly one applies to a task: either a timer or an external signal.
#[derive(Debug, Clone)]
pub enum StopSource {
    /// Stop once the duration has elapsed
    After(Duration),
    /// Stop when the token is cancelled; there is no timeout
    Cancelled(CancellationToken),
}

impl StopSource {
    async fn wait(&self) {
        match self {
            StopSource::After(duration) => tokio::time::sleep(*duration).await,
            StopSource::Cancelled(token) => token.cancelled().await,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            StopSource::After(_) => "",
            StopSource::Cancelled(_) => "[context] ",
        }
    }
}

/// What to do when an output file cannot be created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactFailurePolicy {
    /// Log and terminate the process
    #[default]
    Abort,
    /// Report the modality as failed and let the others finish
    Skip,
}

/// Result of one task
#[derive(Debug)]
pub enum TaskOutcome {
    Written(Artifact),
    Skipped(Modality),
    Failed(Modality, CaptureError),
}

impl TaskOutcome {
    #[must_use]
    pub fn modality(&self) -> Modality {
        match self {
            TaskOutcome::Written(artifact) => artifact.modality,
            TaskOutcome::Skipped(modality) | TaskOutcome::Failed(modality, _) => *modality,
        }
    }

    #[must_use]
    pub fn artifact(&self) -> Option<&Artifact> {
        match self {
            TaskOutcome::Written(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// One modality's capture lifecycle
pub struct CaptureTask {
    modality: Modality,
    output: Option<PathBuf>,
    stop: StopSource,
    collector: Box<dyn Collector>,
    policy: ArtifactFailurePolicy,
}

impl CaptureTask {
    #[must_use]
    pub fn new(
        modality: Modality,
        output: Option<PathBuf>,
        stop: StopSource,
        collector: Box<dyn Collector>,
        policy: ArtifactFailurePolicy,
    ) -> Self {
        Self { modality, output, stop, collector, policy }
    }

    /// Run the capture to completion
    ///
    /// Without an output path the task is a no-op: no file, no knob.
    pub async fn run(self) -> TaskOutcome {
        let CaptureTask { modality, output, stop, mut collector, policy } = self;

        let Some(path) = output else {
            return TaskOutcome::Skipped(modality);
        };
        info!("{modality} profile : {}", path.display());

        let file = match File::create(&path) {
            Ok(file) => file,
            Err(source) => {
                let err = CaptureError::ArtifactCreate { modality, path, source };
                return artifact_failure(modality, err, policy);
            }
        };

        if let Err(e) = collector.start() {
            warn!("{e}");
            drop(file);
            if let Err(rm) = std::fs::remove_file(&path) {
                warn!("could not remove {}: {rm}", path.display());
            }
            return TaskOutcome::Failed(modality, e);
        }

        stop.wait().await;

        let label = stop.label();
        let finished = tokio::task::spawn_blocking(move || finish(modality, collector, file, path)).await;
        match finished {
            Ok(Ok(artifact)) => {
                info!("{label}{modality} profiling finish");
                TaskOutcome::Written(artifact)
            }
            Ok(Err(e)) => {
                error!("{label}{modality} profiling failed: {e}");
                TaskOutcome::Failed(modality, e)
            }
            Err(e) => {
                error!("{label}{modality} stop sequence panicked: {e}");
                TaskOutcome::Failed(modality, CaptureError::TaskPanicked(modality))
            }
        }
    }
}

/// Stop sequence: disable, write, flush, close
fn finish(
    modality: Modality,
    mut collector: Box<dyn Collector>,
    file: File,
    path: PathBuf,
) -> Result<Artifact, CaptureError> {
    let mut writer = BufWriter::new(file);
    let stopped = collector.stop(&mut writer);
    // Knob is restored by stop(); dropping here also covers the error path
    drop(collector);
    stopped?;

    let file = writer.into_inner().map_err(|e| CaptureError::ArtifactWrite { modality, source: e.into_error() })?;
    file.sync_all().map_err(CaptureError::write(modality))?;
    let bytes = file.metadata().map_err(CaptureError::write(modality))?.len();
    drop(file);

    Ok(Artifact { modality, path, bytes })
}

fn artifact_failure(modality: Modality, err: CaptureError, policy: ArtifactFailurePolicy) -> TaskOutcome {
    match policy {
        ArtifactFailurePolicy::Abort => {
            error!("profile: {err}");
            std::process::exit(EXIT_ARTIFACT_FAILURE);
        }
        ArtifactFailurePolicy::Skip => {
            warn!("profile: {err}; skipping {modality}");
            TaskOutcome::Failed(modality, err)
        }
    }
}
