//! # Capture Coordinator
//!
//! Single-flight gate plus fan-out/fan-in over the four capture tasks.
//!
//! ```text
//!            trigger()                       all tasks joined
//!   Idle ──────────────▶ Capturing ──────────────────────────▶ Idle
//!     ▲   CAS false→true      │  cpu | mem | block | trace
//!     │                       │  (unrequested = no-op)
//!     └── AlreadyRunning ◀────┘  second trigger while capturing
//! ```
//!
//! The gate is an explicit field of one `Coordinator`; the HTTP layer holds
//! an `Arc` to it. The fan-out runs as a detached job that owns the
//! in-flight guard, so a caller that stops waiting (client disconnect) does
//! not reopen the gate while tasks are still writing.

use log::{error, info};
use rp_common::{Modality, ModeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::capture::{
    default_collector, ArtifactFailurePolicy, CaptureTask, CollectorFactory, StopSource, TaskOutcome,
};
use crate::domain::{Artifact, ArtifactPaths, CaptureError, ProfileSettings};

/// One trigger's worth of work
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub modes: ModeSet,
    /// Overrides the coordinator's stop source for this trigger only
    pub stop: Option<StopSource>,
}

impl CaptureRequest {
    #[must_use]
    pub fn new(modes: ModeSet) -> Self {
        Self { modes, stop: None }
    }

    /// Stop this capture after `duration` instead of the configured stop source
    #[must_use]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.stop = Some(StopSource::After(duration));
        self
    }

    /// Stop this capture when `token` is cancelled instead of the configured stop source
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.stop = Some(StopSource::Cancelled(token));
        self
    }
}

/// Outcomes of every task of one trigger
#[derive(Debug, Default)]
pub struct CaptureReport {
    pub outcomes: Vec<TaskOutcome>,
}

impl CaptureReport {
    /// Artifacts written by this trigger
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.outcomes.iter().filter_map(TaskOutcome::artifact)
    }

    /// Modalities that were requested but produced no artifact
    pub fn failures(&self) -> impl Iterator<Item = (Modality, &CaptureError)> {
        self.outcomes.iter().filter_map(|outcome| match outcome {
            TaskOutcome::Failed(modality, err) => Some((*modality, err)),
            _ => None,
        })
    }
}

/// Result of [`Coordinator::trigger`]
#[derive(Debug)]
pub enum TriggerOutcome {
    Finished(CaptureReport),
    AlreadyRunning,
}

impl TriggerOutcome {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, TriggerOutcome::Finished(_))
    }
}

/// "Capture in progress" flag
#[derive(Debug, Default)]
struct CaptureGate {
    busy: AtomicBool,
}

/// Holds the gate closed; reopens it on drop, including on panic
struct InFlightGuard {
    gate: Arc<CaptureGate>,
}

impl InFlightGuard {
    fn acquire(gate: &Arc<CaptureGate>) -> Option<Self> {
        gate.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).ok()?;
        gate.busy.store(true, Ordering::SeqCst);
        Some(Self { gate: Arc::clone(gate) })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::SeqCst);
    }
}

/// Owns the gate and the capture plan of one process
pub struct Coordinator {
    gate: Arc<CaptureGate>,
    paths: ArtifactPaths,
    stop: StopSource,
    policy: ArtifactFailurePolicy,
    collectors: CollectorFactory,
}

impl Coordinator {
    /// Coordinator writing to `paths`, stopping every capture with `stop`
    #[must_use]
    pub fn new(paths: ArtifactPaths, stop: StopSource) -> Self {
        Self {
            gate: Arc::default(),
            paths,
            stop,
            policy: ArtifactFailurePolicy::default(),
            collectors: Arc::new(default_collector),
        }
    }

    /// Duration-mode coordinator for resolved settings
    #[must_use]
    pub fn from_settings(settings: &ProfileSettings) -> Self {
        Self::new(settings.paths.clone(), StopSource::After(settings.duration))
    }

    #[must_use]
    pub fn with_failure_policy(mut self, policy: ArtifactFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the collectors (the default builds the four real ones)
    #[must_use]
    pub fn with_collectors(mut self, collectors: CollectorFactory) -> Self {
        self.collectors = collectors;
        self
    }

    #[must_use]
    pub fn paths(&self) -> &ArtifactPaths {
        &self.paths
    }

    /// Whether a trigger is in flight
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.gate.busy.load(Ordering::SeqCst)
    }

    /// Run one capture, or refuse immediately if one is in flight
    ///
    /// Every modality gets a task; unrequested ones have no output path and
    /// finish at once, so the join is the same whatever was requested.
    pub async fn trigger(&self, request: CaptureRequest) -> TriggerOutcome {
        let Some(guard) = InFlightGuard::acquire(&self.gate) else {
            info!("profile already called");
            return TriggerOutcome::AlreadyRunning;
        };
        info!("debug mode = {}", request.modes);

        let stop = request.stop.unwrap_or_else(|| self.stop.clone());
        let mut tasks = JoinSet::new();
        for modality in Modality::ALL {
            let output = if request.modes.contains(modality) {
                self.paths.path_for(modality).map(ToOwned::to_owned)
            } else {
                None
            };
            let collector = (self.collectors)(modality);
            let task = CaptureTask::new(modality, output, stop.clone(), collector, self.policy);
            tasks.spawn(task.run());
        }

        let job = tokio::spawn(async move {
            let _guard = guard;
            let mut report = CaptureReport::default();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(outcome) => report.outcomes.push(outcome),
                    Err(e) => error!("capture task failed to join: {e}"),
                }
            }
            report.outcomes.sort_by_key(TaskOutcome::modality);
            report
        });

        match job.await {
            Ok(report) => {
                info!("profile task done !");
                TriggerOutcome::Finished(report)
            }
            Err(e) => {
                error!("profile job failed: {e}");
                TriggerOutcome::Finished(CaptureReport::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Collector;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Knobs {
        enabled: [AtomicUsize; 4],
        starts: AtomicUsize,
    }

    struct FakeCollector {
        modality: Modality,
        knobs: Arc<Knobs>,
        on: bool,
    }

    impl Collector for FakeCollector {
        fn start(&mut self) -> Result<(), CaptureError> {
            self.knobs.enabled[(self.modality.code() - 1) as usize].fetch_add(1, Ordering::SeqCst);
            self.knobs.starts.fetch_add(1, Ordering::SeqCst);
            self.on = true;
            Ok(())
        }

        fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
            self.knobs.enabled[(self.modality.code() - 1) as usize].fetch_sub(1, Ordering::SeqCst);
            self.on = false;
            writeln!(out, "{} samples", self.modality).map_err(CaptureError::write(self.modality))
        }
    }

    impl Drop for FakeCollector {
        fn drop(&mut self) {
            if self.on {
                self.knobs.enabled[(self.modality.code() - 1) as usize].fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn coordinator(dir: &Path, stop: StopSource) -> (Arc<Coordinator>, Arc<Knobs>) {
        let knobs = Arc::new(Knobs::default());
        let factory_knobs = Arc::clone(&knobs);
        let coordinator = Coordinator::new(ArtifactPaths::in_working_dir(dir), stop)
            .with_failure_policy(ArtifactFailurePolicy::Skip)
            .with_collectors(Arc::new(move |modality| {
                Box::new(FakeCollector { modality, knobs: Arc::clone(&factory_knobs), on: false })
                    as Box<dyn Collector>
            }));
        (Arc::new(coordinator), knobs)
    }

    #[tokio::test]
    async fn test_fan_out_writes_requested_modalities_only() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, knobs) = coordinator(dir.path(), StopSource::After(Duration::from_millis(50)));

        let outcome = coordinator.trigger(CaptureRequest::new(ModeSet::parse("1,2"))).await;
        let TriggerOutcome::Finished(report) = outcome else { panic!("expected finished") };

        let written: Vec<Modality> = report.artifacts().map(|a| a.modality).collect();
        assert_eq!(written, vec![Modality::Cpu, Modality::Memory]);
        assert_eq!(report.outcomes.len(), 4);
        assert!(dir.path().join("debug_profile.cpu").exists());
        assert!(dir.path().join("debug_profile.mem").exists());
        assert!(!dir.path().join("debug_profile.block").exists());
        assert_eq!(knobs.starts.load(Ordering::SeqCst), 2);
        assert!(knobs.enabled.iter().all(|k| k.load(Ordering::SeqCst) == 0));
        assert!(!coordinator.is_capturing());
    }

    #[tokio::test]
    async fn test_empty_mode_set_still_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, knobs) = coordinator(dir.path(), StopSource::After(Duration::from_secs(3600)));

        let outcome = coordinator.trigger(CaptureRequest::new(ModeSet::parse("garbage"))).await;
        let TriggerOutcome::Finished(report) = outcome else { panic!("expected finished") };
        assert_eq!(report.artifacts().count(), 0);
        assert_eq!(knobs.starts.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_triggers_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (coordinator, knobs) = coordinator(dir.path(), StopSource::Cancelled(token.clone()));

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.trigger(CaptureRequest::new(ModeSet::all())).await })
        };
        while !coordinator.is_capturing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut rejected = JoinSet::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            rejected.spawn(async move { coordinator.trigger(CaptureRequest::new(ModeSet::all())).await });
        }
        while let Some(outcome) = rejected.join_next().await {
            assert!(matches!(outcome.unwrap(), TriggerOutcome::AlreadyRunning));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(knobs.starts.load(Ordering::SeqCst), 4, "rejected triggers start nothing");
        assert!(!first.is_finished(), "cancellation mode has no timeout");

        token.cancel();
        assert!(first.await.unwrap().is_finished());
        assert!(!coordinator.is_capturing());
    }

    #[tokio::test]
    async fn test_gate_stays_closed_when_caller_drops() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancellationToken::new();
        let (coordinator, knobs) = coordinator(dir.path(), StopSource::Cancelled(token.clone()));

        let caller = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.trigger(CaptureRequest::new(ModeSet::parse("3"))).await })
        };
        while !coordinator.is_capturing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        caller.abort();
        let _ = caller.await;
        assert!(coordinator.is_capturing(), "tasks are still running");

        token.cancel();
        while coordinator.is_capturing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dir.path().join("debug_profile.block").exists());
        assert!(knobs.enabled.iter().all(|k| k.load(Ordering::SeqCst) == 0));
    }

    #[tokio::test]
    async fn test_request_stop_overrides_configured_source() {
        let dir = tempfile::tempdir().unwrap();
        let (coordinator, _knobs) = coordinator(dir.path(), StopSource::After(Duration::from_secs(3600)));

        let request = CaptureRequest::new(ModeSet::parse("4")).with_duration(Duration::from_millis(20));
        let outcome = tokio::time::timeout(Duration::from_secs(10), coordinator.trigger(request)).await.unwrap();
        assert!(outcome.is_finished());
    }

    #[tokio::test]
    async fn test_unwritable_artifact_reported_under_skip_policy() {
        let (coordinator, _knobs) =
            coordinator(Path::new("/nonexistent/rp"), StopSource::After(Duration::from_millis(10)));

        let TriggerOutcome::Finished(report) = coordinator.trigger(CaptureRequest::new(ModeSet::parse("1"))).await
        else {
            panic!("expected finished")
        };
        let failures: Vec<Modality> = report.failures().map(|(m, _)| m).collect();
        assert_eq!(failures, vec![Modality::Cpu]);
    }
}
