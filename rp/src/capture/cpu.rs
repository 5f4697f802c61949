//! CPU sampling
//!
//! Uses `pprof`'s `SIGPROF` timer. Only one profiler can run per process, so
//! a second start (from anywhere in the process) is refused as busy.
//!
//! Output is collapsed stacks, one line per unique stack, root first:
//!
//! ```text
//! # cpu profile: 412 samples @ 100 Hz over 30.001s
//! tokio-runtime-w;tokio::runtime::task::harness::poll;my_app::handler 37
//! ```

use log::info;
use pprof::{ProfilerGuard, ProfilerGuardBuilder};
use rp_common::{Modality, CPU_SAMPLE_HZ};
use std::io::Write;
use std::time::Instant;

use super::Collector;
use crate::domain::CaptureError;

/// Frames from these libraries are skipped while unwinding
const BLOCKLIST: [&str; 4] = ["libc", "libgcc", "pthread", "vdso"];

pub struct CpuCollector {
    frequency: i32,
    guard: Option<ProfilerGuard<'static>>,
    started: Option<Instant>,
}

impl CpuCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_frequency(CPU_SAMPLE_HZ)
    }

    #[must_use]
    pub fn with_frequency(frequency: i32) -> Self {
        Self { frequency, guard: None, started: None }
    }
}

impl Default for CpuCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for CpuCollector {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.guard.is_some() {
            return Err(CaptureError::CollectorBusy(Modality::Cpu));
        }
        let guard = ProfilerGuardBuilder::default()
            .frequency(self.frequency)
            .blocklist(&BLOCKLIST)
            .build()
            .map_err(|e| CaptureError::CollectorFailed { modality: Modality::Cpu, reason: e.to_string() })?;
        self.guard = Some(guard);
        self.started = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
        let Some(guard) = self.guard.take() else {
            return Ok(());
        };
        let elapsed = self.started.take().map(|t| t.elapsed()).unwrap_or_default();

        // The report has to be built while the guard is alive; dropping it resets the samples
        let report = guard.report().build();
        drop(guard);
        let report = report
            .map_err(|e| CaptureError::CollectorFailed { modality: Modality::Cpu, reason: e.to_string() })?;

        let mut stacks: Vec<(String, isize)> = report
            .data
            .iter()
            .map(|(frames, count)| {
                let mut line = frames.thread_name.clone();
                for symbol in frames.frames.iter().rev().flat_map(|inlined| inlined.iter().rev()) {
                    line.push(';');
                    line.push_str(&symbol.name());
                }
                (line, *count)
            })
            .collect();
        stacks.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let samples: isize = stacks.iter().map(|(_, count)| count).sum();
        info!("cpu profile: {samples} samples in {} stacks", stacks.len());

        let write = CaptureError::write(Modality::Cpu);
        writeln!(
            out,
            "# cpu profile: {samples} samples @ {} Hz over {:.3}s",
            self.frequency,
            elapsed.as_secs_f64()
        )
        .map_err(write)?;
        for (stack, count) in &stacks {
            writeln!(out, "{stack} {count}").map_err(write)?;
        }
        Ok(())
    }
}
