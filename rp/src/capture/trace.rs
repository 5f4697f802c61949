//! Execution event tracing
//!
//! [`TraceLayer`] plugs into the host's `tracing` subscriber and records span
//! enter/exit and events while the trace knob is on:
//!
//! ```rust,ignore
//! use tracing_subscriber::prelude::*;
//! tracing_subscriber::registry().with(rp::capture::trace::TraceLayer::new()).init();
//! ```
//!
//! Captures are written in Chrome Trace Event Format, readable by Perfetto,
//! Speedscope and `chrome://tracing`.
//! Format reference: <https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview>

use log::{info, warn};
use rp_common::Modality;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::{span, Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use super::Collector;
use crate::domain::{Artifact, CaptureError};

/// File written by [`do_trace`]
pub const DEFAULT_TRACE_FILE: &str = "./trace.out";

/// Events beyond this are counted and dropped
const MAX_TRACE_EVENTS: usize = 1 << 20;

static TRACE_ENABLED: AtomicBool = AtomicBool::new(false);
static TRACE_EVENTS: Mutex<Vec<ChromeTraceEvent>> = Mutex::new(Vec::new());
static DROPPED_EVENTS: AtomicU64 = AtomicU64::new(0);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);
static EPOCH: OnceLock<Instant> = OnceLock::new();

thread_local! {
    static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

/// Whether trace events are currently being recorded
#[must_use]
pub fn tracing_enabled() -> bool {
    TRACE_ENABLED.load(Ordering::Relaxed)
}

/// Chrome Trace Event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChromeTraceEvent {
    /// Span or event name
    pub name: String,
    /// `tracing` target, used for filtering/coloring
    pub cat: String,
    /// Phase: "B" = begin, "E" = end, "i" = instant
    pub ph: String,
    /// Timestamp in microseconds since the first recorded event of the process
    pub ts: f64,
    pub pid: u32,
    pub tid: u64,
    /// Instant event scope ("t" = thread)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize, Deserialize)]
pub struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    pub trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    pub display_time_unit: String,
}

fn record(name: &str, cat: &str, ph: &str, args: Option<HashMap<String, JsonValue>>) {
    let epoch = *EPOCH.get_or_init(Instant::now);
    let event = ChromeTraceEvent {
        name: name.to_string(),
        cat: cat.to_string(),
        ph: ph.to_string(),
        ts: epoch.elapsed().as_secs_f64() * 1_000_000.0,
        pid: std::process::id(),
        tid: TID.with(|tid| *tid),
        s: (ph == "i").then(|| "t".to_string()),
        args,
    };

    let mut events = TRACE_EVENTS.lock().unwrap_or_else(PoisonError::into_inner);
    if events.len() >= MAX_TRACE_EVENTS {
        DROPPED_EVENTS.fetch_add(1, Ordering::Relaxed);
        return;
    }
    events.push(event);
}

fn take_events() -> Vec<ChromeTraceEvent> {
    std::mem::take(&mut *TRACE_EVENTS.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Collects event fields into trace args
#[derive(Default)]
struct ArgsVisitor {
    message: Option<String>,
    args: HashMap<String, JsonValue>,
}

impl Visit for ArgsVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.args.insert(field.name().to_string(), JsonValue::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.args.insert(field.name().to_string(), JsonValue::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.args.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.args.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.args.insert(field.name().to_string(), value.into());
    }
}

/// `tracing` layer feeding the trace capture
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl TraceLayer {
    #[must_use]
    pub fn new() -> Self {
        TraceLayer
    }
}

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_enter(&self, id: &span::Id, ctx: Context<'_, S>) {
        if !tracing_enabled() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            record(span.name(), span.metadata().target(), "B", None);
        }
    }

    fn on_exit(&self, id: &span::Id, ctx: Context<'_, S>) {
        if !tracing_enabled() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            record(span.name(), span.metadata().target(), "E", None);
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !tracing_enabled() {
            return;
        }
        let mut visitor = ArgsVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let name = visitor.message.take().unwrap_or_else(|| metadata.name().to_string());
        visitor.args.insert("level".to_string(), JsonValue::String(metadata.level().to_string()));
        record(&name, metadata.target(), "i", Some(visitor.args));
    }
}

/// Turns the trace knob on for the duration of a capture
pub struct TraceCollector {
    active: bool,
}

impl TraceCollector {
    #[must_use]
    pub fn new() -> Self {
        Self { active: false }
    }
}

impl Default for TraceCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for TraceCollector {
    fn start(&mut self) -> Result<(), CaptureError> {
        if TRACE_ENABLED.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(CaptureError::CollectorBusy(Modality::Trace));
        }
        take_events();
        DROPPED_EVENTS.store(0, Ordering::Relaxed);
        self.active = true;
        Ok(())
    }

    fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
        if !self.active {
            return Ok(());
        }
        TRACE_ENABLED.store(false, Ordering::SeqCst);
        self.active = false;

        let trace = ChromeTrace { trace_events: take_events(), display_time_unit: "ms".to_string() };
        let dropped = DROPPED_EVENTS.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!("trace profile: dropped {dropped} events over the {MAX_TRACE_EVENTS} event limit");
        }
        info!("trace profile: {} events", trace.trace_events.len());

        serde_json::to_writer(&mut *out, &trace)?;
        out.flush().map_err(CaptureError::write(Modality::Trace))
    }
}

impl Drop for TraceCollector {
    fn drop(&mut self) {
        if self.active {
            TRACE_ENABLED.store(false, Ordering::SeqCst);
        }
    }
}

/// Ad-hoc trace to a file, outside the trigger endpoint
///
/// Finishes on [`TraceSession::finish`] or when dropped.
pub struct TraceSession {
    path: PathBuf,
    collector: TraceCollector,
    writer: Option<BufWriter<File>>,
}

impl TraceSession {
    /// Create `path` and start recording
    ///
    /// # Errors
    /// Returns an error if the file cannot be created or a trace capture is
    /// already running
    pub fn start(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|source| CaptureError::ArtifactCreate { modality: Modality::Trace, path: path.clone(), source })?;
        let mut collector = TraceCollector::new();
        collector.start()?;
        Ok(Self { path, collector, writer: Some(BufWriter::new(file)) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop recording, flush and close the file
    ///
    /// # Errors
    /// Returns an error if the trace cannot be written
    pub fn finish(mut self) -> Result<Artifact, CaptureError> {
        self.finish_inner()
    }

    fn finish_inner(&mut self) -> Result<Artifact, CaptureError> {
        let write = CaptureError::write(Modality::Trace);
        let mut writer = self.writer.take().ok_or_else(|| write(std::io::ErrorKind::NotConnected.into()))?;
        self.collector.stop(&mut writer)?;
        let file = writer.into_inner().map_err(|e| write(e.into_error()))?;
        let bytes = file.metadata().map_err(write)?.len();
        Ok(Artifact { modality: Modality::Trace, path: self.path.clone(), bytes })
    }
}

impl Drop for TraceSession {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.finish_inner() {
                warn!("error flushing {}: {e}", self.path.display());
            }
        }
    }
}

/// Start an ad-hoc trace into [`DEFAULT_TRACE_FILE`]
///
/// # Errors
/// Returns an error if the file cannot be created or a trace capture is
/// already running
pub fn do_trace() -> Result<TraceSession, CaptureError> {
    TraceSession::start(DEFAULT_TRACE_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing_subscriber::prelude::*;

    fn with_layer(f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(TraceLayer::new());
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    #[serial(trace)]
    fn test_records_spans_and_events_while_enabled() {
        let mut collector = TraceCollector::new();
        collector.start().unwrap();

        with_layer(|| {
            let span = tracing::info_span!("handle_request");
            let _entered = span.enter();
            tracing::info!(user = 7, "served");
        });

        let mut out = Vec::new();
        collector.stop(&mut out).unwrap();
        assert!(!tracing_enabled());

        let trace: ChromeTrace = serde_json::from_slice(&out).unwrap();
        assert_eq!(trace.display_time_unit, "ms");
        let phases: Vec<&str> = trace.trace_events.iter().map(|e| e.ph.as_str()).collect();
        assert_eq!(phases, vec!["B", "i", "E"]);
        assert_eq!(trace.trace_events[0].name, "handle_request");
        assert_eq!(trace.trace_events[1].name, "served");
        assert_eq!(trace.trace_events[1].args.as_ref().unwrap()["user"], 7);
    }

    #[test]
    #[serial(trace)]
    fn test_nothing_recorded_while_disabled() {
        with_layer(|| {
            tracing::info!("ignored");
        });
        let mut collector = TraceCollector::new();
        collector.start().unwrap();
        let mut out = Vec::new();
        collector.stop(&mut out).unwrap();
        let trace: ChromeTrace = serde_json::from_slice(&out).unwrap();
        assert!(trace.trace_events.is_empty());
    }

    #[test]
    #[serial(trace)]
    fn test_second_capture_refused_and_knob_released_on_drop() {
        let mut first = TraceCollector::new();
        first.start().unwrap();
        assert!(matches!(TraceCollector::new().start(), Err(CaptureError::CollectorBusy(Modality::Trace))));
        drop(first);
        assert!(!tracing_enabled());
    }

    #[test]
    #[serial(trace)]
    fn test_trace_session_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");
        let session = TraceSession::start(&path).unwrap();
        with_layer(|| {
            tracing::warn!("inside session");
        });
        let artifact = session.finish().unwrap();

        assert!(artifact.bytes > 0);
        let trace: ChromeTrace = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(trace.trace_events.len(), 1);
        assert!(!tracing_enabled());
    }

    #[test]
    #[serial(trace)]
    fn test_trace_session_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");
        drop(TraceSession::start(&path).unwrap());
        let trace: ChromeTrace = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(trace.trace_events.is_empty());
    }
}
