//! # rp - On-Demand Remote Profile Capture
//!
//! rp embeds a small HTTP endpoint in a long-running service. Hitting it
//! captures CPU, heap, contention and trace snapshots for a bounded window
//! and writes one file per snapshot kind, without restarting the process.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Host Service                             │
//! │   debug_profile(&config) / start_profile(settings)           │
//! └───────────────────────┬──────────────────────────────────────┘
//!                         │ caller path + module table
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  config::resolve  →  ProfileSettings (port, paths, duration) │
//! └───────────────────────┬──────────────────────────────────────┘
//!                         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  service (axum)   GET /rp?mode=1,2                           │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  Coordinator ── single-flight gate ──▶ AlreadyRunning        │
//! │        │ fan-out                                             │
//! │   ┌────┴─────┬──────────┬──────────┐                         │
//! │   ▼          ▼          ▼          ▼                         │
//! │  cpu        mem       block      trace    (CaptureTask each) │
//! │ (pprof) (allocator) (mutex)  (tracing layer)                 │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`config`]: module table loading and caller-keyed resolution
//! - [`capture`]: the four collectors and the per-modality task lifecycle
//! - [`coordinator`]: single-flight gate, fan-out and join
//! - [`service`]: trigger endpoint and library entry points
//! - [`domain`]: settings, artifacts and error types
//! - [`cli`], [`preflight`]: the `rp` binary
//!
//! ## Host Integration
//!
//! Memory and block captures only see what is routed through rp:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: rp::capture::memory::SamplingAllocator = rp::capture::memory::SamplingAllocator::system();
//!
//! static LEDGER: rp::capture::block::ContentionMutex<Vec<u64>> = rp::capture::block::ContentionMutex::new(Vec::new());
//!
//! let service = rp::debug_profile(&rp::config::load_config_file("rp.json")?).await?;
//! ```
//!
//! Trace captures need [`capture::trace::TraceLayer`] in the host's
//! `tracing` subscriber.

pub mod capture;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod preflight;
pub mod service;

pub use capture::trace::do_trace;
pub use coordinator::{CaptureReport, CaptureRequest, Coordinator, TriggerOutcome};
pub use service::{start_profile, start_profile_with_cancel, ProfileService};

use std::future::Future;
use std::panic::Location;

use config::{PortFallback, SetupConfig};
use domain::ServiceError;

/// Start the profile service with settings resolved for the calling module
///
/// The caller is the source file of this call site. Resolution happens
/// before the returned future is first polled.
#[track_caller]
pub fn debug_profile(config: &SetupConfig) -> impl Future<Output = Result<ProfileService, ServiceError>> + Send + 'static {
    let caller = config::caller_source_path(Location::caller().file());
    let settings = config::resolve(&caller, config, PortFallback::default());
    start_profile(settings)
}
