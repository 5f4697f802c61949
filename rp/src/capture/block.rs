//! Lock/block contention sampling
//!
//! Contended acquisitions are reported by [`ContentionMutex`] or by calling
//! [`record_blocking`] around any other wait. Nothing is recorded while the
//! block profile rate is zero; otherwise waits of at least `rate`
//! nanoseconds are aggregated per call site.
//!
//! Output uses the legacy text contention layout, with wait time in
//! nanoseconds:
//!
//! ```text
//! --- contention:
//! cycles/second=1000000000
//! 1830021 14 @ billing/src/ledger.rs:88
//! ```

use log::info;
use rp_common::{Modality, BLOCK_PROFILE_RATE};
use std::collections::BTreeMap;
use std::io::Write;
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LockResult, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use super::Collector;
use crate::domain::CaptureError;

static BLOCK_PROFILE_RATE_KNOB: AtomicU64 = AtomicU64::new(0);
static CONTENTION: Mutex<BTreeMap<String, SiteStats>> = Mutex::new(BTreeMap::new());

/// Aggregated waits at one call site
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SiteStats {
    pub count: u64,
    pub total_ns: u64,
}

/// Current block profile rate (minimum recorded wait in ns, 0 = off)
#[must_use]
pub fn block_profile_rate() -> u64 {
    BLOCK_PROFILE_RATE_KNOB.load(Ordering::Relaxed)
}

/// Set the block profile rate, returning the previous value
pub fn set_block_profile_rate(rate: u64) -> u64 {
    BLOCK_PROFILE_RATE_KNOB.swap(rate, Ordering::SeqCst)
}

/// Record a wait of `waited` at `site`
pub fn record_blocking(site: &str, waited: Duration) {
    let rate = block_profile_rate();
    if rate == 0 {
        return;
    }
    let waited_ns = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
    if waited_ns < rate {
        return;
    }
    let mut table = CONTENTION.lock().unwrap_or_else(PoisonError::into_inner);
    let stats = table.entry(site.to_string()).or_default();
    stats.count += 1;
    stats.total_ns = stats.total_ns.saturating_add(waited_ns);
}

/// Record a wait of `waited` attributed to the caller's source location
#[track_caller]
pub fn record_contention(waited: Duration) {
    if block_profile_rate() == 0 {
        return;
    }
    record_blocking(&site_name(Location::caller()), waited);
}

fn site_name(location: &Location<'_>) -> String {
    format!("{}:{}", location.file(), location.line())
}

fn take_contention() -> Vec<(String, SiteStats)> {
    let table = std::mem::take(&mut *CONTENTION.lock().unwrap_or_else(PoisonError::into_inner));
    let mut sites: Vec<_> = table.into_iter().collect();
    sites.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns).then_with(|| a.0.cmp(&b.0)));
    sites
}

/// `std::sync::Mutex` that reports contended acquisitions
///
/// Uncontended locks take the `try_lock` fast path and record nothing.
#[derive(Debug, Default)]
pub struct ContentionMutex<T> {
    inner: Mutex<T>,
}

impl<T> ContentionMutex<T> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    /// Acquire the lock, recording the wait against the caller when it blocks
    ///
    /// # Errors
    /// Returns the poisoned guard if another holder panicked
    #[track_caller]
    pub fn lock(&self) -> LockResult<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Err(poisoned),
            Err(TryLockError::WouldBlock) => {}
        }
        let location = Location::caller();
        let started = Instant::now();
        let guard = self.inner.lock();
        if block_profile_rate() > 0 {
            record_blocking(&site_name(location), started.elapsed());
        }
        guard
    }

    /// Consume the mutex, returning the value
    ///
    /// # Errors
    /// Returns the value wrapped in an error if the mutex is poisoned
    pub fn into_inner(self) -> LockResult<T> {
        self.inner.into_inner()
    }
}

/// Raises the block profile rate for the duration of a capture
pub struct BlockCollector {
    rate: u64,
    old: Option<u64>,
}

impl BlockCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate(BLOCK_PROFILE_RATE)
    }

    #[must_use]
    pub fn with_rate(rate: u64) -> Self {
        Self { rate: rate.max(1), old: None }
    }
}

impl Default for BlockCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for BlockCollector {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.old.is_some() {
            return Err(CaptureError::CollectorBusy(Modality::Block));
        }
        take_contention();
        self.old = Some(set_block_profile_rate(self.rate));
        Ok(())
    }

    fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
        let Some(old) = self.old.take() else {
            return Ok(());
        };
        set_block_profile_rate(old);

        let sites = take_contention();
        info!("block profile: {} contended sites", sites.len());

        let write = CaptureError::write(Modality::Block);
        writeln!(out, "--- contention:").map_err(write)?;
        writeln!(out, "cycles/second=1000000000").map_err(write)?;
        for (site, stats) in &sites {
            writeln!(out, "{} {} @ {site}", stats.total_ns, stats.count).map_err(write)?;
        }
        Ok(())
    }
}

impl Drop for BlockCollector {
    fn drop(&mut self) {
        if let Some(old) = self.old.take() {
            set_block_profile_rate(old);
        }
    }
}
