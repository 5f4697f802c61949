//! Heap allocation sampling
//!
//! Rust has no runtime heap profiler to switch on, so the host installs
//! [`SamplingAllocator`] as its global allocator:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static ALLOC: rp::capture::memory::SamplingAllocator = rp::capture::memory::SamplingAllocator::system();
//! ```
//!
//! While the profile rate knob is non-zero every allocation and free is
//! counted per power-of-two size class, and one allocation per `rate` bytes
//! is counted as a sample. With the knob at zero the allocator adds a single
//! relaxed load per call.
//!
//! Output uses the legacy text heap profile layout:
//!
//! ```text
//! heap profile: 12: 4096 [40: 9216] @ heap/4096
//! 10: 320 [30: 960] @ size<=32
//! 2: 3776 [10: 8256] @ size<=2048
//!
//! # samples: 2
//! # allocator installed: true
//! ```

use log::{info, warn};
use rp_common::{Modality, MEM_PROFILE_RATE};
use std::alloc::{GlobalAlloc, Layout, System};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use super::Collector;
use crate::domain::CaptureError;

/// Size classes cover allocations up to 2^47 bytes
const SIZE_CLASSES: usize = 48;

static MEM_PROFILE_RATE_KNOB: AtomicUsize = AtomicUsize::new(0);
static SAMPLE_ACCUMULATOR: AtomicUsize = AtomicUsize::new(0);
static INSTALLED: AtomicBool = AtomicBool::new(false);

struct SizeClass {
    allocs: AtomicU64,
    alloc_bytes: AtomicU64,
    frees: AtomicU64,
    free_bytes: AtomicU64,
    samples: AtomicU64,
}

impl SizeClass {
    const fn new() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            free_bytes: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    fn reset(&self) {
        self.allocs.store(0, Ordering::Relaxed);
        self.alloc_bytes.store(0, Ordering::Relaxed);
        self.frees.store(0, Ordering::Relaxed);
        self.free_bytes.store(0, Ordering::Relaxed);
        self.samples.store(0, Ordering::Relaxed);
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_CLASS: SizeClass = SizeClass::new();
static CLASSES: [SizeClass; SIZE_CLASSES] = [EMPTY_CLASS; SIZE_CLASSES];

/// Current heap profile rate (bytes between samples, 0 = off)
#[must_use]
pub fn mem_profile_rate() -> usize {
    MEM_PROFILE_RATE_KNOB.load(Ordering::Relaxed)
}

/// Set the heap profile rate, returning the previous value
pub fn set_mem_profile_rate(rate: usize) -> usize {
    MEM_PROFILE_RATE_KNOB.swap(rate, Ordering::SeqCst)
}

/// Whether a [`SamplingAllocator`] has served at least one allocation
#[must_use]
pub fn allocator_installed() -> bool {
    INSTALLED.load(Ordering::Relaxed)
}

fn size_class(size: usize) -> usize {
    let bits = usize::BITS - size.saturating_sub(1).leading_zeros();
    (bits as usize).min(SIZE_CLASSES - 1)
}

pub(crate) fn record_alloc(size: usize) {
    let rate = MEM_PROFILE_RATE_KNOB.load(Ordering::Relaxed);
    if rate == 0 {
        return;
    }
    let class = &CLASSES[size_class(size)];
    class.allocs.fetch_add(1, Ordering::Relaxed);
    class.alloc_bytes.fetch_add(size as u64, Ordering::Relaxed);

    let before = SAMPLE_ACCUMULATOR.fetch_add(size, Ordering::Relaxed);
    if before % rate + size >= rate {
        class.samples.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) fn record_free(size: usize) {
    if MEM_PROFILE_RATE_KNOB.load(Ordering::Relaxed) == 0 {
        return;
    }
    let class = &CLASSES[size_class(size)];
    class.frees.fetch_add(1, Ordering::Relaxed);
    class.free_bytes.fetch_add(size as u64, Ordering::Relaxed);
}

fn reset_counters() {
    SAMPLE_ACCUMULATOR.store(0, Ordering::Relaxed);
    for class in &CLASSES {
        class.reset();
    }
}

/// Global allocator wrapper feeding the heap profile
pub struct SamplingAllocator<A = System> {
    inner: A,
}

impl SamplingAllocator<System> {
    #[must_use]
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> SamplingAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

// SAFETY: every call is forwarded unchanged to the wrapped allocator; the
// bookkeeping only touches atomics and never allocates.
#[allow(unsafe_code)]
unsafe impl<A: GlobalAlloc> GlobalAlloc for SamplingAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            mark_installed();
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            mark_installed();
            record_alloc(layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner.dealloc(ptr, layout);
        record_free(layout.size());
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = self.inner.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            record_free(layout.size());
            record_alloc(new_size);
        }
        new_ptr
    }
}

fn mark_installed() {
    if !INSTALLED.load(Ordering::Relaxed) {
        INSTALLED.store(true, Ordering::Relaxed);
    }
}

/// Per size class totals since the capture started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassStats {
    pub upper_bound: u64,
    pub allocs: u64,
    pub alloc_bytes: u64,
    pub frees: u64,
    pub free_bytes: u64,
    pub samples: u64,
}

impl ClassStats {
    #[must_use]
    pub fn inuse_objects(&self) -> u64 {
        self.allocs.saturating_sub(self.frees)
    }

    #[must_use]
    pub fn inuse_bytes(&self) -> u64 {
        self.alloc_bytes.saturating_sub(self.free_bytes)
    }
}

/// Point-in-time copy of the allocation counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapProfile {
    pub rate: usize,
    pub classes: Vec<ClassStats>,
    pub installed: bool,
}

impl HeapProfile {
    /// Copy the counters for every size class that saw traffic
    #[must_use]
    pub fn snapshot(rate: usize) -> Self {
        let classes = CLASSES
            .iter()
            .enumerate()
            .map(|(i, class)| ClassStats {
                upper_bound: 1u64 << i,
                allocs: class.allocs.load(Ordering::Relaxed),
                alloc_bytes: class.alloc_bytes.load(Ordering::Relaxed),
                frees: class.frees.load(Ordering::Relaxed),
                free_bytes: class.free_bytes.load(Ordering::Relaxed),
                samples: class.samples.load(Ordering::Relaxed),
            })
            .filter(|stats| stats.allocs > 0 || stats.frees > 0)
            .collect();
        Self { rate, classes, installed: allocator_installed() }
    }

    #[must_use]
    pub fn samples(&self) -> u64 {
        self.classes.iter().map(|c| c.samples).sum()
    }

    /// Write in the legacy text heap profile layout
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn write_to(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let sum = |f: fn(&ClassStats) -> u64| self.classes.iter().map(f).sum::<u64>();
        writeln!(
            out,
            "heap profile: {}: {} [{}: {}] @ heap/{}",
            sum(ClassStats::inuse_objects),
            sum(ClassStats::inuse_bytes),
            sum(|c| c.allocs),
            sum(|c| c.alloc_bytes),
            self.rate
        )?;
        for class in &self.classes {
            writeln!(
                out,
                "{}: {} [{}: {}] @ size<={}",
                class.inuse_objects(),
                class.inuse_bytes(),
                class.allocs,
                class.alloc_bytes,
                class.upper_bound
            )?;
        }
        writeln!(out)?;
        writeln!(out, "# samples: {}", self.samples())?;
        writeln!(out, "# allocator installed: {}", self.installed)
    }
}

/// Raises the heap profile rate for the duration of a capture
pub struct MemoryCollector {
    rate: usize,
    old: Option<usize>,
}

impl MemoryCollector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_rate(MEM_PROFILE_RATE)
    }

    #[must_use]
    pub fn with_rate(rate: usize) -> Self {
        Self { rate: rate.max(1), old: None }
    }
}

impl Default for MemoryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector for MemoryCollector {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.old.is_some() {
            return Err(CaptureError::CollectorBusy(Modality::Memory));
        }
        reset_counters();
        self.old = Some(set_mem_profile_rate(self.rate));
        if !allocator_installed() {
            warn!("SamplingAllocator is not the global allocator; the heap profile will be empty");
        }
        Ok(())
    }

    fn stop(&mut self, out: &mut dyn Write) -> Result<(), CaptureError> {
        let Some(old) = self.old.take() else {
            return Ok(());
        };
        set_mem_profile_rate(old);

        let profile = HeapProfile::snapshot(self.rate);
        info!("memory profile: {} samples in {} size classes", profile.samples(), profile.classes.len());
        profile.write_to(out).map_err(CaptureError::write(Modality::Memory))
    }
}

impl Drop for MemoryCollector {
    fn drop(&mut self) {
        if let Some(old) = self.old.take() {
            set_mem_profile_rate(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_size_classes() {
        assert_eq!(size_class(0), 0);
        assert_eq!(size_class(1), 0);
        assert_eq!(size_class(2), 1);
        assert_eq!(size_class(32), 5);
        assert_eq!(size_class(33), 6);
        assert_eq!(size_class(usize::MAX), SIZE_CLASSES - 1);
    }

    #[test]
    #[serial(memory)]
    fn test_rate_restored_after_stop() {
        set_mem_profile_rate(0);
        let mut collector = MemoryCollector::new();
        collector.start().unwrap();
        assert_eq!(mem_profile_rate(), MEM_PROFILE_RATE);

        collector.stop(&mut Vec::new()).unwrap();
        assert_eq!(mem_profile_rate(), 0);
    }

    #[test]
    #[serial(memory)]
    fn test_rate_restored_on_drop() {
        set_mem_profile_rate(7);
        {
            let mut collector = MemoryCollector::new();
            collector.start().unwrap();
            assert_eq!(mem_profile_rate(), MEM_PROFILE_RATE);
        }
        assert_eq!(mem_profile_rate(), 7);
        set_mem_profile_rate(0);
    }

    #[test]
    #[serial(memory)]
    fn test_profile_counts_recorded_traffic() {
        set_mem_profile_rate(0);
        let mut collector = MemoryCollector::with_rate(64);
        collector.start().unwrap();

        for _ in 0..4 {
            record_alloc(32);
        }
        record_free(32);
        record_alloc(1000);

        let mut out = Vec::new();
        collector.stop(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        // Other tests' traffic never reaches the counters: the knob was off for them
        assert!(text.starts_with("heap profile: 4: 1096 [5: 1128] @ heap/64\n"), "{text}");
        assert!(text.contains("3: 96 [4: 128] @ size<=32"));
        assert!(text.contains("1: 1000 [1: 1000] @ size<=1024"));
        assert!(text.contains("# samples: 3"));

        // Off again: nothing more is counted
        record_alloc(32);
        assert_eq!(HeapProfile::snapshot(64).classes.iter().map(|c| c.allocs).sum::<u64>(), 5);
    }
}
