//! # Shared Vocabulary (Service ↔ Clients)
//!
//! Defines the modality codes, mode selector parsing and wire-level constants
//! shared between the profile service and anything that triggers it. Kept
//! dependency-free so a trigger client can depend on it without pulling in
//! the capture stack.
//!
//! ## Key Types
//!
//! - [`Modality`] - One kind of runtime snapshot (CPU, memory, block, trace)
//! - [`ModeSet`] - Set of modalities parsed from a `mode=` selector list

#![cfg_attr(not(test), no_std)]

use core::fmt;

// ============================================================================
// Mode Selector Codes
// ============================================================================

/// Selector meaning "every modality"
pub const MODE_ALL: u32 = 0;

/// CPU sampling
pub const MODE_CPU: u32 = 1;

/// Heap allocation sampling
pub const MODE_MEMORY: u32 = 2;

/// Lock/block contention sampling
pub const MODE_BLOCK: u32 = 3;

/// Execution event tracing
pub const MODE_TRACE: u32 = 4;

// ============================================================================
// Service Defaults
// ============================================================================

/// Port used when no module entry matches the caller
pub const DEFAULT_PROFILE_PORT: u16 = 10029;

/// Inclusive lower bound for randomly assigned ports
pub const RANDOM_PORT_MIN: u16 = 7000;

/// Exclusive upper bound for randomly assigned ports
pub const RANDOM_PORT_MAX: u16 = 9999;

/// Capture duration used when no module entry sets one
pub const DEFAULT_PROFILE_SECONDS: u64 = 30;

/// Bytes between recorded heap samples while a memory capture runs
pub const MEM_PROFILE_RATE: usize = 4096;

/// Block profile threshold in nanoseconds while a block capture runs (1 = every event)
pub const BLOCK_PROFILE_RATE: u64 = 1;

/// CPU sampling frequency
pub const CPU_SAMPLE_HZ: i32 = 100;

// ============================================================================
// HTTP Contract
// ============================================================================

/// Path of the trigger endpoint
pub const TRIGGER_PATH: &str = "/rp";

/// Query parameter carrying the mode selector list
pub const MODE_PARAM: &str = "mode";

/// Response body after every requested capture finished
pub const BODY_FINISHED: &str = "profile finish";

/// Response body when a capture is already in flight
pub const BODY_ALREADY_RUNNING: &str = "profile service already called";

/// Response body for any path other than [`TRIGGER_PATH`]
pub const BODY_NOT_FOUND: &str = "404 page not found";

// ============================================================================
// Modality
// ============================================================================

/// One kind of runtime diagnostic snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Modality {
    Cpu,
    Memory,
    Block,
    Trace,
}

impl Modality {
    /// Every modality, in fan-out order
    pub const ALL: [Modality; 4] = [Modality::Cpu, Modality::Memory, Modality::Block, Modality::Trace];

    /// Wire code used in `mode=` selectors
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Modality::Cpu => MODE_CPU,
            Modality::Memory => MODE_MEMORY,
            Modality::Block => MODE_BLOCK,
            Modality::Trace => MODE_TRACE,
        }
    }

    /// Map a wire code back to a modality (`MODE_ALL` is not a single modality)
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            MODE_CPU => Some(Modality::Cpu),
            MODE_MEMORY => Some(Modality::Memory),
            MODE_BLOCK => Some(Modality::Block),
            MODE_TRACE => Some(Modality::Trace),
            _ => None,
        }
    }

    /// Short name used in artifact file names
    #[must_use]
    pub const fn short_name(self) -> &'static str {
        match self {
            Modality::Cpu => "cpu",
            Modality::Memory => "mem",
            Modality::Block => "block",
            Modality::Trace => "trace",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self.code() - 1)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ============================================================================
// ModeSet
// ============================================================================

/// Set of requested modalities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ModeSet(u8);

impl ModeSet {
    /// The empty set
    #[must_use]
    pub const fn empty() -> Self {
        ModeSet(0)
    }

    /// Every modality
    #[must_use]
    pub const fn all() -> Self {
        ModeSet(0b1111)
    }

    /// Parse a comma separated selector list such as `"1,2"` or `"0"`.
    ///
    /// Selectors that are not a known code are skipped; they never prevent
    /// the valid selectors of the same list from taking effect.
    #[must_use]
    pub fn parse(selectors: &str) -> Self {
        let mut set = ModeSet::empty();
        for selector in selectors.split(',') {
            let Ok(code) = selector.trim().parse::<u32>() else {
                continue;
            };
            if code == MODE_ALL {
                set = ModeSet::all();
            } else if let Some(modality) = Modality::from_code(code) {
                set.insert(modality);
            }
        }
        set
    }

    pub fn insert(&mut self, modality: Modality) {
        self.0 |= modality.bit();
    }

    #[must_use]
    pub const fn contains(self, modality: Modality) -> bool {
        self.0 & modality.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Requested modalities in fan-out order
    pub fn iter(self) -> impl Iterator<Item = Modality> {
        Modality::ALL.into_iter().filter(move |m| self.contains(*m))
    }
}

impl FromIterator<Modality> for ModeSet {
    fn from_iter<I: IntoIterator<Item = Modality>>(iter: I) -> Self {
        let mut set = ModeSet::empty();
        for modality in iter {
            set.insert(modality);
        }
        set
    }
}

impl fmt::Display for ModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, modality) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{modality}")?;
        }
        f.write_str("]")
    }
}
