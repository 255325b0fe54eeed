//! Cross-cutting state the coordinator publishes and every mutator
//! reads: the allocation epoch, the marking window flag, and a handful
//! of counters.

use atomic::Ordering;
use enum_map::EnumMap;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize};

use crate::policy::size_class::SizeGroup;
use crate::util::constants::EPOCH_MODULO;

#[derive(Default)]
pub struct GlobalState {
    /// Whether `init` has run and `shutdown` has not.
    pub initialized: AtomicBool,
    /// The current allocation epoch, advanced modulo 4 at the start of
    /// every cycle. Units stamped with the current epoch were allocated
    /// during the cycle and are spared by its sweep.
    epoch: AtomicU8,
    /// Whether a cycle is between IncrementEpoch and ClearMarking.
    is_marking: AtomicBool,
    /// Whether the in-flight (or most recent) cycle collects the old
    /// generation too.
    full_cycle: AtomicBool,
    /// Completed collection cycles.
    pub gc_count: AtomicUsize,
    /// Units reclaimed by sweeps.
    pub swept_units: AtomicUsize,
    /// Allocations serviced, by coarse size group.
    alloc_counts: EnumMap<SizeGroup, AtomicUsize>,
}

impl GlobalState {
    pub fn new() -> GlobalState {
        GlobalState::default()
    }

    pub fn epoch(&self) -> u8 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Advances the epoch and returns the new value. Coordinator only.
    pub fn advance_epoch(&self) -> u8 {
        let next = (self.epoch.load(Ordering::Relaxed) + 1) % EPOCH_MODULO;
        self.epoch.store(next, Ordering::Release);
        next
    }

    pub fn is_marking(&self) -> bool {
        self.is_marking.load(Ordering::Acquire)
    }

    pub fn set_marking(&self, marking: bool) {
        self.is_marking.store(marking, Ordering::Release);
    }

    pub fn is_full_cycle(&self) -> bool {
        self.full_cycle.load(Ordering::Acquire)
    }

    pub fn set_full_cycle(&self, full: bool) {
        self.full_cycle.store(full, Ordering::Release);
    }

    pub fn count_alloc(&self, group: SizeGroup) {
        self.alloc_counts[group].fetch_add(1, Ordering::Relaxed);
    }

    pub fn alloc_count(&self, group: SizeGroup) -> usize {
        self.alloc_counts[group].load(Ordering::Relaxed)
    }
}

/// A point-in-time copy of the counters, for hosts that want numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub gc_count: usize,
    pub swept_units: usize,
    pub small_allocs: usize,
    pub medium_allocs: usize,
    pub large_allocs: usize,
    pub huge_allocs: usize,
}

impl GlobalState {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            gc_count: self.gc_count.load(Ordering::Relaxed),
            swept_units: self.swept_units.load(Ordering::Relaxed),
            small_allocs: self.alloc_count(SizeGroup::Small),
            medium_allocs: self.alloc_count(SizeGroup::Medium),
            large_allocs: self.alloc_count(SizeGroup::Large),
            huge_allocs: self.alloc_count(SizeGroup::Huge),
        }
    }
}
