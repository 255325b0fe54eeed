//! The collection coordinator.
//!
//! A dedicated collector thread sleeps on a condition variable until a
//! mutator requests a cycle or the configured quiescent interval runs
//! out, then drives the cycle state machine:
//!
//! Idle -> IncrementEpoch -> RootMark -> Drain -> ClearMarking -> Sweep
//!
//! Hosts that prefer to drive cycles themselves call `begin_mark` /
//! `end_mark_and_sweep` directly (the public `begin_gc_mark` /
//! `end_gc_mark_and_free_all_unmarked` operations) and disable the
//! collector thread; the thread uses exactly the same two entry points.
//! A cycle, once started, runs to completion - there is no cancellation.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use atomic::Ordering;

use crate::gc::barriers::try_mark_range;
use crate::gc::gray_list::GrayList;
use crate::gc::sweep;
use crate::gcheap::{self, DestroyFunc};
use crate::policy::unit::{MarkState, Unit, UnitKindMask};
use crate::util::constants::CARD_BYTES;
use crate::util::UserContext;

struct RequestSync {
    request_count: isize,
    consumed_count: isize,
    /// Whether any pending request asked for a full collection.
    full_requested: bool,
    stop: bool,
}

/// What the collector thread should do next.
pub enum CollectorWork {
    Cycle { full: bool },
    Stop,
}

pub struct Coordinator {
    request_sync: Mutex<RequestSync>,
    request_condvar: Condvar,
    gray: GrayList,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        Coordinator {
            request_sync: Mutex::new(RequestSync {
                request_count: 0,
                consumed_count: 0,
                full_requested: false,
                stop: false,
            }),
            request_condvar: Condvar::new(),
            gray: GrayList::new(),
        }
    }

    pub fn gray_list(&self) -> &GrayList {
        &self.gray
    }

    /// Asks the collector thread for a cycle. Multiple requests between
    /// cycles collapse into one; a single full request makes it full.
    pub fn request(&self, full: bool) {
        let mut sync = self.request_sync.lock().unwrap();
        sync.request_count += 1;
        sync.full_requested |= full;
        self.request_condvar.notify_all();
    }

    pub fn request_stop(&self) {
        let mut sync = self.request_sync.lock().unwrap();
        sync.stop = true;
        self.request_condvar.notify_all();
    }

    /// Rearms the coordinator for a fresh collector thread after a
    /// shutdown/init sequence.
    pub fn clear_stop(&self) {
        self.request_sync.lock().unwrap().stop = false;
    }

    /// Parks the collector until a request, the quiescent deadline, or a
    /// stop. A timed-out wait forces a cycle of the configured kind.
    pub fn wait_for_work(&self, interval: Duration, timeout_is_full: bool) -> CollectorWork {
        let deadline = Instant::now() + interval;
        let mut sync = self.request_sync.lock().unwrap();
        loop {
            if sync.stop {
                return CollectorWork::Stop;
            }
            if sync.consumed_count != sync.request_count {
                sync.consumed_count = sync.request_count;
                let full = std::mem::take(&mut sync.full_requested);
                return CollectorWork::Cycle { full };
            }
            let now = Instant::now();
            if now >= deadline {
                return CollectorWork::Cycle {
                    full: timeout_is_full,
                };
            }
            let (guard, _) = self
                .request_condvar
                .wait_timeout(sync, deadline - now)
                .unwrap();
            sync = guard;
        }
    }

    /// IncrementEpoch and RootMark: advances the epoch, demotes stale
    /// marks, opens the marking window, runs the host's root callback,
    /// and rescans dirty cards for old-to-young references.
    pub fn begin_mark(&self, full: bool) {
        let state = gcheap::state();
        state.set_full_cycle(full);
        let epoch = state.advance_epoch();
        sweep::reset_marks_for_new_cycle();
        state.set_marking(true);
        log::debug!(
            "cycle start: epoch {} ({})",
            epoch,
            if full { "full" } else { "minor" }
        );

        let callbacks = gcheap::callbacks();
        if let Some(start_marking) = callbacks.start_marking {
            start_marking(callbacks.user_ctx);
        }

        self.scan_cards();
    }

    /// Drain, ClearMarking and Sweep. Completes the cycle that
    /// `begin_mark` opened.
    pub fn end_mark_and_sweep(&self, destroy: Option<DestroyFunc>, data: Option<UserContext>) {
        self.drain();

        let state = gcheap::state();
        state.set_marking(false);
        let callbacks = gcheap::callbacks();
        if let Some(stop_marking) = callbacks.stop_marking {
            stop_marking(callbacks.user_ctx);
        }

        sweep::sweep_heap(destroy, data);
        state.gc_count.fetch_add(1, Ordering::Relaxed);
    }

    /// One full cycle, as run by the collector thread.
    pub fn run_cycle(&self, full: bool) {
        self.begin_mark(full);
        self.end_mark_and_sweep(None, None);
    }

    /// Conservatively rescans the address range under every dirty card.
    /// Cards mark old-generation memory that received young pointers;
    /// since minor cycles never trace through old units, the cards are
    /// what keeps those young targets alive.
    fn scan_cards(&self) {
        let pool = gcheap::pool();
        pool.for_each_chunk(|chunk| {
            chunk.drain_dirty_cards(try_mark_range);
        });
        let mut cursor = pool.huge_list_head();
        while let Some(huge) = cursor {
            huge.drain_dirty_cards(try_mark_range);
            cursor = huge.next();
        }
    }

    /// Repeatedly takes the whole gray list and blackens it, tracing
    /// children as it goes. Mutators keep pushing while we drain; the
    /// loop ends only when a pick comes back empty.
    fn drain(&self) {
        loop {
            let mut processed = 0usize;
            for (unit, becoming_old) in self.gray.pick_all_units() {
                processed += 1;
                if !unit.transition_mark(
                    MarkState::SelfMarked,
                    MarkState::FullMarked,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    // Someone already blackened it (a host full_mark);
                    // its children are the caller's promise.
                    continue;
                }
                self.trace_children(unit);
                if becoming_old {
                    dirty_cards_of(unit);
                }
            }
            if processed == 0 {
                return;
            }
        }
    }

    fn trace_children(&self, unit: Unit) {
        let kind = unit.kind();
        if kind.contains(UnitKindMask::AUTO_MARK) {
            let payload = unit.payload();
            try_mark_range(payload, payload + unit.payload_capacity());
        }
        if kind.contains(UnitKindMask::HAS_MARKER) {
            let callbacks = gcheap::callbacks();
            if let Some(marker) = callbacks.marker {
                marker(callbacks.user_ctx, unit.payload());
            }
        }
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Dirties every card covering the unit's payload, so the next minor
/// cycle rescans this about-to-be-old unit for young references.
fn dirty_cards_of(unit: Unit) {
    if let Some(resolved) = gcheap::pool().index.find(unit.payload()) {
        let payload = unit.payload();
        let end = payload + unit.payload_capacity();
        let mut cursor = payload;
        while cursor < end {
            resolved.mark_card(cursor);
            cursor = (cursor + CARD_BYTES).align_down(CARD_BYTES);
        }
    }
}
