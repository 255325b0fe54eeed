//! The hooks mutators call while the collector is (or might be) running:
//! conservative root intake, the snapshot-at-the-beginning write
//! barrier, the deletion barrier, and the checkpoint.

use atomic::Ordering;

use crate::gcheap;
use crate::heap::thread_pool;
use crate::policy::unit::{MarkState, UnitKindMask};
use crate::util::constants::UNIT_ALIGN;
use crate::util::Address;

/// Result of a successful `try_mark`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryMarked {
    /// The canonical unit-head address the pointer resolved to.
    pub head: Address,
    /// Whether surviving this cycle promotes the unit to the old
    /// generation; callers use this to dirty cards for later cycles.
    pub becoming_old: bool,
}

/// Accepts a possibly invalid pointer and, when it resolves to a live,
/// sweep-managed, not-yet-marked unit (and not an old-generation unit
/// under a minor cycle), marks it gray and enqueues it.
///
/// Succeeds at most once per unit per cycle: the Unmarked-to-SelfMarked
/// transition is a CAS, so racing callers agree on a single winner.
pub fn try_mark(addr: Address) -> Option<TryMarked> {
    let resolved = gcheap::pool().index.find(addr)?;
    let unit = resolved.unit();
    if unit.mark(Ordering::Acquire) != MarkState::Unmarked {
        return None;
    }
    // The Acquire above pairs with the allocation publish, so the
    // metadata reads below see initialized values.
    if !unit.kind().contains(UnitKindMask::NEED_SWEEP) {
        return None;
    }
    if !gcheap::state().is_full_cycle() && unit.is_old_generation() {
        return None;
    }
    if !unit.transition_mark(
        MarkState::Unmarked,
        MarkState::SelfMarked,
        Ordering::AcqRel,
        Ordering::Relaxed,
    ) {
        return None;
    }
    let becoming_old = unit.age() <= 1;
    gcheap::coordinator().gray_list().push(unit, becoming_old);
    log::trace!(
        "marked {} gray (becoming_old={})",
        unit.payload(),
        becoming_old
    );
    Some(TryMarked {
        head: unit.head_address(),
        becoming_old,
    })
}

/// Reads every pointer-sized slot in `[from, to)` and feeds the loaded
/// values through `try_mark`. The range itself must be readable; the
/// values it holds may be arbitrary garbage.
pub fn try_mark_range(from: Address, to: Address) {
    let mut cursor = from.align_up(UNIT_ALIGN);
    while cursor + UNIT_ALIGN <= to {
        let candidate = unsafe { Address::from_usize(cursor.load::<usize>()) };
        try_mark(candidate);
        cursor += UNIT_ALIGN;
    }
}

/// Unconditionally blackens the unit `addr` resolves to. The caller
/// promises that every outgoing pointer of the unit has been (or will
/// be, via the marker callback) enqueued.
pub fn full_mark(addr: Address) {
    if let Some(resolved) = gcheap::pool().index.find(addr) {
        resolved
            .unit()
            .set_mark(MarkState::FullMarked, Ordering::Release);
    }
}

/// Barrier for `*slot = value`.
///
/// During the marking window it preserves the snapshot invariant: a
/// white value stored into a black target is enqueued, since the
/// collector has already finished with the target and would otherwise
/// never see the value. Independently of marking, a young value stored
/// into an old target dirties the target's card so the next minor cycle
/// rescans it.
pub fn write_barrier(slot: Address, value: Address) {
    let index = &gcheap::pool().index;
    let Some(target) = index.find(slot) else {
        return;
    };
    let target_unit = target.unit();
    let target_mark = target_unit.mark(Ordering::Acquire);
    if target_mark == MarkState::Released {
        return;
    }

    if gcheap::state().is_marking() && target_mark == MarkState::FullMarked {
        if let Some(resolved_value) = index.find(value) {
            if resolved_value.unit().mark(Ordering::Acquire) == MarkState::Unmarked {
                try_mark(value);
            }
        }
    }

    if target_unit.is_old_generation() {
        if let Some(resolved_value) = index.find(value) {
            let value_unit = resolved_value.unit();
            if value_unit.mark(Ordering::Acquire) != MarkState::Released
                && !value_unit.is_old_generation()
            {
                target.mark_card(slot);
            }
        }
    }
}

/// Barrier for overwriting a pointer: during marking, the about-to-be
/// disconnected target is enqueued if it has not been reached yet.
pub fn deletion_barrier(addr: Address) {
    if gcheap::state().is_marking() {
        try_mark(addr);
    }
}

/// Mutator safe point: refreshes the thread's cached epoch and marking
/// flag, and reports whether marking is active.
pub fn checkpoint() -> bool {
    thread_pool::with_pool(|pool| {
        pool.sync_with_coordinator();
        pool.cached_is_marking()
    })
}
