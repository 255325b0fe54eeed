//! The sweep phase: walk every committed page in every chunk, every
//! large unit and every registered huge unit, reclaiming what the cycle
//! left unmarked.
//!
//! Sweep takes no lock on the pools; it only performs atomic mark
//! transitions and list pushes that mutators also perform. A unit is
//! dead by definition when it is Unmarked, sweep-managed, and stamped
//! with an epoch other than the current one - the epoch guard is what
//! lets objects allocated during the marking window survive without
//! synchronous enrollment. A minor cycle additionally spares the old
//! generation.

use atomic::Ordering;

use crate::gcheap::{self, DestroyFunc};
use crate::policy::chunk::Chunk;
use crate::policy::huge::HugeUnit;
use crate::policy::large::LargeUnit;
use crate::policy::page::Page;
use crate::policy::unit::{MarkState, Unit, UnitKindMask};
use crate::util::{OpaquePointer, UserContext};

/// Demotes every marked unit back to Unmarked. Runs at the start of a
/// cycle, the only point where a FullMarked unit may lose its mark.
pub fn reset_marks_for_new_cycle() {
    let pool = gcheap::pool();
    pool.for_each_chunk(|chunk| {
        for_each_head_page(chunk, |page, _| {
            let class = page.size_class();
            if class.is_page_class() {
                page.for_each_unit(demote_unit);
            } else if class.is_large() {
                demote_unit(LargeUnit::from_start(page.start()).unit());
            }
        });
    });

    let mut cursor = pool.huge_list_head();
    while let Some(huge) = cursor {
        demote_unit(huge.unit());
        cursor = huge.next();
    }
}

fn demote_unit(unit: Unit) {
    match unit.mark(Ordering::Acquire) {
        MarkState::SelfMarked | MarkState::FullMarked => {
            unit.set_mark(MarkState::Unmarked, Ordering::Release)
        }
        _ => {}
    }
}

/// Walks the whole heap, reclaiming dead units. Returns how many were
/// reclaimed. `destroy` overrides the registered destroyer for units
/// with a finalizer, as the host-driven cycle API allows.
pub fn sweep_heap(destroy: Option<DestroyFunc>, data: Option<UserContext>) -> usize {
    let pool = gcheap::pool();
    let state = gcheap::state();
    let full = state.is_full_cycle();
    let epoch = state.epoch();
    let mut swept = 0;

    pool.for_each_chunk(|chunk| {
        for_each_head_page(chunk, |page, _| {
            let class = page.size_class();
            if class.is_page_class() {
                swept += sweep_page(page, full, epoch, destroy, data);
            } else if class.is_large() {
                swept +=
                    sweep_large(LargeUnit::from_start(page.start()), full, epoch, destroy, data);
            }
        });
    });

    swept += sweep_huge_list(full, epoch, destroy, data);

    state.swept_units.fetch_add(swept, Ordering::Relaxed);
    log::debug!(
        "sweep done: {} units reclaimed ({} cycle, epoch {})",
        swept,
        if full { "full" } else { "minor" },
        epoch
    );
    swept
}

/// Calls `f` with each committed head page of the chunk and its index,
/// skipping the tail pages of multi-page runs.
fn for_each_head_page<F: FnMut(Page, usize)>(chunk: &Chunk, mut f: F) {
    let committed = chunk.committed_pages();
    let mut index = 0;
    while index < committed {
        if chunk.multi_page_offset(index) != 0 {
            index += 1;
            continue;
        }
        let page = Page::from_address(chunk.page_at(index));
        let class = page.size_class();
        f(page, index);
        index += if class.is_large() {
            class.large_pages()
        } else {
            1
        };
    }
}

fn unit_is_dead(unit: Unit, full: bool, epoch: u8) -> bool {
    unit.kind().contains(UnitKindMask::NEED_SWEEP)
        && unit.epoch() != epoch
        && (full || !unit.is_old_generation())
}

fn finalize(unit: Unit, destroy: Option<DestroyFunc>, data: Option<UserContext>) {
    if !unit.kind().contains(UnitKindMask::HAS_FINALIZER) {
        return;
    }
    match destroy {
        Some(destroy) => destroy(
            data.unwrap_or(OpaquePointer::UNINITIALIZED),
            unit.payload(),
        ),
        None => gcheap::run_finalizer(unit),
    }
}

fn sweep_page(
    page: Page,
    full: bool,
    epoch: u8,
    destroy: Option<DestroyFunc>,
    data: Option<UserContext>,
) -> usize {
    let mut swept = 0;
    page.for_each_unit(|unit| match unit.mark(Ordering::Acquire) {
        MarkState::Released => {}
        MarkState::Unmarked => {
            if unit_is_dead(unit, full, epoch)
                && unit.transition_mark(
                    MarkState::Unmarked,
                    MarkState::Released,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            {
                finalize(unit, destroy, data);
                page.push_returned(unit);
                swept += 1;
            }
        }
        MarkState::SelfMarked | MarkState::FullMarked => {
            let age = unit.age();
            if age > 0 {
                unit.set_age(age - 1);
            }
        }
    });

    // A fully released abandoned page goes back into circulation.
    if page.is_abandoned() && !page.has_live_units() {
        page.init(page.index(), page.size_class());
        gcheap::pool().return_page(page);
        log::trace!("recycled abandoned page {}", page.start());
    }
    swept
}

fn sweep_large(
    large: LargeUnit,
    full: bool,
    epoch: u8,
    destroy: Option<DestroyFunc>,
    data: Option<UserContext>,
) -> usize {
    let unit = large.unit();
    match unit.mark(Ordering::Acquire) {
        // Freed large units sit in the global bucket already.
        MarkState::Released => 0,
        MarkState::Unmarked => {
            if unit_is_dead(unit, full, epoch)
                && unit.transition_mark(
                    MarkState::Unmarked,
                    MarkState::Released,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            {
                finalize(unit, destroy, data);
                gcheap::pool().return_large(large);
                1
            } else {
                0
            }
        }
        MarkState::SelfMarked | MarkState::FullMarked => {
            let age = unit.age();
            if age > 0 {
                unit.set_age(age - 1);
            }
            0
        }
    }
}

fn sweep_huge_list(
    full: bool,
    epoch: u8,
    destroy: Option<DestroyFunc>,
    data: Option<UserContext>,
) -> usize {
    let pool = gcheap::pool();
    let mut swept = 0;
    let mut prev: Option<HugeUnit> = None;
    let mut cursor = pool.huge_list_head();
    while let Some(huge) = cursor {
        let next = huge.next();
        let unit = huge.unit();
        let reclaim = match unit.mark(Ordering::Acquire) {
            // Explicit frees of huge units only flip the mark; the
            // memory release was deferred to us.
            MarkState::Released => true,
            MarkState::Unmarked => {
                unit_is_dead(unit, full, epoch)
                    && unit.transition_mark(
                        MarkState::Unmarked,
                        MarkState::Released,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    && {
                        finalize(unit, destroy, data);
                        true
                    }
            }
            MarkState::SelfMarked | MarkState::FullMarked => {
                let age = unit.age();
                if age > 0 {
                    unit.set_age(age - 1);
                }
                false
            }
        };
        if reclaim {
            pool.unlink_huge(prev, huge);
            huge.destroy();
            swept += 1;
        } else {
            prev = Some(huge);
        }
        cursor = next;
    }
    swept
}
