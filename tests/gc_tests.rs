//! Host-driven collection cycles: marking, sweeping, the epoch guard,
//! generational aging, barriers and the card table. The collector
//! thread is disabled; every cycle here is explicit.

use gcheap::memory_manager::*;
use gcheap::util::constants::BYTES_IN_PAGE;
use gcheap::util::test_util::serial_test;
use gcheap::util::{Address, OpaquePointer, UserContext};
use gcheap::UnitKindMask;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static INIT: Once = Once::new();

/// The registered marker: treats the first payload word of a HasMarker
/// unit as a child pointer and marks it.
fn pointer_slot_marker(_ctx: UserContext, payload: Address) {
    let child = unsafe { Address::from_usize(payload.load::<usize>()) };
    try_mark_unit(child);
}

fn ensure_init() {
    INIT.call_once(|| {
        std::env::set_var("GCHEAP_COLLECTOR_THREAD", "false");
        let _ = env_logger::builder().is_test(true).try_init();
        init(
            OpaquePointer::UNINITIALIZED,
            Some(pointer_slot_marker),
            None,
            None,
            None,
        );
    });
}

/// Reclaims everything earlier tests left behind, then resyncs this
/// thread's cached epoch so allocations below carry the current one.
fn quiesce_heap() {
    for _ in 0..2 {
        begin_gc_mark(true);
        end_gc_mark_and_free_all_unmarked(None, None);
    }
    checkpoint();
}

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn counting_destroy(_ctx: UserContext, _payload: Address) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
}

fn run_counted_cycle<F: FnOnce()>(full: bool, mark_roots: F) -> usize {
    let before = DESTROYED.load(Ordering::SeqCst);
    begin_gc_mark(full);
    mark_roots();
    end_gc_mark_and_free_all_unmarked(Some(counting_destroy), None);
    DESTROYED.load(Ordering::SeqCst) - before
}

const SWEPT: UnitKindMask = UnitKindMask::NEED_SWEEP;
const FINALIZED: UnitKindMask =
    UnitKindMask::NEED_SWEEP.union(UnitKindMask::HAS_FINALIZER);

#[test]
fn sweep_reclaims_only_unmarked() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let a = alloc_attrib(128, FINALIZED).unwrap();
        let b = alloc_attrib(128, FINALIZED).unwrap();

        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(a).is_some());
            full_mark(a);
        });

        // Only B was unmarked; A survived the sweep.
        assert_eq!(reclaimed, 1);
        // B's slot is free again and back in its page's returned list; a
        // later allocation of the class may hand it out again.
        let again = alloc_attrib(128, SWEPT).unwrap();
        assert!(!again.is_zero());
        let _ = b;

        free(a);
        free(again);
    });
}

#[test]
fn double_mark_is_rejected() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let ptr = alloc_attrib(64, SWEPT).unwrap();

        begin_gc_mark(true);
        // The canonical head is 16 bytes below the payload.
        let head = try_mark_unit(ptr).expect("first try_mark must succeed");
        assert_eq!(head + 16usize, ptr);
        // A second mark of the same unit in the same cycle loses.
        assert!(try_mark_unit(ptr).is_none());
        full_mark(ptr);
        end_gc_mark_and_free_all_unmarked(None, None);

        free(ptr);
    });
}

#[test]
fn invalid_pointers_do_not_mark() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        begin_gc_mark(true);
        assert!(try_mark_unit(Address::ZERO).is_none());
        assert!(try_mark_unit(unsafe { Address::from_usize(0x10) }).is_none());
        // A live unit without NeedSweep is not markable either.
        let plain = alloc_normal(64).unwrap();
        assert!(try_mark_unit(plain).is_none());
        end_gc_mark_and_free_all_unmarked(None, None);
        free(plain);
    });
}

#[test]
fn allocated_during_mark_survives_the_cycle() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();

        begin_gc_mark(true);
        checkpoint(); // pick up the new epoch before allocating
        let ptr = alloc_attrib(64, FINALIZED).unwrap();
        let before = DESTROYED.load(Ordering::SeqCst);
        end_gc_mark_and_free_all_unmarked(Some(counting_destroy), None);
        // The epoch guard spared it despite being unmarked.
        assert_eq!(DESTROYED.load(Ordering::SeqCst) - before, 0);

        // The next cycle, with nothing marking it, reclaims it.
        let reclaimed = run_counted_cycle(true, || {});
        assert_eq!(reclaimed, 1);
        let _ = ptr;
    });
}

#[test]
fn survivors_age_into_the_old_generation() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let ptr = alloc_attrib(64, FINALIZED).unwrap();
        unsafe { ptr.zero_bytes(64) };

        // Sixteen marked full cycles walk the age from 15 down to 0.
        for _ in 0..16 {
            let reclaimed = run_counted_cycle(true, || {
                assert!(try_mark_unit(ptr).is_some());
            });
            assert_eq!(reclaimed, 0);
        }

        // A minor cycle without marking spares the old-generation unit.
        let reclaimed = run_counted_cycle(false, || {});
        assert_eq!(reclaimed, 0);
        // An old unit is not even markable under a minor cycle.
        begin_gc_mark(false);
        assert!(try_mark_unit(ptr).is_none());
        end_gc_mark_and_free_all_unmarked(None, None);

        // A full cycle without marking finally reclaims it.
        let reclaimed = run_counted_cycle(true, || {});
        assert_eq!(reclaimed, 1);
    });
}

#[test]
fn auto_mark_traces_children() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let parent = alloc_attrib(64, SWEPT.union(UnitKindMask::AUTO_MARK)).unwrap();
        let child = alloc_attrib(128, FINALIZED).unwrap();
        unsafe {
            parent.zero_bytes(64);
            parent.store::<usize>(child.as_usize());
        }

        // Marking only the parent keeps the child alive through the
        // conservative payload scan.
        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(parent).is_some());
        });
        assert_eq!(reclaimed, 0);

        // Severing the edge kills the child on the next cycle.
        unsafe { parent.store::<usize>(0) };
        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(parent).is_some());
        });
        assert_eq!(reclaimed, 1);

        free(parent);
    });
}

#[test]
fn marker_callback_extends_the_graph() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        // The registered marker reads the child pointer the host stored
        // in the payload; no conservative scanning on this unit.
        let parent = alloc_attrib(64, SWEPT.union(UnitKindMask::HAS_MARKER)).unwrap();
        let child = alloc_attrib(256, FINALIZED).unwrap();
        unsafe {
            parent.zero_bytes(64);
            parent.store::<usize>(child.as_usize());
        }
        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(parent).is_some());
        });
        assert_eq!(reclaimed, 0);

        unsafe { parent.store::<usize>(0) };
        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(parent).is_some());
        });
        assert_eq!(reclaimed, 1);
        free(parent);
    });
}

#[test]
fn checkpoint_reports_the_marking_window() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        assert!(!checkpoint());
        begin_gc_mark(true);
        assert!(checkpoint());
        end_gc_mark_and_free_all_unmarked(None, None);
        assert!(!checkpoint());
    });
}

#[test]
fn write_barrier_rescues_white_value_stored_into_black_target() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let target = alloc_attrib(64, SWEPT).unwrap();
        let value = alloc_attrib(96, FINALIZED).unwrap();

        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(target).is_some());
            full_mark(target); // target is black, children "done"
            unsafe { target.store::<usize>(value.as_usize()) };
            write_barrier_mixed(target, value);
        });
        // The barrier enqueued the white value; it survived.
        assert_eq!(reclaimed, 0);

        let reclaimed = run_counted_cycle(true, || {
            assert!(try_mark_unit(target).is_some());
            full_mark(target);
        });
        assert_eq!(reclaimed, 1);
        free(target);
    });
}

#[test]
fn deletion_barrier_rescues_overwritten_target() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let doomed = alloc_attrib(64, FINALIZED).unwrap();

        let reclaimed = run_counted_cycle(true, || {
            // The mutator is about to overwrite its last pointer to
            // `doomed` mid-marking; the barrier keeps the snapshot.
            delete_barrier(doomed);
        });
        assert_eq!(reclaimed, 0);

        let reclaimed = run_counted_cycle(true, || {});
        assert_eq!(reclaimed, 1);
    });
}

#[test]
fn card_table_keeps_young_children_of_old_parents() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let parent = alloc_attrib(64, FINALIZED).unwrap();
        unsafe { parent.zero_bytes(64) };

        // Age the parent into the old generation.
        for _ in 0..16 {
            let reclaimed = run_counted_cycle(true, || {
                assert!(try_mark_unit(parent).is_some());
            });
            assert_eq!(reclaimed, 0);
        }

        // Store a young reference into the old parent; the write
        // barrier dirties the card.
        let child = alloc_attrib(128, FINALIZED).unwrap();
        unsafe { parent.store::<usize>(child.as_usize()) };
        write_barrier_mixed(parent, child);

        // A minor cycle with no roots at all: the parent survives by
        // age, the child by the card rescan.
        let reclaimed = run_counted_cycle(false, || {});
        assert_eq!(reclaimed, 0);

        // Full cycle, nothing marked: both go.
        let reclaimed = run_counted_cycle(true, || {});
        assert_eq!(reclaimed, 2);
    });
}

#[test]
fn explicitly_freed_huge_unit_released_by_next_sweep() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let size = 16 * BYTES_IN_PAGE;
        let ptr = alloc_attrib(size, SWEPT).unwrap();

        // The unit is on the huge walk list while live.
        assert!(gcheap::gcheap::pool().huge_list_head().is_some());

        // Freeing a huge unit defers the OS release to the sweep.
        free(ptr);
        begin_gc_mark(true);
        end_gc_mark_and_free_all_unmarked(None, None);
        assert!(gcheap::gcheap::pool().huge_list_head().is_none());
    });
}

#[test]
fn unmarked_huge_unit_swept() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let size = 2 * 1024 * 1024;
        let _ptr = alloc_attrib(size, FINALIZED).unwrap();

        let reclaimed = run_counted_cycle(true, || {});
        assert_eq!(reclaimed, 1);
        assert!(gcheap::gcheap::pool().huge_list_head().is_none());
    });
}

#[test]
fn range_intake_marks_stored_pointers() {
    ensure_init();
    serial_test(|| {
        quiesce_heap();
        let a = alloc_attrib(64, FINALIZED).unwrap();
        let b = alloc_attrib(64, FINALIZED).unwrap();

        // A fake root buffer holding the two pointers plus junk.
        let roots: [usize; 4] = [a.as_usize(), 0xdead_beef, b.as_usize(), 0];
        let from = Address::from_ptr(roots.as_ptr());

        let reclaimed = run_counted_cycle(true, || {
            try_mark_unit_range(from, from + std::mem::size_of_val(&roots));
            full_mark(a);
            full_mark(b);
        });
        assert_eq!(reclaimed, 0);

        free(a);
        free(b);
    });
}
