//! Full init/shutdown lifecycle with the collector thread running.
//! Kept in its own test binary so tearing the heap down cannot race
//! the other suites.

use gcheap::memory_manager::*;
use gcheap::util::{Address, OpaquePointer, UserContext};
use gcheap::UnitKindMask;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

static DESTROYED: AtomicUsize = AtomicUsize::new(0);

fn counting_destroyer(_ctx: UserContext, _payload: Address) {
    DESTROYED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn collector_thread_lifecycle() {
    std::env::set_var("GCHEAP_GC_INTERVAL_MS", "50");
    let _ = env_logger::builder().is_test(true).try_init();

    init(
        OpaquePointer::UNINITIALIZED,
        None,
        Some(counting_destroyer),
        None,
        None,
    );
    // A second init is a no-op, not a crash.
    init(OpaquePointer::UNINITIALIZED, None, None, None, None);

    let kept = alloc_normal(64).unwrap();
    unsafe { kept.store::<u64>(0x5eed) };

    // Garbage for the collector: sweep-managed, finalized, never marked.
    for _ in 0..10 {
        alloc_attrib(256, UnitKindMask::NEED_SWEEP.union(UnitKindMask::HAS_FINALIZER)).unwrap();
    }

    // The short quiescent interval forces cycles; explicit triggers work
    // too. Wait for the collector to reclaim the garbage.
    trigger_gc(true);
    let deadline = Instant::now() + Duration::from_secs(10);
    while DESTROYED.load(Ordering::SeqCst) < 10 && Instant::now() < deadline {
        checkpoint();
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(DESTROYED.load(Ordering::SeqCst), 10);
    assert!(stats_snapshot().gc_count >= 1);

    // Plain allocations are never swept behind our back.
    assert_eq!(unsafe { kept.load::<u64>() }, 0x5eed);
    free(kept);

    shutdown();

    // The heap comes back after a shutdown.
    init(OpaquePointer::UNINITIALIZED, None, None, None, None);
    let again = alloc_normal(128).unwrap();
    unsafe { again.store::<u64>(7) };
    assert_eq!(unsafe { again.load::<u64>() }, 7);
    free(again);
    shutdown();

    // And shutting down twice only warns.
    shutdown();
}
