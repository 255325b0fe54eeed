//! The public operations of the allocator, as flat functions over the
//! process-wide instance.
//!
//! Allocation returns `None` for out-of-memory or oversized requests;
//! no allocation path panics. The GC intake functions accept arbitrary,
//! possibly invalid addresses and simply return `None`/do nothing when
//! a pointer does not resolve. `free` is the one exception: its
//! argument must be a pointer this allocator returned, and a
//! sweep-managed pointer must still be reachable when freed.

use std::time::Duration;

use crate::gc::barriers;
use crate::gcheap::{
    self, Callbacks, DestroyCallback, DestroyFunc, MarkCallback, RootCallback,
};
use crate::global_state::StatsSnapshot;
use crate::heap::thread_pool;
use crate::policy::unit::UnitKindMask;
use crate::util::constants::BYTES_IN_PAGE;
use crate::util::options::Options;
use crate::util::{memory, Address, UserContext};
use atomic::Ordering;

/// Boots the allocator: reads `GCHEAP_*` options from the environment,
/// registers the host callbacks, and (unless configured off) starts the
/// collector thread. All callbacks are optional. Calling `init` twice
/// without an intervening `shutdown` logs a warning and does nothing.
pub fn init(
    user_ctx: UserContext,
    marker: Option<MarkCallback>,
    destroyer: Option<DestroyCallback>,
    start_marking: Option<RootCallback>,
    stop_marking: Option<RootCallback>,
) {
    let state = gcheap::state();
    if state.initialized.swap(true, Ordering::AcqRel) {
        log::warn!("init called twice; ignoring");
        return;
    }

    // The lazy-commit arithmetic assumes our pages are whole OS pages.
    assert_eq!(
        BYTES_IN_PAGE % memory::page_size(),
        0,
        "allocator page size must be a multiple of the OS page size"
    );

    let options = Options::from_env();
    *gcheap::GCHEAP.options.write() = options;
    *gcheap::GCHEAP.callbacks.write() = Callbacks {
        user_ctx,
        marker,
        destroyer,
        start_marking,
        stop_marking,
    };

    if options.collector_thread {
        gcheap::coordinator().clear_stop();
        let handle = std::thread::Builder::new()
            .name("gcheap-collector".into())
            .spawn(collector_loop)
            .expect("failed to spawn the collector thread");
        *gcheap::GCHEAP.collector_handle.lock().unwrap() = Some(handle);
    }
    log::info!(
        "gcheap initialized (collector_thread={}, gc_interval={}ms)",
        options.collector_thread,
        options.gc_interval_ms
    );
}

fn collector_loop() {
    use crate::gc::coordinator::CollectorWork;
    let coordinator = gcheap::coordinator();
    loop {
        let options = gcheap::options();
        let interval = Duration::from_millis(options.gc_interval_ms);
        match coordinator.wait_for_work(interval, options.full_gc_default) {
            CollectorWork::Stop => break,
            CollectorWork::Cycle { full } => coordinator.run_cycle(full),
        }
    }
    log::info!("collector thread stopped");
}

/// Stops the collector (finishing any in-flight cycle first) and
/// returns every chunk and huge unit to the OS. Survivors get no
/// finalizer calls; that is a documented trade-off. After `shutdown`
/// the allocator can be re-initialized.
pub fn shutdown() {
    let state = gcheap::state();
    if !state.initialized.swap(false, Ordering::AcqRel) {
        log::warn!("shutdown without init; ignoring");
        return;
    }

    gcheap::coordinator().request_stop();
    if let Some(handle) = gcheap::GCHEAP.collector_handle.lock().unwrap().take() {
        let _ = handle.join();
    }

    // This thread's cache would otherwise dangle into released chunks.
    // Caches of other, still-running threads are the host's contract.
    thread_pool::forget_local();
    state.set_marking(false);
    gcheap::coordinator().gray_list().drain_node_cache();
    gcheap::pool().release_everything();
    *gcheap::GCHEAP.callbacks.write() = Callbacks::default();
    log::info!("gcheap shut down");
}

/// Allocates `size` bytes of ordinary (not GC-managed, not scanned)
/// storage. Freed only by an explicit `free`.
pub fn alloc_normal(size: usize) -> Option<Address> {
    thread_pool::with_pool(|pool| pool.alloc(size, UnitKindMask::NONE))
}

/// Allocates `size` bytes with the given GC-type mask.
pub fn alloc_attrib(size: usize, kind: UnitKindMask) -> Option<Address> {
    thread_pool::with_pool(|pool| pool.alloc(size, kind))
}

/// Resizes an allocation. Stays in place when the old and new classes
/// are close (or the new size still fits a huge unit's capacity);
/// otherwise allocates a unit of the same GC-type, copies, and frees
/// the old one. `realloc(None, n)` allocates.
pub fn realloc(ptr: Option<Address>, new_size: usize) -> Option<Address> {
    match ptr {
        Some(payload) => thread_pool::realloc(payload, new_size),
        None => alloc_normal(new_size),
    }
}

/// Frees an allocation. For sweep-managed units the pointer must still
/// be reachable (explicit free of those is discouraged); huge units
/// only flip to Released here and are returned to the OS by the next
/// sweep.
pub fn free(ptr: Address) {
    if ptr.is_zero() {
        log::warn!("free of null pointer ignored");
        return;
    }
    thread_pool::free(ptr);
}

/// Conservative mark intake: resolves `addr`, marks the unit gray and
/// enqueues it. Returns the canonical head address on success, at most
/// once per unit per cycle.
pub fn try_mark_unit(addr: Address) -> Option<Address> {
    barriers::try_mark(addr).map(|marked| marked.head)
}

/// Feeds every pointer-sized value stored in `[from, to)` through
/// `try_mark_unit`.
pub fn try_mark_unit_range(from: Address, to: Address) {
    barriers::try_mark_range(from, to)
}

/// Blackens the unit `ptr` resolves to. The caller guarantees its
/// outgoing pointers are enqueued (or will be via the marker).
pub fn full_mark(ptr: Address) {
    barriers::full_mark(ptr)
}

/// The write barrier for `*slot = value`; see `gc::barriers`.
pub fn write_barrier_mixed(slot: Address, value: Address) {
    barriers::write_barrier(slot, value)
}

/// The deletion barrier for overwriting a pointer to `value`.
pub fn delete_barrier(value: Address) {
    barriers::deletion_barrier(value)
}

/// Mutator safe point. Returns whether marking is active.
pub fn checkpoint() -> bool {
    barriers::checkpoint()
}

/// Opens a host-driven collection cycle; see the coordinator. The host
/// seeds roots with `try_mark_unit` between begin and end.
pub fn begin_gc_mark(is_full: bool) {
    gcheap::coordinator().begin_mark(is_full)
}

/// Drains the gray list, closes the marking window, and sweeps. The
/// optional `destroy` overrides the registered destroyer for finalized
/// units of this sweep only.
pub fn end_gc_mark_and_free_all_unmarked(destroy: Option<DestroyFunc>, data: Option<UserContext>) {
    gcheap::coordinator().end_mark_and_sweep(destroy, data)
}

/// Requests a cycle from the collector thread, or runs one inline when
/// the thread is disabled.
pub fn trigger_gc(is_full: bool) {
    if gcheap::GCHEAP.collector_handle.lock().unwrap().is_some() {
        gcheap::coordinator().request(is_full);
    } else {
        gcheap::coordinator().run_cycle(is_full);
    }
}

/// A point-in-time copy of the allocation and collection counters.
pub fn stats_snapshot() -> StatsSnapshot {
    gcheap::state().snapshot()
}
