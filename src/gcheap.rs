//! The process-wide allocator instance: one global pool, one shared
//! state block, one coordinator, and the host's registered callbacks.

use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::gc::coordinator::Coordinator;
use crate::global_state::GlobalState;
use crate::heap::global_pool::GlobalPool;
use crate::policy::unit::{Unit, UnitKindMask};
use crate::util::options::Options;
use crate::util::{Address, OpaquePointer, UserContext};

/// Marker callback: invoked with the payload of every FullMarked unit
/// whose GC-type has HasMarker. The host marks the unit's children by
/// calling `try_mark_unit` on them.
pub type MarkCallback = fn(UserContext, Address);
/// Destroyer callback: invoked with the payload of a unit about to be
/// reclaimed whose GC-type has HasFinalizer.
pub type DestroyCallback = fn(UserContext, Address);
/// Root-enumeration callbacks, run when a marking window opens/closes.
pub type RootCallback = fn(UserContext);
/// Per-cycle destroyer override for host-driven sweeps.
pub type DestroyFunc = fn(UserContext, Address);

#[derive(Clone, Copy)]
pub struct Callbacks {
    pub user_ctx: UserContext,
    pub marker: Option<MarkCallback>,
    pub destroyer: Option<DestroyCallback>,
    pub start_marking: Option<RootCallback>,
    pub stop_marking: Option<RootCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Callbacks {
            user_ctx: OpaquePointer::UNINITIALIZED,
            marker: None,
            destroyer: None,
            start_marking: None,
            stop_marking: None,
        }
    }
}

pub struct GCHeap {
    pub pool: GlobalPool,
    pub state: GlobalState,
    pub coordinator: Coordinator,
    pub options: spin::RwLock<Options>,
    pub callbacks: spin::RwLock<Callbacks>,
    pub collector_handle: Mutex<Option<JoinHandle<()>>>,
}

lazy_static! {
    /// The singleton. Everything hangs off this; thread pools reach it
    /// through the accessors below.
    pub static ref GCHEAP: GCHeap = GCHeap {
        pool: GlobalPool::new(),
        state: GlobalState::new(),
        coordinator: Coordinator::new(),
        options: spin::RwLock::new(Options::default()),
        callbacks: spin::RwLock::new(Callbacks::default()),
        collector_handle: Mutex::new(None),
    };
}

pub fn pool() -> &'static GlobalPool {
    &GCHEAP.pool
}

pub fn state() -> &'static GlobalState {
    &GCHEAP.state
}

pub fn coordinator() -> &'static Coordinator {
    &GCHEAP.coordinator
}

pub fn options() -> Options {
    *GCHEAP.options.read()
}

pub fn callbacks() -> Callbacks {
    *GCHEAP.callbacks.read()
}

/// Runs the registered destroyer for a unit that declared a finalizer.
pub fn run_finalizer(unit: Unit) {
    if !unit.kind().contains(UnitKindMask::HAS_FINALIZER) {
        return;
    }
    let callbacks = callbacks();
    if let Some(destroyer) = callbacks.destroyer {
        destroyer(callbacks.user_ctx, unit.payload());
    }
}
