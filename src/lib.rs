//! gcheap: a concurrent, thread-caching memory allocator with tracing
//! garbage collection support.
//!
//! The crate is the memory core of a managed-language runtime. It
//! services individual allocation and free requests from per-thread
//! caches, and cooperates with the host's collector by keeping
//! per-object metadata (age, mark state, allocation epoch), resolving
//! arbitrary pointers through an address index, and walking the whole
//! heap during sweep.
//!
//! It is built from four layers, bottom up:
//!
//! * [`util::memory`] reserves and commits virtual memory; `policy::chunk`
//!   slices 128 MiB reservations into lazily committed 64 KiB pages.
//! * [`policy`] defines the size classes and the unit/page/large/huge
//!   storage shapes.
//! * [`heap`] runs allocation: thread-local class caches over a global
//!   pool of free pages and units, plus the pointer-validation index.
//! * [`gc`] drives collection: tri-color marking with mutator barriers,
//!   generational aging via a card table, and the sweep.
//!
//! Hosts interact through the flat functions in [`memory_manager`]:
//! `init`/`shutdown`, `alloc_normal`/`alloc_attrib`/`realloc`/`free`,
//! and the marking intake (`try_mark_unit`, `write_barrier_mixed`,
//! `begin_gc_mark`, ...).

#[macro_use]
extern crate lazy_static;

pub mod memory_manager;

pub mod gcheap;
pub mod global_state;

pub mod gc;
pub mod heap;
pub mod policy;
pub mod util;

pub use crate::gcheap::{Callbacks, DestroyCallback, DestroyFunc, MarkCallback, RootCallback};
pub use crate::global_state::StatsSnapshot;
pub use crate::policy::unit::{MarkState, UnitKindMask};
pub use crate::util::{Address, OpaquePointer, UserContext};
