//! The thread-local allocation front-end.
//!
//! Each thread keeps, per small/medium size class, a current page whose
//! free chain it owns privately, plus a short list of standby pages that
//! may be refilling through their async returned-lists. The common
//! allocation path therefore runs without any synchronization: pop the
//! private chain, stamp the unit head, publish the mark.
//!
//! A page leaves the thread when it is exhausted and its returned-list
//! is empty; it is then flagged abandoned and forgotten until a sweep
//! finds it fully released and recycles it. The thread itself registers
//! with the global pool on first use and hands everything back when its
//! TLS is torn down.

use std::cell::RefCell;

use crate::gcheap;
use crate::policy::size_class::SizeGroup;
use crate::policy::huge::HugeUnit;
use crate::policy::large::LargeUnit;
use crate::policy::page::Page;
use crate::policy::size_class::{SizeClass, NUM_PAGE_CLASSES};
use crate::policy::unit::{Unit, UnitKindMask};
use crate::util::{Address, OpaquePointer};

struct ClassCache {
    current_page: Page,
    /// Standby pages, chained through their header links.
    cached_pages: Address,
    cached_page_count: usize,
    /// Head of the private free chain inside `current_page`.
    local_free_head: u16,
    local_free_count: usize,
}

impl ClassCache {
    const fn new() -> ClassCache {
        ClassCache {
            current_page: Page::ZERO,
            cached_pages: Address::ZERO,
            cached_page_count: 0,
            local_free_head: 0,
            local_free_count: 0,
        }
    }
}

pub struct ThreadPool {
    classes: [ClassCache; NUM_PAGE_CLASSES],
    cached_epoch: u8,
    cached_is_marking: bool,
    token: OpaquePointer,
    registered: bool,
}

thread_local! {
    static THREAD_POOL: RefCell<ThreadPool> = RefCell::new(ThreadPool::new());
}

/// Runs `f` against this thread's pool, registering it on first use.
pub fn with_pool<R>(f: impl FnOnce(&mut ThreadPool) -> R) -> R {
    THREAD_POOL.with(|cell| {
        let mut pool = cell.borrow_mut();
        if !pool.registered {
            pool.registered = true;
            pool.token = OpaquePointer::from_address(Address::from_ref(&*pool));
            pool.sync_with_coordinator();
            gcheap::pool().register_thread(pool.token);
        }
        f(&mut pool)
    })
}

impl ThreadPool {
    fn new() -> ThreadPool {
        ThreadPool {
            classes: std::array::from_fn(|_| ClassCache::new()),
            cached_epoch: 0,
            cached_is_marking: false,
            token: OpaquePointer::UNINITIALIZED,
            registered: false,
        }
    }

    /// Re-reads the coordinator's published epoch and marking flag.
    /// Called from checkpoints and every slow path.
    pub fn sync_with_coordinator(&mut self) {
        let state = gcheap::state();
        self.cached_epoch = state.epoch();
        self.cached_is_marking = state.is_marking();
    }

    pub fn cached_is_marking(&self) -> bool {
        self.cached_is_marking
    }

    /// The allocation entry point for every size.
    pub fn alloc(&mut self, size: usize, kind: UnitKindMask) -> Option<Address> {
        let class = SizeClass::of_size(size);
        if class.is_page_class() {
            self.alloc_pooled(class, kind)
        } else if class.is_large() {
            self.alloc_large(class, kind)
        } else {
            self.alloc_huge(size, kind)
        }
    }

    fn alloc_pooled(&mut self, class: SizeClass, kind: UnitKindMask) -> Option<Address> {
        let cache = &mut self.classes[class.index()];
        if cache.local_free_head != 0 {
            let unit = cache.current_page.unit_at(cache.local_free_head);
            cache.local_free_head = unit.next_free();
            cache.local_free_count -= 1;
            unit.publish_allocated(cache.current_page.start(), self.cached_epoch, kind);
            gcheap::state().count_alloc(class.group());
            return Some(unit.payload());
        }
        self.alloc_pooled_slow(class, kind)
    }

    #[cold]
    fn alloc_pooled_slow(&mut self, class: SizeClass, kind: UnitKindMask) -> Option<Address> {
        self.sync_with_coordinator();
        loop {
            let cache = &mut self.classes[class.index()];
            if cache.local_free_head != 0 {
                let unit = cache.current_page.unit_at(cache.local_free_head);
                cache.local_free_head = unit.next_free();
                cache.local_free_count -= 1;
                unit.publish_allocated(cache.current_page.start(), self.cached_epoch, kind);
                gcheap::state().count_alloc(class.group());
                return Some(unit.payload());
            }

            // The private chain is dry. Perhaps other threads returned
            // units to the current page in the meantime.
            if !cache.current_page.is_zero() {
                let merged = cache.current_page.take_returned();
                if merged != 0 {
                    cache.local_free_head = merged;
                    cache.local_free_count = chain_length(cache.current_page, merged);
                    continue;
                }
                Self::retire_current(cache, gcheap::options().cached_pages_per_class);
            }

            // A standby page may have refilled through its returned list.
            if let Some(head) = Self::take_refilled_standby(cache) {
                cache.local_free_head = head;
                cache.local_free_count = chain_length(cache.current_page, head);
                continue;
            }

            let page = gcheap::pool().acquire_page(class)?;
            page.set_abandoned(false);
            let mut head = page.next_alloc_head();
            page.set_next_alloc_head(0);
            if head == 0 {
                head = page.take_returned();
            }
            cache.current_page = page;
            cache.cached_page_count += 1;
            cache.local_free_head = head;
            cache.local_free_count = chain_length(page, head);
            if head == 0 {
                // A pooled page with nothing free; abandon it and retry.
                Self::retire_current(cache, gcheap::options().cached_pages_per_class);
            }
        }
    }

    /// Moves the exhausted current page onto the standby list, shedding
    /// the oldest standby to "abandoned" when the cache bound is hit.
    fn retire_current(cache: &mut ClassCache, limit: usize) {
        let page = cache.current_page;
        cache.current_page = Page::ZERO;
        if page.is_zero() {
            return;
        }
        page.set_link(cache.cached_pages);
        cache.cached_pages = page.start();

        if cache.cached_page_count > limit {
            // Drop the tail page of the standby chain.
            let mut prev = Address::ZERO;
            let mut cursor = cache.cached_pages;
            loop {
                let next = Page::from_address(cursor).link();
                if next.is_zero() {
                    break;
                }
                prev = cursor;
                cursor = next;
            }
            let tail = Page::from_address(cursor);
            if prev.is_zero() {
                cache.cached_pages = Address::ZERO;
            } else {
                Page::from_address(prev).set_link(Address::ZERO);
            }
            cache.cached_page_count -= 1;
            tail.set_link(Address::ZERO);
            tail.set_abandoned(true);
            log::trace!("abandoning exhausted page {}", tail.start());
        }
    }

    /// Pops the first standby page whose returned list has units, making
    /// it current. Returns the adopted chain head.
    fn take_refilled_standby(cache: &mut ClassCache) -> Option<u16> {
        let mut prev = Address::ZERO;
        let mut cursor = cache.cached_pages;
        while !cursor.is_zero() {
            let page = Page::from_address(cursor);
            let next = page.link();
            let head = page.take_returned();
            if head != 0 {
                if prev.is_zero() {
                    cache.cached_pages = next;
                } else {
                    Page::from_address(prev).set_link(next);
                }
                page.set_link(Address::ZERO);
                cache.current_page = page;
                return Some(head);
            }
            prev = cursor;
            cursor = next;
        }
        None
    }

    fn alloc_large(&mut self, class: SizeClass, kind: UnitKindMask) -> Option<Address> {
        self.sync_with_coordinator();
        let large = gcheap::pool().acquire_large(class)?;
        large
            .unit()
            .publish_allocated(Address::ZERO, self.cached_epoch, kind);
        gcheap::state().count_alloc(SizeGroup::Large);
        Some(large.payload())
    }

    fn alloc_huge(&mut self, size: usize, kind: UnitKindMask) -> Option<Address> {
        self.sync_with_coordinator();
        let huge = HugeUnit::create(size)?;
        huge.unit()
            .publish_allocated(Address::ZERO, self.cached_epoch, kind);
        gcheap::pool().register_huge(huge);
        gcheap::state().count_alloc(SizeGroup::Huge);
        Some(huge.payload())
    }

    /// Links an already released unit into the private chain when its
    /// page is this thread's current page for the class. Returns false
    /// when the page is not current and the unit must travel through the
    /// owning page's returned list instead.
    fn push_local_if_current(&mut self, unit: Unit, owner: Page) -> bool {
        let class = owner.size_class();
        let cache = &mut self.classes[class.index()];
        if owner != cache.current_page {
            return false;
        }
        unit.set_next_free(cache.local_free_head);
        cache.local_free_head = owner.offset_of(unit);
        cache.local_free_count += 1;
        true
    }

    fn forget_without_returning(&mut self) {
        for cache in self.classes.iter_mut() {
            *cache = ClassCache::new();
        }
        self.registered = false;
    }

    /// Gives every cached page back to the global pool. Runs at TLS
    /// teardown and leaves the pool empty but usable.
    fn surrender(&mut self) {
        if !self.registered {
            return;
        }
        if !gcheap::state().initialized.load(atomic::Ordering::Acquire) {
            // The heap is gone (or was never booted); the pages behind
            // these caches must not be touched.
            self.forget_without_returning();
            return;
        }
        let pool = gcheap::pool();
        for cache in self.classes.iter_mut() {
            if !cache.current_page.is_zero() {
                // Write the private chain back so the next owner adopts it.
                cache.current_page.set_next_alloc_head(cache.local_free_head);
                pool.return_page(cache.current_page);
                cache.current_page = Page::ZERO;
                cache.local_free_head = 0;
                cache.local_free_count = 0;
            }
            let mut cursor = cache.cached_pages;
            cache.cached_pages = Address::ZERO;
            cache.cached_page_count = 0;
            while !cursor.is_zero() {
                let page = Page::from_address(cursor);
                cursor = page.link();
                page.set_link(Address::ZERO);
                pool.return_page(page);
            }
        }
        pool.unregister_thread(self.token);
        self.registered = false;
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.surrender();
    }
}

/// Frees the unit whose payload starts at `payload`. The mark CAS
/// claims the unit (detecting double frees), the finalizer runs while
/// no list holds the slot and no thread-local state is borrowed, and
/// only then does the slot rejoin a free list.
pub fn free(payload: Address) {
    let unit = Unit::from_payload(payload);
    let owner = unit.owner_page_address();

    if unit.try_release().is_none() {
        log::warn!("double free of unit at {} ignored", payload);
        return;
    }
    gcheap::run_finalizer(unit);

    if !owner.is_zero() {
        let page = Page::from_address(owner);
        let kept_local = with_pool(|pool| pool.push_local_if_current(unit, page));
        if !kept_local {
            // Cross-thread (or non-current page) free: hand the slot
            // back through the owning page's returned list.
            page.push_returned(unit);
        }
        return;
    }

    let head = Page::from_address(unit.head_address() - crate::util::constants::PAGE_HEAD_BYTES);
    if head.size_class().is_huge() {
        // Only the mark flips now; the memory itself waits for the next
        // sweep, because a gray parent may still reference it.
        return;
    }
    gcheap::pool().return_large(LargeUnit::from_unit(unit));
}

/// Resizes an allocation. Close classes keep the pointer; a huge unit
/// records the new logical size in place while it fits its capacity;
/// everything else allocates a unit of the same GC-type, copies, and
/// frees the old one.
pub fn realloc(payload: Address, new_size: usize) -> Option<Address> {
    let unit = Unit::from_payload(payload);
    let kind = unit.kind();
    let old_class = unit.containing_class();
    let old_capacity = unit.payload_capacity();
    let new_class = SizeClass::of_size(new_size);

    if old_class.is_huge() && new_class.is_huge() {
        let huge = HugeUnit::from_unit(unit);
        if new_size <= huge.aligned_size() {
            huge.set_exact_size(new_size);
            return Some(payload);
        }
    } else if old_class.is_close_to(new_class) {
        return Some(payload);
    }

    let fresh = with_pool(|pool| pool.alloc(new_size, kind))?;
    unsafe {
        std::ptr::copy_nonoverlapping::<u8>(
            payload.to_ptr(),
            fresh.to_mut_ptr(),
            old_capacity.min(new_size),
        );
    }
    free(payload);
    Some(fresh)
}

/// Drops this thread's cached pages without touching their memory.
/// Used at shutdown, when the chunks behind them are about to go away.
pub fn forget_local() {
    THREAD_POOL.with(|cell| cell.borrow_mut().forget_without_returning());
}

fn chain_length(page: Page, head: u16) -> usize {
    let mut count = 0;
    let mut cursor = head;
    while cursor != 0 {
        count += 1;
        cursor = page.unit_at(cursor).next_free();
    }
    count
}
