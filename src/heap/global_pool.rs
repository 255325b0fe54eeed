//! The shared back-end every thread-local pool drains into and refills
//! from.
//!
//! All reservoirs are Treiber stacks: free pages per size class (chained
//! through the page header link), free large units per large class
//! (chained through their page-shaped heads), and the walk list of every
//! live huge unit. When a reservoir comes up empty the pool falls
//! through to the chunk layer, and the chunk layer to the OS.

use atomic::{Atomic, Ordering};
use std::collections::HashSet;
use std::sync::atomic::AtomicPtr;

use crate::heap::address_index::AddressIndex;
use crate::policy::chunk::{Chunk, ChunkError};
use crate::policy::huge::HugeUnit;
use crate::policy::large::LargeUnit;
use crate::policy::page::Page;
use crate::policy::size_class::{SizeClass, NUM_LARGE_CLASSES, NUM_PAGE_CLASSES};
use crate::util::{Address, OpaquePointer};

pub struct GlobalPool {
    free_pages: [Atomic<Address>; NUM_PAGE_CLASSES],
    free_large: [Atomic<Address>; NUM_LARGE_CLASSES],
    /// Every live huge unit, for the sweep walk. Pushes are CAS; only
    /// the sweeper compacts the list.
    huge_head: Atomic<Address>,
    /// The chunk stack, newest first. Push-only until shutdown.
    chunks: AtomicPtr<Chunk>,
    /// Live thread pools, as opaque identities. Never dereferenced.
    threads: spin::RwLock<HashSet<OpaquePointer>>,
    pub index: AddressIndex,
}

impl GlobalPool {
    pub fn new() -> GlobalPool {
        GlobalPool {
            free_pages: std::array::from_fn(|_| Atomic::new(Address::ZERO)),
            free_large: std::array::from_fn(|_| Atomic::new(Address::ZERO)),
            huge_head: Atomic::new(Address::ZERO),
            chunks: AtomicPtr::new(std::ptr::null_mut()),
            threads: spin::RwLock::new(HashSet::new()),
            index: AddressIndex::new(),
        }
    }

    /// Hands out a page of the given class, preferring recycled pages
    /// (which keep their partially used allocation chain) over fresh
    /// commits. Returns None only when the OS is out of memory.
    pub fn acquire_page(&self, class: SizeClass) -> Option<Page> {
        debug_assert!(class.is_page_class());
        if let Some(head) = pop_stack(&self.free_pages[class.index()], |addr| {
            Page::from_address(addr).link()
        }) {
            log::trace!("reusing pooled page {} for {:?}", head, class);
            return Some(Page::from_address(head));
        }

        let run = self.allocate_run_from_chunks(1)?;
        let page = Page::from_address(run.0);
        page.init(run.1, class);
        Some(page)
    }

    /// Returns a page to its class reservoir. The page's allocation chain
    /// must have been written back first.
    pub fn return_page(&self, page: Page) {
        let class = page.size_class();
        debug_assert!(class.is_page_class());
        push_stack(&self.free_pages[class.index()], page.start(), |next| {
            page.set_link(next)
        });
    }

    /// Hands out a large unit of the given class.
    pub fn acquire_large(&self, class: SizeClass) -> Option<LargeUnit> {
        debug_assert!(class.is_large());
        if let Some(head) = pop_stack(&self.free_large[class.large_index()], |addr| {
            LargeUnit::from_start(addr).page_head().link()
        }) {
            return Some(LargeUnit::from_start(head));
        }

        let run = self.allocate_run_from_chunks(class.large_pages())?;
        let large = LargeUnit::from_start(run.0);
        large.init(run.1, class);
        Some(large)
    }

    pub fn return_large(&self, large: LargeUnit) {
        let class = large.size_class();
        debug_assert!(class.is_large());
        push_stack(&self.free_large[class.large_index()], large.start(), |next| {
            large.page_head().set_link(next)
        });
    }

    /// Links a fresh huge unit into the walk list and the address index.
    pub fn register_huge(&self, huge: HugeUnit) {
        self.index.insert_huge(huge);
        let mut head = self.huge_head.load(Ordering::Relaxed);
        loop {
            huge.link_atomic().store(head.as_usize(), Ordering::Relaxed);
            match self.huge_head.compare_exchange_weak(
                head,
                huge.start(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// The head of the huge walk list. Sweep-only consumers may compact
    /// the list through [`unlink_huge`].
    pub fn huge_list_head(&self) -> Option<HugeUnit> {
        let head = self.huge_head.load(Ordering::Acquire);
        if head.is_zero() {
            None
        } else {
            Some(HugeUnit::from_start(head))
        }
    }

    /// Splices `huge` out of the walk list and drops its index entry.
    /// `prev` is its predecessor as observed by the walking sweeper, or
    /// None when it was the head. Only the sweeper may call this.
    pub fn unlink_huge(&self, prev: Option<HugeUnit>, huge: HugeUnit) {
        self.index.remove_huge(huge);
        let next = huge.link_atomic().load(Ordering::Relaxed);
        match prev {
            Some(prev) => {
                // Non-head links are the sweeper's alone; a plain store
                // cannot race the CAS pushes, which touch only the head.
                prev.link_atomic().store(next, Ordering::Release);
            }
            None => {
                if self
                    .huge_head
                    .compare_exchange(
                        huge.start(),
                        unsafe { Address::from_usize(next) },
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // New units were pushed since the walk began; find the
                    // current predecessor and splice there.
                    let mut cursor = self.huge_list_head();
                    while let Some(node) = cursor {
                        if node.next() == Some(huge) {
                            node.link_atomic().store(next, Ordering::Release);
                            return;
                        }
                        cursor = node.next();
                    }
                    unreachable!("huge unit vanished from the walk list");
                }
            }
        }
    }

    /// Visits every chunk, newest first.
    pub fn for_each_chunk<F: FnMut(&'static Chunk)>(&self, mut f: F) {
        let mut cursor = self.chunks.load(Ordering::Acquire);
        while !cursor.is_null() {
            let chunk: &'static Chunk = unsafe { &*cursor };
            f(chunk);
            cursor = chunk.next.load(Ordering::Acquire);
        }
    }

    pub fn register_thread(&self, token: OpaquePointer) {
        self.threads.write().insert(token);
        log::debug!("thread pool registered: {:?}", token);
    }

    pub fn unregister_thread(&self, token: OpaquePointer) {
        self.threads.write().remove(&token);
        log::debug!("thread pool unregistered: {:?}", token);
    }

    pub fn live_thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Walks the chunk stack for a contiguous run, creating a new chunk
    /// when every existing one is full. Returns the run start and its
    /// page index.
    fn allocate_run_from_chunks(&self, pages: usize) -> Option<(Address, u16)> {
        loop {
            let mut cursor = self.chunks.load(Ordering::Acquire);
            while !cursor.is_null() {
                let chunk: &'static Chunk = unsafe { &*cursor };
                match chunk.allocate_page_run(pages) {
                    Ok(run) => return Some((run, chunk.page_index_of(run) as u16)),
                    Err(ChunkError::PageGroupFull) => {}
                    Err(ChunkError::CommitFailed) => return None,
                }
                cursor = chunk.next.load(Ordering::Acquire);
            }

            // Every chunk is out of pages.
            let chunk = Chunk::create()?;
            self.push_chunk(chunk);
            self.index.insert_chunk(chunk);
        }
    }

    fn push_chunk(&self, chunk: &'static Chunk) {
        let raw = chunk as *const Chunk as *mut Chunk;
        let mut head = self.chunks.load(Ordering::Relaxed);
        loop {
            chunk.next.store(head, Ordering::Relaxed);
            match self
                .chunks
                .compare_exchange_weak(head, raw, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Tears the whole pool down: every chunk back to the OS, every huge
    /// unit released, the index cleared. Only shutdown calls this, after
    /// mutators and the collector are done.
    pub fn release_everything(&self) {
        let mut huge = self.huge_list_head();
        self.huge_head.store(Address::ZERO, Ordering::Release);
        while let Some(unit) = huge {
            huge = unit.next();
            unit.destroy();
        }

        for slot in self.free_pages.iter().chain(self.free_large.iter()) {
            slot.store(Address::ZERO, Ordering::Release);
        }

        let mut cursor = self.chunks.swap(std::ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next.load(Ordering::Acquire) };
            unsafe { Chunk::destroy(cursor) };
            cursor = next;
        }

        self.index.clear();
        self.threads.write().clear();
    }
}

impl Default for GlobalPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Treiber-stack pop. `next_of` reads the link of a node.
fn pop_stack<F: Fn(Address) -> Address>(head: &Atomic<Address>, next_of: F) -> Option<Address> {
    let mut current = head.load(Ordering::Acquire);
    loop {
        if current.is_zero() {
            return None;
        }
        let next = next_of(current);
        match head.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Some(current),
            Err(observed) => {
                current = observed;
                std::hint::spin_loop();
            }
        }
    }
}

/// Treiber-stack push. `set_next` writes the node's link.
fn push_stack<F: Fn(Address)>(head: &Atomic<Address>, node: Address, set_next: F) {
    let mut current = head.load(Ordering::Relaxed);
    loop {
        set_next(current);
        match head.compare_exchange_weak(current, node, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(observed) => {
                current = observed;
                std::hint::spin_loop();
            }
        }
    }
}
