//! Chunks: the unit of address-space reservation.
//!
//! A chunk owns one 128 MiB reserved range. The first pages hold the
//! chunk's card table and are committed eagerly; the remaining 2044 page
//! slots are committed lazily as the pool asks for them. Two counters
//! drive lazy commit: `next_commit` is the reservation frontier and
//! `committed` the confirmation barrier. Reading `committed` with Acquire
//! guarantees that every page below it is committed and has a fully
//! written header, so concurrent pointer validation never touches
//! uninitialized memory.
//!
//! Chunks are created on demand by the global pool, form a singly-linked
//! stack (newest first), and die only at shutdown.

use atomic::Ordering;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize};

use crate::util::constants::*;
use crate::util::conversions::card_index;
use crate::util::{memory, Address};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ChunkError {
    /// Every page slot of this chunk is spoken for.
    PageGroupFull,
    /// The OS refused to commit backing memory.
    CommitFailed,
}

pub struct Chunk {
    /// Raw reservation, kept for the final release. The working range is
    /// `base`, aligned up to a page boundary inside it.
    reserve_base: Address,
    reserve_bytes: usize,
    base: Address,
    /// Next chunk in the global stack.
    pub(crate) next: AtomicPtr<Chunk>,
    /// Reservation frontier, in allocatable-page indices.
    next_commit: AtomicUsize,
    /// Confirmation barrier: pages below this are initialized.
    committed: AtomicUsize,
    /// Per-page offset from the start of its multi-page unit; 0 for
    /// single-page units and the heads of runs.
    page_offsets: [AtomicU8; ALLOCATABLE_PAGES_IN_CHUNK],
}

impl Chunk {
    /// Reserves address space for a new chunk and eagerly commits its card
    /// table. Returns None when the OS is out of address space or refuses
    /// the card-table commit.
    pub fn create() -> Option<&'static Chunk> {
        // Over-reserve by one page so the working range can be aligned to
        // the allocator page size regardless of what mmap hands back.
        let reserve_bytes = BYTES_IN_CHUNK + BYTES_IN_PAGE;
        let reserve_base = memory::reserve(reserve_bytes)?;
        let base = reserve_base.align_up(BYTES_IN_PAGE);

        if let Err(e) = memory::commit(base, CARD_TABLE_BYTES_IN_CHUNK) {
            log::error!("card table commit failed for new chunk: {}", e);
            let _ = memory::release(reserve_base, reserve_bytes);
            return None;
        }

        let chunk = Box::leak(Box::new(Chunk {
            reserve_base,
            reserve_bytes,
            base,
            next: AtomicPtr::new(std::ptr::null_mut()),
            next_commit: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
            page_offsets: std::array::from_fn(|_| AtomicU8::new(0)),
        }));
        log::info!("new chunk: pages at {}", chunk.pages_start());
        Some(chunk)
    }

    /// Start of the allocatable page region (what the address index keys
    /// this chunk by).
    pub fn pages_start(&self) -> Address {
        self.base + CARD_TABLE_BYTES_IN_CHUNK
    }

    pub fn end(&self) -> Address {
        self.base + BYTES_IN_CHUNK
    }

    pub fn page_at(&self, index: usize) -> Address {
        debug_assert!(index < ALLOCATABLE_PAGES_IN_CHUNK);
        self.pages_start() + (index << LOG_BYTES_IN_PAGE)
    }

    pub fn page_index_of(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.pages_start() && addr < self.end());
        (addr - self.pages_start()) >> LOG_BYTES_IN_PAGE
    }

    pub fn committed_pages(&self) -> usize {
        self.committed.load(Ordering::Acquire)
    }

    /// Offset of page `index` from the head of its multi-page unit.
    pub fn multi_page_offset(&self, index: usize) -> usize {
        self.page_offsets[index].load(Ordering::Relaxed) as usize
    }

    /// Acquires and commits a run of `pages` contiguous page slots.
    ///
    /// Only the thread at the quiescent frontier (`next_commit ==
    /// committed`) may reserve; anyone else spins briefly and retries, so
    /// a commit failure can roll the frontier back with a plain store and
    /// let another thread retry.
    pub fn allocate_page_run(&self, pages: usize) -> Result<Address, ChunkError> {
        debug_assert!(pages >= 1 && pages <= NUM_LARGE_PAGES_MAX);
        loop {
            let committed = self.committed.load(Ordering::Acquire);
            if self.next_commit.load(Ordering::Relaxed) != committed {
                // Another thread is mid-commit.
                std::hint::spin_loop();
                continue;
            }
            if committed + pages > ALLOCATABLE_PAGES_IN_CHUNK {
                return Err(ChunkError::PageGroupFull);
            }
            if self
                .next_commit
                .compare_exchange(
                    committed,
                    committed + pages,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                continue;
            }

            let run_start = self.page_at(committed);
            if let Err(e) = memory::commit(run_start, pages << LOG_BYTES_IN_PAGE) {
                log::error!("page commit failed at {}: {}", run_start, e);
                self.next_commit.store(committed, Ordering::Release);
                return Err(ChunkError::CommitFailed);
            }

            for i in 0..pages {
                self.page_offsets[committed + i].store(i as u8, Ordering::Relaxed);
            }
            // Confirm: from here on every thread may read these pages.
            self.committed.store(committed + pages, Ordering::Release);
            return Ok(run_start);
        }
    }

    /// Finds the head page of the unit containing `addr`, if `addr` falls
    /// inside this chunk's committed page region.
    pub fn locate_head_page(&self, addr: Address) -> Option<Address> {
        if addr < self.pages_start() {
            return None;
        }
        let index = self.page_index_of(addr);
        if index >= self.committed_pages() {
            return None;
        }
        let head_index = index - self.multi_page_offset(index);
        Some(self.page_at(head_index))
    }

    fn card_table(&self) -> &[AtomicU8] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.to_ptr::<AtomicU8>(),
                CARD_TABLE_BYTES_IN_CHUNK,
            )
        }
    }

    /// Records an old-to-young reference in the card covering `addr`.
    pub fn mark_card(&self, addr: Address) {
        let index = card_index(self.base, addr);
        self.card_table()[index].store(1, Ordering::Release);
    }

    /// Visits the address range covered by each dirty card, clearing the
    /// card as it goes.
    pub fn drain_dirty_cards<F: FnMut(Address, Address)>(&self, mut f: F) {
        let table = self.card_table();
        for (index, card) in table.iter().enumerate() {
            if card.load(Ordering::Acquire) != 0 {
                card.store(0, Ordering::Relaxed);
                let start = self.base + (index << LOG_CARD_BYTES);
                f(start, start + CARD_BYTES);
            }
        }
    }

    /// Returns the whole reservation to the OS. Must only run at
    /// shutdown, after every user of the chunk is gone.
    pub(crate) unsafe fn destroy(chunk: *mut Chunk) {
        let chunk = Box::from_raw(chunk);
        if let Err(e) = memory::release(chunk.reserve_base, chunk.reserve_bytes) {
            log::error!("chunk release failed: {}", e);
        }
    }
}

/// Upper bound on pages per multi-page run (the largest large class).
pub const NUM_LARGE_PAGES_MAX: usize = crate::policy::size_class::NUM_LARGE_CLASSES;
