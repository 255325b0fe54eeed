//! 64 KiB page slabs.
//!
//! A page starts with a 16-byte header and is otherwise packed with
//! equal-sized `(UnitHead, payload)` slots of one size class:
//!
//! ```text
//! offset 0   link: next page (free-page stacks, thread caches) or, when
//!            the head fronts a large unit, the next free large unit
//! offset 8   page index within the owning chunk
//! offset 10  size-class tag
//! offset 11  abandoned flag (atomic)
//! offset 12  head of the async returned-unit list (atomic)
//! offset 14  head of the next-to-allocate unit chain (owner thread only)
//! ```
//!
//! Unit positions are encoded as 16-bit links: the head's byte offset
//! within the page shifted right by 3. Zero terminates a chain; no unit
//! head can sit at offset zero because the page header is there.
//!
//! Allocation from a page happens only on the thread that currently owns
//! it. Any thread may return units through the atomic returned-list; the
//! owner merges that list into its private chain when the chain runs dry.

use atomic::Ordering;
use std::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize};

use crate::policy::size_class::SizeClass;
use crate::policy::unit::{MarkState, Unit};
use crate::util::constants::*;
use crate::util::Address;

const LINK_OFFSET: usize = 0;
const INDEX_OFFSET: usize = 8;
const CLASS_OFFSET: usize = 10;
const ABANDONED_OFFSET: usize = 11;
const RETURNED_OFFSET: usize = 12;
const NEXT_ALLOC_OFFSET: usize = 14;

/// A page, addressed by its base. Also used as the page-shaped head of a
/// large unit, which reuses the link, index and class fields so that
/// chunk-index lookup treats both uniformly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Page(Address);

impl Page {
    /// The "no page" sentinel.
    pub const ZERO: Page = Page(Address::ZERO);

    pub fn from_address(addr: Address) -> Page {
        debug_assert!(addr.is_aligned_to(UNIT_ALIGN));
        Page(addr)
    }

    pub fn start(self) -> Address {
        self.0
    }

    pub fn end(self) -> Address {
        self.0 + BYTES_IN_PAGE
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    fn link_atomic(self) -> &'static AtomicUsize {
        unsafe { (self.0 + LINK_OFFSET).as_atomic::<AtomicUsize>() }
    }

    pub fn link(self) -> Address {
        unsafe { Address::from_usize(self.link_atomic().load(Ordering::Relaxed)) }
    }

    pub fn set_link(self, next: Address) {
        self.link_atomic().store(next.as_usize(), Ordering::Relaxed)
    }

    pub fn index(self) -> u16 {
        unsafe { (self.0 + INDEX_OFFSET).load::<u16>() }
    }

    pub fn size_class(self) -> SizeClass {
        SizeClass::from_tag(unsafe { (self.0 + CLASS_OFFSET).load::<u8>() })
    }

    fn abandoned_atomic(self) -> &'static AtomicU8 {
        unsafe { (self.0 + ABANDONED_OFFSET).as_atomic::<AtomicU8>() }
    }

    pub fn is_abandoned(self) -> bool {
        self.abandoned_atomic().load(Ordering::Acquire) != 0
    }

    pub fn set_abandoned(self, abandoned: bool) {
        self.abandoned_atomic()
            .store(abandoned as u8, Ordering::Release)
    }

    fn returned_atomic(self) -> &'static AtomicU16 {
        unsafe { (self.0 + RETURNED_OFFSET).as_atomic::<AtomicU16>() }
    }

    /// Encodes a unit head position as a 16-bit chain link.
    pub fn offset_of(self, unit: Unit) -> u16 {
        let byte_offset = unit.head_address() - self.0;
        debug_assert!(byte_offset >= PAGE_HEAD_BYTES && byte_offset < BYTES_IN_PAGE);
        (byte_offset >> LOG_UNIT_ALIGN) as u16
    }

    /// Decodes a 16-bit chain link. Zero is not a valid link.
    pub fn unit_at(self, offset: u16) -> Unit {
        debug_assert_ne!(offset, 0);
        Unit::from_head_address(self.0 + ((offset as usize) << LOG_UNIT_ALIGN))
    }

    /// Writes just the header fields. Used directly for the page-shaped
    /// heads of large and huge units, which have no slab to carve.
    pub fn init_head_only(self, index: u16, class: SizeClass) {
        unsafe {
            (self.0 + INDEX_OFFSET).store::<u16>(index);
            (self.0 + CLASS_OFFSET).store::<u8>(class.tag());
        }
        self.set_link(Address::ZERO);
        self.abandoned_atomic().store(0, Ordering::Relaxed);
        self.returned_atomic().store(0, Ordering::Relaxed);
        self.set_next_alloc_head(0);
    }

    /// Writes the page header and threads every slot onto the
    /// next-to-allocate chain. Reinitializes recycled pages as well, so
    /// it must only run while no other thread can reach the page.
    pub fn init(self, index: u16, class: SizeClass) {
        debug_assert!(class.is_page_class());
        self.init_head_only(index, class);

        let slot = class.slot_bytes();
        let units = class.units_per_page();
        let mut chain: u16 = 0;
        // Thread the slots back to front so the chain hands them out in
        // address order.
        for i in (0..units).rev() {
            let unit = Unit::from_head_address(self.0 + PAGE_HEAD_BYTES + i * slot);
            unit.set_mark(MarkState::Released, Ordering::Relaxed);
            unit.set_next_free(chain);
            chain = self.offset_of(unit);
        }
        self.set_next_alloc_head(chain);
    }

    /// Head of the owner thread's allocation chain. Only meaningful while
    /// the page sits in the global pool or is being adopted by a thread.
    pub fn next_alloc_head(self) -> u16 {
        unsafe { (self.0 + NEXT_ALLOC_OFFSET).load::<u16>() }
    }

    pub fn set_next_alloc_head(self, head: u16) {
        unsafe { (self.0 + NEXT_ALLOC_OFFSET).store::<u16>(head) }
    }

    /// Atomically prepends a released unit to the returned list. Called by
    /// threads that do not own the page, and by the sweeper.
    pub fn push_returned(self, unit: Unit) {
        debug_assert_eq!(unit.mark(Ordering::Relaxed), MarkState::Released);
        let offset = self.offset_of(unit);
        let returned = self.returned_atomic();
        let mut head = returned.load(Ordering::Relaxed);
        loop {
            unit.set_next_free(head);
            match returned.compare_exchange_weak(head, offset, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    /// Takes the whole returned list, leaving it empty. Owner thread only.
    pub fn take_returned(self) -> u16 {
        self.returned_atomic().swap(0, Ordering::AcqRel)
    }

    /// Whether any unit of the page is still allocated. Used by the
    /// sweeper to decide if an abandoned page can go back to the pool.
    pub fn has_live_units(self) -> bool {
        let class = self.size_class();
        let slot = class.slot_bytes();
        (0..class.units_per_page()).any(|i| {
            let unit = Unit::from_head_address(self.0 + PAGE_HEAD_BYTES + i * slot);
            unit.mark(Ordering::Acquire) != MarkState::Released
        })
    }

    /// Visits every unit slot of the page.
    pub fn for_each_unit<F: FnMut(Unit)>(self, mut f: F) {
        let class = self.size_class();
        let slot = class.slot_bytes();
        for i in 0..class.units_per_page() {
            f(Unit::from_head_address(self.0 + PAGE_HEAD_BYTES + i * slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::memory;

    fn fresh_page(class: SizeClass) -> Page {
        let addr = memory::reserve(BYTES_IN_PAGE * 2).unwrap();
        let base = addr.align_up(BYTES_IN_PAGE);
        memory::commit(base, BYTES_IN_PAGE).unwrap();
        let page = Page::from_address(base);
        page.init(7, class);
        page
    }

    #[test]
    fn init_threads_all_units() {
        let class = SizeClass::of_size(64);
        let page = fresh_page(class);
        assert_eq!(page.index(), 7);
        assert_eq!(page.size_class(), class);

        let mut count = 0;
        let mut cursor = page.next_alloc_head();
        let mut prev = Address::ZERO;
        while cursor != 0 {
            let unit = page.unit_at(cursor);
            assert_eq!(unit.mark(Ordering::Relaxed), MarkState::Released);
            assert!(unit.head_address() > prev, "chain must be address ordered");
            prev = unit.head_address();
            cursor = unit.next_free();
            count += 1;
        }
        assert_eq!(count, class.units_per_page());
        assert!(!page.has_live_units());
    }

    #[test]
    fn offset_encoding_round_trips() {
        let class = SizeClass::of_size(8);
        let page = fresh_page(class);
        let head = page.next_alloc_head();
        let unit = page.unit_at(head);
        assert_eq!(page.offset_of(unit), head);
        assert_eq!(unit.head_address() - page.start(), PAGE_HEAD_BYTES);
    }

    #[test]
    fn returned_list_collects_async_frees() {
        let class = SizeClass::of_size(128);
        let page = fresh_page(class);
        let a = page.unit_at(page.next_alloc_head());
        let b = Unit::from_head_address(a.head_address() + class.slot_bytes());

        page.push_returned(a);
        page.push_returned(b);

        // LIFO: b is the head, linking to a, terminated by zero.
        let head = page.take_returned();
        let first = page.unit_at(head);
        assert_eq!(first, b);
        assert_eq!(page.unit_at(first.next_free()), a);
        assert_eq!(page.unit_at(first.next_free()).next_free(), 0);
        assert_eq!(page.take_returned(), 0);
    }
}
