//! Huge units: single objects too big for a 16-page large unit.
//!
//! Each one is its own OS allocation, laid out as
//!
//! ```text
//! huge head (32 bytes): walk-list link, exact size, aligned size,
//!                       card-table address
//! page-shaped head (16 bytes), tagged HUGE
//! unit head (16 bytes), owner page zero
//! payload (aligned size bytes)
//! card table (one byte per 512 payload bytes)
//! ```
//!
//! Huge units hang off the global walk list so the sweeper can find
//! them; only the sweeper compacts that list. They are registered in the
//! address index keyed by their payload start.

use atomic::Ordering;
use std::sync::atomic::AtomicUsize;

use crate::policy::page::Page;
use crate::policy::size_class::SizeClass;
use crate::policy::unit::Unit;
use crate::util::constants::*;
use crate::util::conversions::{card_index, raw_align_up};
use crate::util::{memory, Address};

const EXACT_SIZE_OFFSET: usize = 8;
const ALIGNED_SIZE_OFFSET: usize = 16;
const CARD_TABLE_OFFSET: usize = 24;

/// Bytes in front of a huge unit's payload.
pub const HUGE_HEAD_BYTES: usize = 32;
pub const HUGE_TOTAL_HEAD_BYTES: usize = HUGE_HEAD_BYTES + PAGE_HEAD_BYTES + UNIT_HEAD_BYTES;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct HugeUnit(Address);

impl HugeUnit {
    pub fn from_start(addr: Address) -> HugeUnit {
        HugeUnit(addr)
    }

    pub fn from_unit(unit: Unit) -> HugeUnit {
        HugeUnit(unit.head_address() - PAGE_HEAD_BYTES - HUGE_HEAD_BYTES)
    }

    pub fn from_payload(payload: Address) -> HugeUnit {
        HugeUnit(payload - HUGE_TOTAL_HEAD_BYTES)
    }

    pub fn start(self) -> Address {
        self.0
    }

    pub fn page_head(self) -> Page {
        Page::from_address(self.0 + HUGE_HEAD_BYTES)
    }

    pub fn unit(self) -> Unit {
        Unit::from_head_address(self.0 + HUGE_HEAD_BYTES + PAGE_HEAD_BYTES)
    }

    pub fn payload(self) -> Address {
        self.0 + HUGE_TOTAL_HEAD_BYTES
    }

    /// Walk-list link to the next huge unit, zero-terminated.
    pub fn link_atomic(&self) -> &AtomicUsize {
        unsafe { self.0.as_atomic::<AtomicUsize>() }
    }

    pub fn next(self) -> Option<HugeUnit> {
        let raw = self.link_atomic().load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(HugeUnit(unsafe { Address::from_usize(raw) }))
        }
    }

    /// The host-visible size, kept up to date by in-place reallocs.
    pub fn exact_size(self) -> usize {
        unsafe { (self.0 + EXACT_SIZE_OFFSET).load::<usize>() }
    }

    pub fn set_exact_size(self, size: usize) {
        unsafe { (self.0 + EXACT_SIZE_OFFSET).store::<usize>(size) }
    }

    /// The payload capacity this allocation can hold.
    pub fn aligned_size(self) -> usize {
        unsafe { (self.0 + ALIGNED_SIZE_OFFSET).load::<usize>() }
    }

    fn card_table_start(self) -> Address {
        unsafe { Address::from_usize((self.0 + CARD_TABLE_OFFSET).load::<usize>()) }
    }

    /// Total bytes of the OS allocation backing this unit.
    pub fn footprint(self) -> usize {
        huge_footprint(self.aligned_size())
    }

    /// Records an old-to-young reference in the unit's own card table.
    pub fn mark_card(self, addr: Address) {
        let index = card_index(self.payload(), addr);
        unsafe { (self.card_table_start() + index).store::<u8>(1) }
    }

    /// Visits and clears dirty cards, like the chunk equivalent.
    pub fn drain_dirty_cards<F: FnMut(Address, Address)>(self, mut f: F) {
        let cards = huge_card_bytes(self.aligned_size());
        let table = self.card_table_start();
        for index in 0..cards {
            let card = table + index;
            if unsafe { card.load::<u8>() } != 0 {
                unsafe { card.store::<u8>(0) };
                let start = self.payload() + (index << LOG_CARD_BYTES);
                f(start, start + CARD_BYTES);
            }
        }
    }

    /// Maps and lays out a new huge unit for a `size`-byte object. The
    /// unit head is published separately by the allocation path.
    pub fn create(size: usize) -> Option<HugeUnit> {
        let aligned = raw_align_up(size.max(1), UNIT_ALIGN);
        let footprint = huge_footprint(aligned);
        let base = memory::reserve(footprint)?;
        if let Err(e) = memory::commit(base, footprint) {
            log::error!("huge commit of {} bytes failed: {}", footprint, e);
            let _ = memory::release(base, footprint);
            return None;
        }

        let huge = HugeUnit(base);
        huge.link_atomic().store(0, Ordering::Relaxed);
        huge.set_exact_size(size);
        unsafe {
            (base + ALIGNED_SIZE_OFFSET).store::<usize>(aligned);
            (base + CARD_TABLE_OFFSET).store::<usize>((huge.payload() + aligned).as_usize());
        }
        huge.page_head().init_head_only(0, SizeClass::HUGE);
        Some(huge)
    }

    /// Returns the unit's memory to the OS. The caller must already have
    /// unregistered it from the index and spliced the walk list.
    pub fn destroy(self) {
        let footprint = self.footprint();
        if let Err(e) = memory::release(self.0, footprint) {
            log::error!("huge release failed at {}: {}", self.0, e);
        }
    }
}

pub fn huge_card_bytes(aligned_size: usize) -> usize {
    (aligned_size >> LOG_CARD_BYTES) + 1
}

fn huge_footprint(aligned_size: usize) -> usize {
    HUGE_TOTAL_HEAD_BYTES + aligned_size + huge_card_bytes(aligned_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::unit::UnitKindMask;

    #[test]
    fn layout_and_size_round_trip() {
        let huge = HugeUnit::create(100_000).unwrap();
        assert_eq!(huge.exact_size(), 100_000);
        assert_eq!(huge.aligned_size(), 100_000);
        assert_eq!(huge.payload() - huge.start(), HUGE_TOTAL_HEAD_BYTES);
        assert_eq!(HugeUnit::from_payload(huge.payload()), huge);
        assert_eq!(HugeUnit::from_unit(huge.unit()), huge);
        assert!(huge.page_head().size_class().is_huge());

        huge.unit()
            .publish_allocated(Address::ZERO, 0, UnitKindMask::NONE);
        unsafe {
            huge.payload().store::<u64>(99);
            assert_eq!(huge.payload().load::<u64>(), 99);
        }
        huge.destroy();
    }

    #[test]
    fn own_card_table() {
        let huge = HugeUnit::create(4096).unwrap();
        huge.mark_card(huge.payload() + 513usize);
        let mut seen = 0;
        huge.drain_dirty_cards(|start, _| {
            assert_eq!(start, huge.payload() + 512usize);
            seen += 1;
        });
        assert_eq!(seen, 1);
        huge.destroy();
    }
}
