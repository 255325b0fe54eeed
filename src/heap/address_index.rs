//! Pointer validation: an ordered map from base addresses to owning
//! regions.
//!
//! The index holds one entry per live chunk (keyed by its page-region
//! start) and one per outstanding huge unit (keyed by its payload
//! start). Conservative marking throws arbitrary words at `find`; only
//! addresses that land inside a known region, past its header area,
//! resolve to a unit head. Whether that unit is live is the caller's
//! question, answered by the unit's mark state.
//!
//! Readers vastly outnumber writers (chunk creation and huge-unit
//! registration are rare), so the map sits behind a reader-writer
//! spinlock.

use std::collections::BTreeMap;

use crate::policy::chunk::Chunk;
use crate::policy::huge::HugeUnit;
use crate::policy::page::Page;
use crate::policy::unit::Unit;
use crate::util::constants::*;
use crate::util::Address;

#[derive(Clone, Copy)]
enum Slot {
    Chunk(&'static Chunk),
    Huge(HugeUnit),
}

/// Where a resolved address lives, and its canonical unit head.
#[derive(Clone, Copy)]
pub enum Resolved {
    /// A small or medium unit, with its owning page and chunk.
    Pooled(Unit, Page, &'static Chunk),
    /// The embedded unit of a large multi-page run.
    Large(Unit, &'static Chunk),
    /// A huge unit.
    Huge(Unit, HugeUnit),
}

impl Resolved {
    pub fn unit(self) -> Unit {
        match self {
            Resolved::Pooled(unit, _, _) => unit,
            Resolved::Large(unit, _) => unit,
            Resolved::Huge(unit, _) => unit,
        }
    }

    /// Records an old-to-young reference in the card covering `addr`
    /// within this unit's region.
    pub fn mark_card(self, addr: Address) {
        match self {
            Resolved::Pooled(_, _, chunk) | Resolved::Large(_, chunk) => chunk.mark_card(addr),
            Resolved::Huge(_, huge) => huge.mark_card(addr),
        }
    }
}

pub struct AddressIndex {
    map: spin::RwLock<BTreeMap<Address, Slot>>,
}

impl AddressIndex {
    pub fn new() -> AddressIndex {
        AddressIndex {
            map: spin::RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert_chunk(&self, chunk: &'static Chunk) {
        self.map
            .write()
            .insert(chunk.pages_start(), Slot::Chunk(chunk));
    }

    pub fn insert_huge(&self, huge: HugeUnit) {
        self.map.write().insert(huge.payload(), Slot::Huge(huge));
    }

    pub fn remove_huge(&self, huge: HugeUnit) {
        self.map.write().remove(&huge.payload());
    }

    pub fn clear(&self) {
        self.map.write().clear();
    }

    /// Resolves a possibly wild address to the unit containing it.
    pub fn find(&self, addr: Address) -> Option<Resolved> {
        if addr.is_zero() {
            return None;
        }
        let map = self.map.read();
        let (&base, &slot) = map.range(..=addr).next_back()?;
        match slot {
            Slot::Chunk(chunk) => {
                if addr >= chunk.end() {
                    return None;
                }
                let head = chunk.locate_head_page(addr)?;
                resolve_in_page(Page::from_address(head), addr, chunk)
            }
            Slot::Huge(huge) => {
                if addr - base >= huge.exact_size() {
                    return None;
                }
                Some(Resolved::Huge(huge.unit(), huge))
            }
        }
    }
}

impl Default for AddressIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_in_page(page: Page, addr: Address, chunk: &'static Chunk) -> Option<Resolved> {
    let class = page.size_class();
    if class.is_large() {
        // Anywhere inside the run past the heads resolves to the one
        // embedded unit.
        if addr < page.start() + PAGE_HEAD_BYTES {
            return None;
        }
        return Some(Resolved::Large(
            Unit::from_head_address(page.start() + PAGE_HEAD_BYTES),
            chunk,
        ));
    }
    if !class.is_page_class() {
        return None;
    }
    let first_unit = page.start() + PAGE_HEAD_BYTES;
    if addr < first_unit {
        return None;
    }
    let slot_index = (addr - first_unit) / class.slot_bytes();
    if slot_index >= class.units_per_page() {
        // Inside the page's unused tail.
        return None;
    }
    let unit = Unit::from_head_address(first_unit + slot_index * class.slot_bytes());
    Some(Resolved::Pooled(unit, page, chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::size_class::SizeClass;

    #[test]
    fn resolves_pooled_units() {
        let index = AddressIndex::new();
        let chunk = Chunk::create().unwrap();
        index.insert_chunk(chunk);

        let class = SizeClass::of_size(64);
        let page_addr = chunk.allocate_page_run(1).unwrap();
        let page = Page::from_address(page_addr);
        page.init(0, class);

        let unit = page.unit_at(page.next_alloc_head());
        // The payload start, an interior pointer, and the head itself all
        // resolve to the same unit.
        for probe in [
            unit.payload(),
            unit.payload() + 63usize,
            unit.head_address(),
        ] {
            match index.find(probe) {
                Some(Resolved::Pooled(found, found_page, _)) => {
                    assert_eq!(found, unit);
                    assert_eq!(found_page, page);
                }
                _ => panic!("probe {} did not resolve to a pooled unit", probe),
            }
        }

        // The page header area and uncommitted pages resolve to nothing.
        assert!(index.find(page_addr + 3usize).is_none());
        assert!(index.find(chunk.page_at(50) + 8usize).is_none());
        // As do addresses outside every region.
        assert!(index.find(chunk.end() + 1000usize).is_none());
        assert!(index.find(Address::ZERO).is_none());
    }

    #[test]
    fn resolves_huge_by_exact_size() {
        let index = AddressIndex::new();
        let huge = HugeUnit::create(10_000).unwrap();
        index.insert_huge(huge);

        match index.find(huge.payload() + 9_999usize) {
            Some(Resolved::Huge(found, found_huge)) => {
                assert_eq!(found, huge.unit());
                assert_eq!(found_huge, huge);
            }
            _ => panic!("interior huge pointer did not resolve"),
        }
        // One byte past the recorded exact size misses.
        assert!(index.find(huge.payload() + 10_000usize).is_none());

        index.remove_huge(huge);
        assert!(index.find(huge.payload()).is_none());
        huge.destroy();
    }
}
