//! Large units: single objects spanning 1..=16 contiguous pages.
//!
//! The unit starts with a page-shaped head so chunk-index lookup treats
//! it like any page, followed by the unit head and the payload. Freed
//! large units are stacked per class in the global pool, chained through
//! the page head's link field.

use crate::policy::page::Page;
use crate::policy::size_class::{SizeClass, LARGE_HEAD_BYTES};
use crate::policy::unit::Unit;
use crate::util::constants::*;
use crate::util::Address;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct LargeUnit(Address);

impl LargeUnit {
    pub fn from_start(addr: Address) -> LargeUnit {
        debug_assert!(addr.is_aligned_to(BYTES_IN_PAGE));
        LargeUnit(addr)
    }

    pub fn from_unit(unit: Unit) -> LargeUnit {
        LargeUnit(unit.head_address() - PAGE_HEAD_BYTES)
    }

    pub fn start(self) -> Address {
        self.0
    }

    /// The page-shaped head fronting the unit; its link field doubles as
    /// the free-stack chain.
    pub fn page_head(self) -> Page {
        Page::from_address(self.0)
    }

    pub fn unit(self) -> Unit {
        Unit::from_head_address(self.0 + PAGE_HEAD_BYTES)
    }

    pub fn payload(self) -> Address {
        self.0 + LARGE_HEAD_BYTES
    }

    pub fn size_class(self) -> SizeClass {
        self.page_head().size_class()
    }

    /// Writes the page-shaped head of a freshly committed run. The unit
    /// head is published separately by the allocation path.
    pub fn init(self, page_index: u16, class: SizeClass) {
        debug_assert!(class.is_large());
        self.page_head().init_head_only(page_index, class);
    }
}
