//! Size classification.
//!
//! Requests are partitioned into 13 small classes (8..=1024 bytes), 8
//! medium classes (1440..=21824), 16 large classes (1..=16 whole pages
//! per object) and HUGE (straight to the OS). Small lookups go through a
//! 129-entry table indexed by `(size + 7) >> 3` so the fast path does not
//! branch; medium sizes fall through a short threshold cascade.

use enum_map::Enum;

use crate::util::constants::*;

/// Unit payload capacities of the small classes.
pub const SMALL_CLASS_SIZES: [usize; 13] =
    [8, 16, 24, 32, 48, 64, 96, 128, 192, 256, 448, 640, 1024];

/// Unit payload capacities of the medium classes.
pub const MEDIUM_CLASS_SIZES: [usize; 8] = [1440, 2032, 3264, 4080, 5448, 8176, 10912, 21824];

pub const NUM_SMALL_CLASSES: usize = SMALL_CLASS_SIZES.len();
pub const NUM_MEDIUM_CLASSES: usize = MEDIUM_CLASS_SIZES.len();
/// Classes that draw from page slabs.
pub const NUM_PAGE_CLASSES: usize = NUM_SMALL_CLASSES + NUM_MEDIUM_CLASSES;
pub const NUM_LARGE_CLASSES: usize = 16;

pub const MAX_SMALL_SIZE: usize = 1024;
pub const MAX_MEDIUM_SIZE: usize = 21824;

/// Head bytes in front of a large unit's payload: a page-shaped head so
/// chunk-index lookup works, plus the unit head itself.
pub const LARGE_HEAD_BYTES: usize = PAGE_HEAD_BYTES + UNIT_HEAD_BYTES;
/// The largest request a 16-page large unit can hold.
pub const MAX_LARGE_SIZE: usize = NUM_LARGE_CLASSES * BYTES_IN_PAGE - LARGE_HEAD_BYTES;

const HUGE_TAG: u8 = (NUM_PAGE_CLASSES + NUM_LARGE_CLASSES) as u8;

// (size + 7) >> 3 for size in 0..=1024 gives 0..=128.
const SMALL_INDEX_ENTRIES: usize = 129;

const SMALL_CLASS_INDEX: [u8; SMALL_INDEX_ENTRIES] = build_small_index();

const fn build_small_index() -> [u8; SMALL_INDEX_ENTRIES] {
    let mut table = [0u8; SMALL_INDEX_ENTRIES];
    let mut entry = 0;
    while entry < SMALL_INDEX_ENTRIES {
        let size = entry * 8;
        let mut class = 0;
        while SMALL_CLASS_SIZES[class] < size {
            class += 1;
        }
        table[entry] = class as u8;
        entry += 1;
    }
    table
}

/// One size class, stored as the page header's one-byte tag.
/// 0..13 small, 13..21 medium, 21..37 large (1..=16 pages), 37 huge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SizeClass(u8);

/// Coarse grouping, used to key allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Enum)]
pub enum SizeGroup {
    Small,
    Medium,
    Large,
    Huge,
}

impl SizeClass {
    pub const HUGE: SizeClass = SizeClass(HUGE_TAG);

    /// Classifies a request size. `alloc(0)` lands in the smallest class.
    pub fn of_size(size: usize) -> SizeClass {
        if size <= MAX_SMALL_SIZE {
            return SizeClass(SMALL_CLASS_INDEX[(size + 7) >> 3]);
        }
        if size <= MAX_MEDIUM_SIZE {
            let mut class = NUM_SMALL_CLASSES;
            for capacity in MEDIUM_CLASS_SIZES {
                if size <= capacity {
                    break;
                }
                class += 1;
            }
            return SizeClass(class as u8);
        }
        if size <= MAX_LARGE_SIZE {
            let pages = (size + LARGE_HEAD_BYTES + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE;
            return SizeClass((NUM_PAGE_CLASSES + pages - 1) as u8);
        }
        SizeClass::HUGE
    }

    pub fn from_tag(tag: u8) -> SizeClass {
        debug_assert!(tag <= HUGE_TAG);
        SizeClass(tag)
    }

    pub const fn tag(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn is_page_class(self) -> bool {
        (self.0 as usize) < NUM_PAGE_CLASSES
    }

    pub const fn is_large(self) -> bool {
        self.0 as usize >= NUM_PAGE_CLASSES && self.0 != HUGE_TAG
    }

    pub const fn is_huge(self) -> bool {
        self.0 == HUGE_TAG
    }

    /// Index into the global large-unit buckets, 0..16.
    pub fn large_index(self) -> usize {
        debug_assert!(self.is_large());
        self.0 as usize - NUM_PAGE_CLASSES
    }

    /// Contiguous pages occupied by a large unit of this class.
    pub fn large_pages(self) -> usize {
        self.large_index() + 1
    }

    /// The payload capacity granted to an object of this class.
    /// Not defined for HUGE, whose capacity is the aligned request.
    pub fn capacity(self) -> usize {
        let index = self.0 as usize;
        if index < NUM_SMALL_CLASSES {
            SMALL_CLASS_SIZES[index]
        } else if index < NUM_PAGE_CLASSES {
            MEDIUM_CLASS_SIZES[index - NUM_SMALL_CLASSES]
        } else {
            debug_assert!(self.is_large());
            self.large_pages() * BYTES_IN_PAGE - LARGE_HEAD_BYTES
        }
    }

    /// Bytes of one `(head, payload)` slot in a page of this class.
    pub fn slot_bytes(self) -> usize {
        debug_assert!(self.is_page_class());
        UNIT_HEAD_BYTES + self.capacity()
    }

    /// How many units fit in one page of this class.
    pub fn units_per_page(self) -> usize {
        (BYTES_IN_PAGE - PAGE_HEAD_BYTES) / self.slot_bytes()
    }

    pub fn group(self) -> SizeGroup {
        let index = self.0 as usize;
        if index < NUM_SMALL_CLASSES {
            SizeGroup::Small
        } else if index < NUM_PAGE_CLASSES {
            SizeGroup::Medium
        } else if index < NUM_PAGE_CLASSES + NUM_LARGE_CLASSES {
            SizeGroup::Large
        } else {
            SizeGroup::Huge
        }
    }

    /// Whether realloc between the two classes may keep the allocation in
    /// place: both page-or-large classes fewer than two steps apart.
    pub fn is_close_to(self, other: SizeClass) -> bool {
        if self.is_huge() || other.is_huge() {
            return false;
        }
        self.0.abs_diff(other.0) < 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_classification() {
        assert_eq!(SizeClass::of_size(0).capacity(), 8);
        assert_eq!(SizeClass::of_size(1).capacity(), 8);
        assert_eq!(SizeClass::of_size(8).capacity(), 8);
        assert_eq!(SizeClass::of_size(9).capacity(), 16);
        assert_eq!(SizeClass::of_size(100).capacity(), 128);
        assert_eq!(SizeClass::of_size(1024).capacity(), 1024);
        assert!(SizeClass::of_size(1024).is_page_class());
    }

    #[test]
    fn medium_classification() {
        assert_eq!(SizeClass::of_size(1025).capacity(), 1440);
        assert_eq!(SizeClass::of_size(1440).capacity(), 1440);
        assert_eq!(SizeClass::of_size(1441).capacity(), 2032);
        assert_eq!(SizeClass::of_size(21824).capacity(), 21824);
        assert!(SizeClass::of_size(21824).is_page_class());
    }

    #[test]
    fn large_classification() {
        let first_large = SizeClass::of_size(MAX_MEDIUM_SIZE + 1);
        assert!(first_large.is_large());
        assert_eq!(first_large.large_pages(), 1);

        // The 16-page boundary: one byte past the LARGE_16 capacity is huge.
        let at_boundary = SizeClass::of_size(16 * BYTES_IN_PAGE - LARGE_HEAD_BYTES);
        assert!(at_boundary.is_large());
        assert_eq!(at_boundary.large_pages(), 16);
        assert!(SizeClass::of_size(16 * BYTES_IN_PAGE - LARGE_HEAD_BYTES + 1).is_huge());
        assert!(SizeClass::of_size(16 * BYTES_IN_PAGE).is_huge());
    }

    #[test]
    fn page_slot_geometry() {
        for tag in 0..NUM_PAGE_CLASSES {
            let class = SizeClass::from_tag(tag as u8);
            let units = class.units_per_page();
            assert!(units >= 1, "class {:?} fits no units", class);
            assert!(PAGE_HEAD_BYTES + units * class.slot_bytes() <= BYTES_IN_PAGE);
            assert_eq!(class.slot_bytes() % UNIT_ALIGN, 0);
        }
    }

    #[test]
    fn class_distance() {
        let a = SizeClass::of_size(64);
        let b = SizeClass::of_size(96);
        let c = SizeClass::of_size(1024);
        assert!(a.is_close_to(a));
        assert!(a.is_close_to(b));
        assert!(!a.is_close_to(c));
        assert!(!SizeClass::HUGE.is_close_to(SizeClass::HUGE));
    }
}
