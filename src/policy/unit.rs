//! Per-object unit heads.
//!
//! Every allocation is preceded by a 16-byte `UnitHead`:
//!
//! ```text
//! offset 0   owner page address (0 for large and huge units)
//! offset 8   allocation epoch (low nibble) and GC-type mask (high nibble)
//! offset 9   GC age
//! offset 10  mark state (atomic)
//! offset 12  link to the next free unit, as a within-page offset
//! ```
//!
//! The head is published in a precise order: all non-atomic fields first,
//! then the mark state with Release. A reader that observes a mark other
//! than `Released` therefore also observes initialized metadata.

use atomic::Ordering;
use std::sync::atomic::AtomicU8;

use crate::util::constants::*;
use crate::util::Address;

/// The mark state of one unit. `Released` doubles as "this slot is free".
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum MarkState {
    Released = 0,
    /// Allocated, not visited this cycle.
    Unmarked = 1,
    /// Gray: reached, children not yet traced.
    SelfMarked = 2,
    /// Black: reached and children enqueued.
    FullMarked = 3,
}

impl From<u8> for MarkState {
    fn from(raw: u8) -> Self {
        match raw {
            0 => MarkState::Released,
            1 => MarkState::Unmarked,
            2 => MarkState::SelfMarked,
            3 => MarkState::FullMarked,
            _ => unreachable!("invalid mark byte {}", raw),
        }
    }
}

/// The GC-type mask: a bit set over the four per-unit GC behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitKindMask(u8);

impl UnitKindMask {
    /// Subject to reclamation when unmarked at the end of a cycle.
    pub const NEED_SWEEP: UnitKindMask = UnitKindMask(1 << 0);
    /// Payload is scanned conservatively for pointer-shaped slots.
    pub const AUTO_MARK: UnitKindMask = UnitKindMask(1 << 1);
    /// The registered marker callback runs when the unit is reached.
    pub const HAS_MARKER: UnitKindMask = UnitKindMask(1 << 2);
    /// The registered destroyer runs before reclamation.
    pub const HAS_FINALIZER: UnitKindMask = UnitKindMask(1 << 3);

    pub const NONE: UnitKindMask = UnitKindMask(0);

    pub const fn union(self, other: UnitKindMask) -> UnitKindMask {
        UnitKindMask(self.0 | other.0)
    }

    pub const fn contains(self, other: UnitKindMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> UnitKindMask {
        UnitKindMask(bits & 0xf)
    }
}

impl std::ops::BitOr for UnitKindMask {
    type Output = UnitKindMask;
    fn bitor(self, rhs: UnitKindMask) -> UnitKindMask {
        self.union(rhs)
    }
}

/// One unit, addressed by its head. All header access goes through this
/// type; nothing else in the crate touches head bytes directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Unit(Address);

const OWNER_PAGE_OFFSET: usize = 0;
const EPOCH_KIND_OFFSET: usize = 8;
const AGE_OFFSET: usize = 9;
const MARK_OFFSET: usize = 10;
const NEXT_FREE_OFFSET: usize = 12;

impl Unit {
    pub fn from_head_address(addr: Address) -> Unit {
        debug_assert!(addr.is_aligned_to(UNIT_ALIGN));
        Unit(addr)
    }

    /// The unit whose payload starts at `payload`.
    pub fn from_payload(payload: Address) -> Unit {
        Unit(payload - UNIT_HEAD_BYTES)
    }

    pub fn head_address(self) -> Address {
        self.0
    }

    pub fn payload(self) -> Address {
        self.0 + UNIT_HEAD_BYTES
    }

    /// The owning page's base address, or zero for large and huge units.
    pub fn owner_page_address(self) -> Address {
        unsafe { Address::from_usize((self.0 + OWNER_PAGE_OFFSET).load::<usize>()) }
    }

    pub fn set_owner_page_address(self, page: Address) {
        unsafe { (self.0 + OWNER_PAGE_OFFSET).store::<usize>(page.as_usize()) }
    }

    pub fn epoch(self) -> u8 {
        unsafe { (self.0 + EPOCH_KIND_OFFSET).load::<u8>() & 0xf }
    }

    pub fn kind(self) -> UnitKindMask {
        UnitKindMask::from_bits(unsafe { (self.0 + EPOCH_KIND_OFFSET).load::<u8>() } >> 4)
    }

    pub fn set_epoch_and_kind(self, epoch: u8, kind: UnitKindMask) {
        debug_assert!(epoch < EPOCH_MODULO);
        unsafe { (self.0 + EPOCH_KIND_OFFSET).store::<u8>(epoch & 0xf | kind.bits() << 4) }
    }

    pub fn age(self) -> u8 {
        unsafe { (self.0 + AGE_OFFSET).load::<u8>() }
    }

    pub fn set_age(self, age: u8) {
        unsafe { (self.0 + AGE_OFFSET).store::<u8>(age) }
    }

    pub fn is_old_generation(self) -> bool {
        self.age() == 0
    }

    fn mark_atomic(self) -> &'static AtomicU8 {
        unsafe { (self.0 + MARK_OFFSET).as_atomic::<AtomicU8>() }
    }

    pub fn mark(self, ordering: Ordering) -> MarkState {
        self.mark_atomic().load(ordering).into()
    }

    pub fn set_mark(self, state: MarkState, ordering: Ordering) {
        self.mark_atomic().store(state as u8, ordering)
    }

    /// Single mark transition. Fails if the current state is not `from`.
    pub fn transition_mark(
        self,
        from: MarkState,
        to: MarkState,
        success: Ordering,
        failure: Ordering,
    ) -> bool {
        self.mark_atomic()
            .compare_exchange(from as u8, to as u8, success, failure)
            .is_ok()
    }

    /// Transition to `Released` from whatever live state the unit is in.
    /// Returns the previous state, or None if the unit was already
    /// released (a double free or a lost race against the sweeper).
    pub fn try_release(self) -> Option<MarkState> {
        let atomic = self.mark_atomic();
        let mut current = atomic.load(Ordering::Relaxed);
        loop {
            if current == MarkState::Released as u8 {
                return None;
            }
            match atomic.compare_exchange_weak(
                current,
                MarkState::Released as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current.into()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn next_free(self) -> u16 {
        unsafe { (self.0 + NEXT_FREE_OFFSET).load::<u16>() }
    }

    pub fn set_next_free(self, offset: u16) {
        unsafe { (self.0 + NEXT_FREE_OFFSET).store::<u16>(offset) }
    }

    /// The size class of the storage backing this unit, derived from its
    /// owning page or, for large and huge units, the page-shaped head
    /// directly in front of it.
    pub fn containing_class(self) -> crate::policy::size_class::SizeClass {
        let owner = self.owner_page_address();
        if !owner.is_zero() {
            return crate::policy::page::Page::from_address(owner).size_class();
        }
        crate::policy::page::Page::from_address(self.0 - PAGE_HEAD_BYTES).size_class()
    }

    /// The payload capacity granted to this unit.
    pub fn payload_capacity(self) -> usize {
        let class = self.containing_class();
        if class.is_huge() {
            crate::policy::huge::HugeUnit::from_unit(self).aligned_size()
        } else {
            class.capacity()
        }
    }

    /// Fills in the head of a freshly allocated unit and publishes it.
    /// The Release store of the mark is what makes the rest visible.
    pub fn publish_allocated(self, owner_page: Address, epoch: u8, kind: UnitKindMask) {
        self.set_owner_page_address(owner_page);
        self.set_epoch_and_kind(epoch, kind);
        self.set_age(INITIAL_UNIT_AGE);
        self.set_next_free(0);
        self.set_mark(MarkState::Unmarked, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_unit(buf: &mut [u64; 8]) -> Unit {
        Unit::from_head_address(Address::from_mut_ptr(buf.as_mut_ptr()))
    }

    #[test]
    fn kind_mask_ops() {
        let mask = UnitKindMask::NEED_SWEEP | UnitKindMask::HAS_FINALIZER;
        assert!(mask.contains(UnitKindMask::NEED_SWEEP));
        assert!(mask.contains(UnitKindMask::HAS_FINALIZER));
        assert!(!mask.contains(UnitKindMask::AUTO_MARK));
        assert_eq!(UnitKindMask::from_bits(mask.bits()), mask);
    }

    #[test]
    fn head_round_trip() {
        let mut buf = [0u64; 8];
        let unit = scratch_unit(&mut buf);
        unit.publish_allocated(Address::ZERO, 3, UnitKindMask::AUTO_MARK);
        assert_eq!(unit.epoch(), 3);
        assert_eq!(unit.kind(), UnitKindMask::AUTO_MARK);
        assert_eq!(unit.age(), INITIAL_UNIT_AGE);
        assert_eq!(unit.mark(Ordering::Acquire), MarkState::Unmarked);
        assert_eq!(unit.payload() - unit.head_address(), UNIT_HEAD_BYTES);
        assert_eq!(Unit::from_payload(unit.payload()), unit);
    }

    #[test]
    fn release_detects_double_free() {
        let mut buf = [0u64; 8];
        let unit = scratch_unit(&mut buf);
        unit.publish_allocated(Address::ZERO, 0, UnitKindMask::NONE);
        assert_eq!(unit.try_release(), Some(MarkState::Unmarked));
        assert_eq!(unit.try_release(), None);
    }

    #[test]
    fn mark_transitions() {
        let mut buf = [0u64; 8];
        let unit = scratch_unit(&mut buf);
        unit.publish_allocated(Address::ZERO, 0, UnitKindMask::NEED_SWEEP);
        assert!(unit.transition_mark(
            MarkState::Unmarked,
            MarkState::SelfMarked,
            Ordering::AcqRel,
            Ordering::Relaxed
        ));
        // A second try_mark of the same cycle must lose.
        assert!(!unit.transition_mark(
            MarkState::Unmarked,
            MarkState::SelfMarked,
            Ordering::AcqRel,
            Ordering::Relaxed
        ));
    }
}
