//! Heap geometry constants shared across the crate.

use crate::util::address::ByteSize;

/// log2 of the allocator page size (64 KiB).
pub const LOG_BYTES_IN_PAGE: usize = 16;
/// The allocator page size. Must be a multiple of the OS page size,
/// which is verified at init.
pub const BYTES_IN_PAGE: ByteSize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the chunk size (128 MiB).
pub const LOG_BYTES_IN_CHUNK: usize = 27;
/// One chunk: the unit of address-space reservation.
pub const BYTES_IN_CHUNK: ByteSize = 1 << LOG_BYTES_IN_CHUNK;

/// Pages per chunk, counting the card-table pages at the front.
pub const PAGES_IN_CHUNK: usize = BYTES_IN_CHUNK / BYTES_IN_PAGE;

/// log2 of the card granularity: one card byte covers 512 payload bytes.
pub const LOG_CARD_BYTES: usize = 9;
pub const CARD_BYTES: ByteSize = 1 << LOG_CARD_BYTES;

/// Bytes of card table needed to cover one chunk.
pub const CARD_TABLE_BYTES_IN_CHUNK: ByteSize = BYTES_IN_CHUNK >> LOG_CARD_BYTES;
/// The card table occupies the first pages of each chunk and is
/// committed eagerly when the chunk is created.
pub const CARD_TABLE_PAGES_IN_CHUNK: usize = CARD_TABLE_BYTES_IN_CHUNK / BYTES_IN_PAGE;

/// Pages per chunk actually available to the allocator.
pub const ALLOCATABLE_PAGES_IN_CHUNK: usize = PAGES_IN_CHUNK - CARD_TABLE_PAGES_IN_CHUNK;

/// Base alignment of every unit head and payload.
pub const LOG_UNIT_ALIGN: usize = 3;
pub const UNIT_ALIGN: ByteSize = 1 << LOG_UNIT_ALIGN;

/// Size of the per-unit header preceding each payload.
pub const UNIT_HEAD_BYTES: ByteSize = 16;

/// Size of the page header at the front of every page.
pub const PAGE_HEAD_BYTES: ByteSize = 16;

/// A fresh unit starts at this age and moves one step towards the old
/// generation (age 0) per survived collection cycle.
pub const INITIAL_UNIT_AGE: u8 = 15;

/// The allocation epoch advances modulo this per collection cycle.
pub const EPOCH_MODULO: u8 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_geometry() {
        assert_eq!(PAGES_IN_CHUNK, 2048);
        assert_eq!(CARD_TABLE_BYTES_IN_CHUNK, 256 * 1024);
        assert_eq!(CARD_TABLE_PAGES_IN_CHUNK, 4);
        assert_eq!(ALLOCATABLE_PAGES_IN_CHUNK, 2044);
        assert_eq!(BYTES_IN_CHUNK % BYTES_IN_PAGE, 0);
    }
}
