//! # Store Primitives
//!
//! Hardcoded layout constants for the Tessera store.
//!
//! These values are compiled into the binary. Changing any of the
//! well-known addresses or the block format is a breaking change to the
//! on-disk layout and requires a new format version.

/// Address of the root record (index roots and counters).
pub const ROOT_ADDRESS: u64 = 0;

/// Address of the schema record.
pub const SCHEMA_ADDRESS: u64 = 1;

/// First address handed out to index pages.
pub const FIRST_PAGE_ADDRESS: u64 = 2;

/// Magic bytes framing every stored block.
pub const BLOCK_MAGIC: &[u8; 4] = b"TSBK";

/// Current block format version.
///
/// Increment this when making breaking changes to the block encoding.
pub const BLOCK_FORMAT_VERSION: u8 = 1;

/// Version of the redb table layout written by `RedbBlockStore`.
pub const STORE_LAYOUT_VERSION: u64 = 1;

/// Maximum number of entries (datoms or children) in one index page.
pub const PAGE_CAPACITY: usize = 64;

/// Pages with fewer entries than this are merged with a sibling on removal.
pub const PAGE_MIN_FILL: usize = PAGE_CAPACITY / 4;

/// Schema version a brand-new graph starts at before migrations run.
pub const BASE_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for attribute identifiers.
pub const MAX_ATTRIBUTE_LENGTH: usize = 256;

/// Maximum length for string and keyword values (64KB).
pub const MAX_VALUE_LENGTH: usize = 65536;

/// Maximum number of operations in a single transaction.
pub const MAX_TX_OPS: usize = 100_000;

/// Maximum length of a graph id. Ids double as file names.
pub const MAX_GRAPH_ID_LENGTH: usize = 128;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_addresses_precede_pages() {
        assert!(ROOT_ADDRESS < FIRST_PAGE_ADDRESS);
        assert!(SCHEMA_ADDRESS < FIRST_PAGE_ADDRESS);
        assert_ne!(ROOT_ADDRESS, SCHEMA_ADDRESS);
    }

    #[test]
    fn page_fill_bounds() {
        // A merge of an underfull page with a full sibling must fit in two pages.
        assert!(PAGE_MIN_FILL >= 2);
        assert!(PAGE_MIN_FILL - 1 + PAGE_CAPACITY <= 2 * PAGE_CAPACITY);
    }

    #[test]
    fn magic_bytes_correct() {
        assert_eq!(BLOCK_MAGIC, b"TSBK");
    }
}
