//! # Block Format
//!
//! Binary framing for every block written to a `BlockStore`.
//!
//! Format: Header (9 bytes) + postcard-serialized `BlockContent`.
//! - 4 bytes: Magic ("TSBK")
//! - 1 byte: Format version
//! - 4 bytes: CRC32 of the payload (little-endian)
//!
//! ## Corruption Handling
//!
//! Decoding validates size limits, header and checksum BEFORE attempting to
//! deserialize the payload. Every decoding failure is reported as
//! `TesseraError::CorruptIndex` carrying the block address, which is what
//! routes a damaged store into recovery.
//!
//! The root and schema records are read with `decode_record`, which refuses
//! a record written in another block format with `MigrationFailed`. Such a
//! graph is not damaged and must never be rebuilt by this build.

use crate::index::{IndexRoots, Page};
use crate::primitives::{BLOCK_FORMAT_VERSION, BLOCK_MAGIC};
use crate::schema::SchemaRecord;
use crate::{Address, TesseraError};
use serde::{Deserialize, Serialize};

/// Maximum accepted size of a single encoded block (64 MB).
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Length of the block header.
pub const BLOCK_HEADER_LEN: usize = 9;

// =============================================================================
// BLOCK CONTENT
// =============================================================================

/// Record stored at the well-known root address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRecord {
    pub format_version: u8,
    pub roots: IndexRoots,
    pub max_eid: u64,
    pub max_tx: u64,
    /// Next page address the allocator will hand out.
    pub next_address: u64,
}

/// Everything a block can hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockContent {
    Root(RootRecord),
    Schema(SchemaRecord),
    Page(Page),
}

impl BlockContent {
    /// Short name of the content kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Root(_) => "root",
            Self::Schema(_) => "schema",
            Self::Page(Page::Leaf(_)) => "leaf",
            Self::Page(Page::Branch { .. }) => "branch",
        }
    }
}

// =============================================================================
// HEADER
// =============================================================================

/// The header preceding every block payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: [u8; 4],
    pub version: u8,
    pub checksum: u32,
}

impl BlockHeader {
    /// Create a header for the given payload.
    #[must_use]
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: *BLOCK_MAGIC,
            version: BLOCK_FORMAT_VERSION,
            checksum: crc32fast::hash(payload),
        }
    }

    /// Write header to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_LEN] {
        let mut bytes = [0u8; BLOCK_HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4] = self.version;
        bytes[5..9].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Read header from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < BLOCK_HEADER_LEN {
            return Err("header too short".to_string());
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&bytes[5..9]);
        Ok(Self {
            magic,
            version: bytes[4],
            checksum: u32::from_le_bytes(checksum),
        })
    }

    /// Validate magic and version.
    pub fn validate(&self) -> Result<(), String> {
        if &self.magic != BLOCK_MAGIC {
            return Err("invalid magic bytes".to_string());
        }
        if self.version != BLOCK_FORMAT_VERSION {
            return Err(format!(
                "unsupported block version {} (expected {})",
                self.version, BLOCK_FORMAT_VERSION
            ));
        }
        Ok(())
    }
}

// =============================================================================
// SERIALIZATION FUNCTIONS
// =============================================================================

/// Borrowing mirror of `BlockContent`. Variant order must stay identical so
/// both serialize to the same bytes.
#[derive(Serialize)]
enum BlockContentRef<'a> {
    Root(&'a RootRecord),
    Schema(&'a SchemaRecord),
    Page(&'a Page),
}

/// Serialize block content to bytes (header + payload).
pub fn encode_block(content: &BlockContent) -> Result<Vec<u8>, TesseraError> {
    let borrowed = match content {
        BlockContent::Root(root) => BlockContentRef::Root(root),
        BlockContent::Schema(record) => BlockContentRef::Schema(record),
        BlockContent::Page(page) => BlockContentRef::Page(page),
    };
    frame(&borrowed)
}

/// Serialize an index page without cloning it into a `BlockContent`.
pub fn encode_page(page: &Page) -> Result<Vec<u8>, TesseraError> {
    frame(&BlockContentRef::Page(page))
}

fn frame<T: Serialize>(content: &T) -> Result<Vec<u8>, TesseraError> {
    let payload =
        postcard::to_stdvec(content).map_err(|e| TesseraError::Serialization(e.to_string()))?;
    let header = BlockHeader::for_payload(&payload);

    let mut result = Vec::with_capacity(BLOCK_HEADER_LEN + payload.len());
    result.extend_from_slice(&header.to_bytes());
    result.extend_from_slice(&payload);
    Ok(result)
}

/// Deserialize the block stored at `address`.
///
/// Size, header and checksum are validated before the payload is parsed.
pub fn decode_block(address: Address, bytes: &[u8]) -> Result<BlockContent, TesseraError> {
    let corrupt = |reason: String| TesseraError::CorruptIndex { address, reason };

    if bytes.len() > MAX_BLOCK_SIZE {
        return Err(corrupt(format!(
            "block of {} bytes exceeds maximum {}",
            bytes.len(),
            MAX_BLOCK_SIZE
        )));
    }

    let header = BlockHeader::from_bytes(bytes).map_err(corrupt)?;
    header.validate().map_err(corrupt)?;

    let payload = &bytes[BLOCK_HEADER_LEN..];
    let actual = crc32fast::hash(payload);
    if actual != header.checksum {
        return Err(corrupt(format!(
            "checksum mismatch: stored {:08x}, computed {:08x}",
            header.checksum, actual
        )));
    }

    postcard::from_bytes(payload).map_err(|e| corrupt(e.to_string()))
}

/// Format version of an encoded block, if it starts with the block magic.
#[must_use]
pub fn block_version(bytes: &[u8]) -> Option<u8> {
    let header = BlockHeader::from_bytes(bytes).ok()?;
    (&header.magic == BLOCK_MAGIC).then_some(header.version)
}

/// Decode the root or schema record stored at `address`.
///
/// Unlike `decode_block`, a record framed with another format version fails
/// with `MigrationFailed`, which callers do not treat as index damage.
pub fn decode_record(address: Address, bytes: &[u8]) -> Result<BlockContent, TesseraError> {
    if let Some(version) = block_version(bytes) {
        if version != BLOCK_FORMAT_VERSION {
            return Err(unsupported_format(address, version));
        }
    }
    decode_block(address, bytes)
}

/// Error for a block written in a format this build cannot read.
#[must_use]
pub fn unsupported_format(address: Address, version: u8) -> TesseraError {
    TesseraError::MigrationFailed {
        stored: u32::from(version),
        expected: u32::from(BLOCK_FORMAT_VERSION),
        reason: format!("block {address} uses block format v{version}"),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSpec, Schema};
    use crate::{Attribute, Datom, EntityId, TxId, Value, ValueType};

    fn sample_leaf() -> BlockContent {
        BlockContent::Page(Page::Leaf(vec![Datom::new(
            EntityId(1),
            Attribute::new("title"),
            Value::str("A"),
            TxId(1),
        )]))
    }

    #[test]
    fn block_roundtrip() {
        let content = sample_leaf();
        let bytes = encode_block(&content).expect("encode");
        let decoded = decode_block(Address(7), &bytes).expect("decode");
        assert_eq!(decoded, content);
        assert_eq!(decoded.kind(), "leaf");
    }

    #[test]
    fn borrowed_encoding_matches_owned_payload() {
        let record = SchemaRecord::new(1, Schema::new());
        for content in [sample_leaf(), BlockContent::Schema(record)] {
            let bytes = encode_block(&content).expect("encode");
            let owned = postcard::to_stdvec(&content).expect("owned payload");
            assert_eq!(&bytes[BLOCK_HEADER_LEN..], owned.as_slice());
        }

        let BlockContent::Page(page) = sample_leaf() else {
            panic!("sample is a page");
        };
        let borrowed = encode_page(&page).expect("encode borrowed");
        assert_eq!(borrowed, encode_block(&sample_leaf()).expect("encode"));
    }

    #[test]
    fn schema_record_roundtrip() {
        let record = SchemaRecord::new(
            3,
            Schema::new().with("title", AttributeSpec::one(ValueType::String)),
        );
        let bytes = encode_block(&BlockContent::Schema(record.clone())).expect("encode");
        match decode_block(Address(1), &bytes).expect("decode") {
            BlockContent::Schema(decoded) => assert_eq!(decoded, record),
            other => panic!("unexpected content {}", other.kind()),
        }
    }

    #[test]
    fn flipped_payload_byte_is_detected() {
        let mut bytes = encode_block(&sample_leaf()).expect("encode");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;

        let result = decode_block(Address(9), &bytes);
        match result {
            Err(TesseraError::CorruptIndex { address, reason }) => {
                assert_eq!(address, Address(9));
                assert!(reason.contains("checksum"));
            }
            other => panic!("expected CorruptIndex, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_is_detected() {
        let mut bytes = encode_block(&sample_leaf()).expect("encode");
        bytes[0] = b'X';
        assert!(matches!(
            decode_block(Address(2), &bytes),
            Err(TesseraError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn truncated_header_is_detected() {
        assert!(matches!(
            decode_block(Address(2), b"TSB"),
            Err(TesseraError::CorruptIndex { .. })
        ));
        assert!(matches!(
            decode_block(Address(2), &[]),
            Err(TesseraError::CorruptIndex { .. })
        ));
    }

    #[test]
    fn future_version_is_rejected() {
        let mut bytes = encode_block(&sample_leaf()).expect("encode");
        bytes[4] = BLOCK_FORMAT_VERSION + 1;
        let err = decode_block(Address(2), &bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported block version"));
        assert_eq!(block_version(&bytes), Some(BLOCK_FORMAT_VERSION + 1));
    }

    #[test]
    fn record_in_other_format_is_not_damage() {
        let record = BlockContent::Schema(SchemaRecord::new(1, Schema::new()));
        let mut bytes = encode_block(&record).expect("encode");
        assert_eq!(decode_record(Address(1), &bytes).expect("decode"), record);

        bytes[4] = BLOCK_FORMAT_VERSION + 1;
        let err = decode_record(Address(1), &bytes).unwrap_err();
        assert!(matches!(err, TesseraError::MigrationFailed { .. }));
        assert!(!err.is_index_damage());

        // Garbage without the magic is still ordinary damage.
        assert!(
            decode_record(Address(1), b"garbage-bytes")
                .unwrap_err()
                .is_index_damage()
        );
    }
}
