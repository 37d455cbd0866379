//! # Canonical Export Module
//!
//! Deterministic, bit-exact serialization of a graph's logical content.
//!
//! Stored blocks depend on page layout and allocation history, so two
//! graphs holding the same facts rarely have identical files. The canonical
//! export does not: it is the schema record, the id counters and every
//! datom in EAVT order, encoded with postcard. It is what recovery writes
//! as its safety copy and what `import` reads back.

use crate::db::Db;
use crate::index::{DatomIter, IndexOrder};
use crate::query::Pattern;
use crate::schema::SchemaRecord;
use crate::{Datom, TesseraError};
use serde::{Deserialize, Serialize};

// =============================================================================
// CANONICAL FORMAT
// =============================================================================

/// Magic bytes for canonical export format.
pub const CANONICAL_MAGIC: [u8; 4] = *b"TSEX"; // Tessera Export

/// Current canonical format version.
pub const CANONICAL_VERSION: u8 = 1;

/// Maximum allowed datom count in canonical imports.
///
/// This prevents memory exhaustion from malicious or corrupted data.
pub const MAX_IMPORT_DATOM_COUNT: u64 = 50_000_000;

/// Header for canonical export files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalHeader {
    /// Magic bytes to identify the format.
    pub magic: [u8; 4],

    /// Format version for compatibility.
    pub version: u8,

    /// Number of datoms in the export.
    pub datom_count: u64,

    /// CRC32 of the encoded data section.
    pub checksum: u32,
}

impl CanonicalHeader {
    #[must_use]
    pub fn new(datom_count: u64, checksum: u32) -> Self {
        Self {
            magic: CANONICAL_MAGIC,
            version: CANONICAL_VERSION,
            datom_count,
            checksum,
        }
    }

    /// Validate the header.
    ///
    /// Error messages are kept generic; the input may be untrusted.
    pub fn validate(&self) -> Result<(), TesseraError> {
        if self.magic != CANONICAL_MAGIC {
            return Err(TesseraError::Deserialization(
                "Invalid file format".to_string(),
            ));
        }
        if self.version != CANONICAL_VERSION {
            return Err(TesseraError::Deserialization(
                "Unsupported file version".to_string(),
            ));
        }
        Ok(())
    }
}

/// A graph in canonical form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalGraph {
    pub schema: SchemaRecord,
    pub max_eid: u64,
    pub max_tx: u64,
    /// Datoms sorted by `(e, a, v)`.
    pub datoms: Vec<Datom>,
}

impl CanonicalGraph {
    /// Assemble a canonical graph from loose parts, sorting the datoms.
    #[must_use]
    pub fn from_parts(schema: SchemaRecord, max_eid: u64, max_tx: u64, mut datoms: Vec<Datom>) -> Self {
        datoms.sort();
        Self {
            schema,
            max_eid,
            max_tx,
            datoms,
        }
    }

    /// Capture the current content of a snapshot.
    pub fn from_db(db: &Db) -> Result<Self, TesseraError> {
        let datoms = export_datoms(db).collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            schema: db.schema_record().clone(),
            max_eid: db.max_eid().0,
            max_tx: db.max_tx().0,
            datoms,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, TesseraError> {
        postcard::to_stdvec(self).map_err(|e| TesseraError::Serialization(format!("Data: {e}")))
    }

    /// CRC32 of the encoded graph.
    ///
    /// Detects accidental corruption only; it is not collision resistant.
    pub fn checksum(&self) -> Result<u32, TesseraError> {
        Ok(crc32fast::hash(&self.encode()?))
    }
}

// =============================================================================
// EXPORT FUNCTIONS
// =============================================================================

/// Every current datom in EAVT order, read lazily.
#[must_use]
pub fn export_datoms(db: &Db) -> DatomIter {
    db.datoms(IndexOrder::Eavt, Pattern::any())
}

/// Export a snapshot to canonical postcard format.
///
/// Format:
/// ```text
/// [header_len: u32 LE] [CanonicalHeader (postcard)] [CanonicalGraph (postcard)]
/// ```
pub fn export_canonical(db: &Db) -> Result<Vec<u8>, TesseraError> {
    export_graph(&CanonicalGraph::from_db(db)?)
}

/// Encode an already assembled canonical graph.
pub fn export_graph(graph: &CanonicalGraph) -> Result<Vec<u8>, TesseraError> {
    let data_bytes = graph.encode()?;
    let header = CanonicalHeader::new(graph.datoms.len() as u64, crc32fast::hash(&data_bytes));

    let header_bytes = postcard::to_stdvec(&header)
        .map_err(|e| TesseraError::Serialization(format!("Header: {e}")))?;

    let mut result = Vec::with_capacity(4 + header_bytes.len() + data_bytes.len());
    result.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    result.extend_from_slice(&header_bytes);
    result.extend_from_slice(&data_bytes);
    Ok(result)
}

/// Decode a canonical export.
///
/// Header, size limit and checksum are validated before the data section
/// is deserialized.
pub fn import_canonical(data: &[u8]) -> Result<CanonicalGraph, TesseraError> {
    if data.len() < 4 {
        return Err(TesseraError::Deserialization("Data too short".to_string()));
    }

    let header_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let Some(body_start) = header_len.checked_add(4).filter(|end| *end <= data.len()) else {
        return Err(TesseraError::Deserialization(
            "Data too short for header".to_string(),
        ));
    };

    let header: CanonicalHeader = postcard::from_bytes(&data[4..body_start])
        .map_err(|e| TesseraError::Deserialization(format!("Header: {e}")))?;
    header.validate()?;

    if header.datom_count > MAX_IMPORT_DATOM_COUNT {
        return Err(TesseraError::Deserialization(format!(
            "Datom count {} exceeds maximum allowed {}",
            header.datom_count, MAX_IMPORT_DATOM_COUNT
        )));
    }

    let body = &data[body_start..];
    let computed = crc32fast::hash(body);
    if computed != header.checksum {
        return Err(TesseraError::Deserialization(format!(
            "Checksum mismatch: expected {:08x}, got {:08x}",
            header.checksum, computed
        )));
    }

    let graph: CanonicalGraph = postcard::from_bytes(body)
        .map_err(|e| TesseraError::Deserialization(format!("Data: {e}")))?;
    if graph.datoms.len() as u64 != header.datom_count {
        return Err(TesseraError::Deserialization(
            "Datom count mismatch".to_string(),
        ));
    }
    Ok(graph)
}

/// Check that a snapshot holds exactly the content of a canonical export.
pub fn verify_canonical(db: &Db, canonical_data: &[u8]) -> Result<bool, TesseraError> {
    let imported = import_canonical(canonical_data)?;
    Ok(CanonicalGraph::from_db(db)? == imported)
}

/// CRC32 checksum of a snapshot's canonical form.
pub fn canonical_checksum(db: &Db) -> Result<u32, TesseraError> {
    CanonicalGraph::from_db(db)?.checksum()
}

// =============================================================================
// CRYPTOGRAPHIC HASH SUPPORT
// =============================================================================

/// BLAKE3 hash of the canonical export, as 64 hex characters.
///
/// Only available with the `crypto-hash` feature.
#[cfg(feature = "crypto-hash")]
pub fn canonical_crypto_hash(db: &Db) -> Result<String, TesseraError> {
    Ok(compute_blake3_hash(&export_canonical(db)?))
}

/// BLAKE3 hash of raw bytes.
#[cfg(feature = "crypto-hash")]
#[must_use]
pub fn compute_blake3_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

// =============================================================================
// TESTS
// =============================================================================
