//! # Core Type Definitions
//!
//! This module contains the value types shared by every Tessera component:
//! - Identifiers (`EntityId`, `TxId`, `Address`)
//! - Fact components (`Attribute`, `Value`, `ValueType`)
//! - The fact tuple itself (`Datom`)
//! - Transaction metadata (`TxMeta`)
//! - Error types (`TesseraError`)
//!
//! ## Ordering Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` so they can key `BTreeMap`/`BTreeSet` and index pages
//! - Use saturating arithmetic for counters

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identifier of an entity. Assigned monotonically by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a committed transaction. Monotonic, separate from entity ids.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TxId(pub u64);

impl TxId {
    /// The id following this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer key of a durable block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u64);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// =============================================================================
// ATTRIBUTE
// =============================================================================

/// Namespaced attribute identifier, e.g. `block/title`.
///
/// The namespace is everything before the first `/`. Bare names such as
/// `title` have no namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attribute(pub String);

impl Attribute {
    /// Create a new attribute from a string.
    #[must_use]
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the attribute as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace part, if any.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    /// The local name (after the namespace separator).
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl From<&str> for Attribute {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// VALUE
// =============================================================================

/// The declared type of an attribute's values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Long,
    Boolean,
    Ref,
    Keyword,
    Instant,
    /// Accepts any value. Used for schemas inferred during recovery.
    Any,
}

impl ValueType {
    /// Check whether a value conforms to this type.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::Any, _)
                | (Self::String, Value::Str(_))
                | (Self::Long, Value::Long(_))
                | (Self::Boolean, Value::Bool(_))
                | (Self::Ref, Value::Ref(_))
                | (Self::Keyword, Value::Keyword(_))
                | (Self::Instant, Value::Instant(_))
        )
    }
}

/// Value component of a datom.
///
/// Ordering is by variant first, then by payload, so values of different
/// types never interleave inside an index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Str(String),
    Long(i64),
    Bool(bool),
    Ref(EntityId),
    Keyword(String),
    /// Milliseconds since the Unix epoch.
    Instant(i64),
}

impl Value {
    /// Create a string value.
    #[must_use]
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// The type tag of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Str(_) => ValueType::String,
            Self::Long(_) => ValueType::Long,
            Self::Bool(_) => ValueType::Boolean,
            Self::Ref(_) => ValueType::Ref,
            Self::Keyword(_) => ValueType::Keyword,
            Self::Instant(_) => ValueType::Instant,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Long(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Ref(e) => write!(f, "#ref {e}"),
            Self::Keyword(k) => write!(f, ":{k}"),
            Self::Instant(ms) => write!(f, "#inst {ms}"),
        }
    }
}

// =============================================================================
// DATOM
// =============================================================================

/// A fact tuple: entity, attribute, value, and the transaction that wrote it.
///
/// Datoms are immutable. Inside an index, identity is `(e, a, v)`; the
/// transaction id is carried along as payload.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Datom {
    pub e: EntityId,
    pub a: Attribute,
    pub v: Value,
    pub tx: TxId,
}

impl Datom {
    /// Create a new datom.
    #[must_use]
    pub fn new(e: EntityId, a: Attribute, v: Value, tx: TxId) -> Self {
        Self { e, a, v, tx }
    }
}

impl fmt::Display for Datom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} {} {} {}]", self.e, self.a, self.v, self.tx)
    }
}

// =============================================================================
// TRANSACTION METADATA
// =============================================================================

/// Free-form metadata attached to a transaction and handed to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TxMeta(pub BTreeMap<String, String>);

impl TxMeta {
    /// Empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Look up a metadata entry.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in the Tessera store.
///
/// - No silent failures
/// - Use `Result<T, TesseraError>` for fallible operations
/// - The core never panics; index corruption is handled by rebuild
#[derive(Debug, Error)]
pub enum TesseraError {
    /// A block required to read the index is missing from durable storage.
    #[error("Block not found: {0}")]
    BlockNotFound(Address),

    /// A schema rule was broken. Nothing from the batch was applied.
    #[error("Constraint violation on entity {entity}, attribute {attribute}: {reason}")]
    ConstraintViolation {
        entity: EntityId,
        attribute: Attribute,
        reason: String,
    },

    /// The stored schema version cannot be brought to the expected one.
    #[error("Migration failed (stored v{stored}, expected v{expected}): {reason}")]
    MigrationFailed {
        stored: u32,
        expected: u32,
        reason: String,
    },

    /// The durable storage substrate failed.
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// A stored block exists but cannot be decoded as the expected content.
    #[error("Corrupt index block {address}: {reason}")]
    CorruptIndex { address: Address, reason: String },

    /// Recovery could not export or reconstruct the store.
    #[error("Rebuild failed: {0}")]
    RebuildFailed(String),

    /// A serialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A deserialization error occurred.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The request is malformed (bad op, unknown tempid reference, ...).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The graph is not in a state that allows the requested lifecycle call.
    #[error("Graph '{graph}' is {state}")]
    InvalidState { graph: String, state: String },

    /// The connection was closed and can no longer be used.
    #[error("Connection to graph '{0}' is closed")]
    ConnectionClosed(String),
}

impl TesseraError {
    /// Errors that mean the stored index structure is unreadable.
    ///
    /// These trigger recovery instead of being surfaced to the caller.
    #[must_use]
    pub fn is_index_damage(&self) -> bool {
        matches!(self, Self::BlockNotFound(_) | Self::CorruptIndex { .. })
    }

    pub(crate) fn constraint(
        entity: EntityId,
        attribute: &Attribute,
        reason: impl Into<String>,
    ) -> Self {
        Self::ConstraintViolation {
            entity,
            attribute: attribute.clone(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
