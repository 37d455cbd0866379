//! # tessera-core
//!
//! Durable fact store for Tessera.
//!
//! A graph is a set of datoms `(entity, attribute, value, tx)` held in three
//! persistent B+tree indexes (EAVT, AEVT, AVET) whose pages are stored as
//! blocks in a pluggable `BlockStore`. Every commit produces a new immutable
//! `Db` snapshot; readers keep whatever snapshot they hold.
//!
//! ## Layers
//!
//! - `storage`: block stores (redb, memory) and the page adapter
//! - `index`, `db`, `tx`, `query`: the fact store
//! - `migration`: versioned schema/layout steps
//! - `recovery`: rebuild of damaged indexes, always after a safety export
//! - `connection`, `session`: graph lifecycle and the single-writer handle
//!
//! ## Architectural Constraints
//!
//! - No async, no network dependencies
//! - BTreeMap only, no HashMap, no floats
//! - No panics: every failure is a `TesseraError`

// =============================================================================
// MODULES
// =============================================================================

pub mod connection;
pub mod db;
pub mod export;
pub mod formats;
pub mod index;
pub mod listener;
pub mod migration;
pub mod primitives;
pub mod query;
pub mod recovery;
pub mod schema;
pub mod session;
pub mod storage;
pub mod tx;
pub mod types;
pub mod validate;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{
    Address, Attribute, Datom, EntityId, TesseraError, TxId, TxMeta, Value, ValueType,
};

// =============================================================================
// RE-EXPORTS: Fact Store
// =============================================================================

pub use db::Db;
pub use index::{DatomIter, IndexOrder};
pub use query::Pattern;
pub use schema::{AttributeSpec, Cardinality, Schema, SchemaRecord, Unique};
pub use tx::{EntityRef, TxOp, TxReport};
pub use validate::{ValidationReport, Violation, ViolationKind, validate_db};

// =============================================================================
// RE-EXPORTS: Export
// =============================================================================

pub use export::{
    CanonicalGraph, CanonicalHeader, canonical_checksum, export_canonical, export_datoms,
    import_canonical, verify_canonical,
};

// =============================================================================
// RE-EXPORTS: Lifecycle
// =============================================================================

pub use connection::{Connection, GraphStatus};
pub use listener::{CommitEvent, LoggedTx, TxListener, TxLog};
pub use migration::{CURRENT_SCHEMA_VERSION, MigrationReport, migrate};
pub use recovery::{BackupSink, DirBackupSink, MemoryBackupSink, RebuildReport, SchemaSource};
pub use session::{
    GraphState, MemoryProvider, OpenOptions, RedbProvider, SessionConfig, SessionManager,
    StorageProvider,
};
pub use storage::{BlockStore, IntegrityCheck, MemoryBlockStore, RedbBlockStore};
