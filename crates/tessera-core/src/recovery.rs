//! # Recovery / Rebuild
//!
//! Reconstructs a graph whose stored index can no longer be read.
//!
//! The procedure, in order:
//! 1. Flatten: scan every stored block and collect the datoms of every
//!    readable leaf. With a readable root record, only blocks reachable from
//!    it count; otherwise every block does.
//! 2. Refuse: a graph whose records use another block format, or whose
//!    schema version is newer than this build knows, is left untouched.
//! 3. Resolve: drop duplicates and datoms that break the schema (highest
//!    transaction id wins), inferring specs for unknown attributes.
//! 4. Safety export: write the canonical export through a `BackupSink`.
//!    If this fails, the store is left exactly as it was.
//! 5. Swap: stage the recovered graph in a fresh arena above every existing
//!    address, oldest transaction first, and commit it with one `put` that
//!    also deletes every old block. A crash at any point leaves either the
//!    old store or the rebuilt one.
//!
//! Migrations are run afterwards by whoever opens the rebuilt graph.

use crate::db::Db;
use crate::export::{CanonicalGraph, export_graph};
use crate::formats::{BlockContent, block_version, decode_block, unsupported_format};
use crate::index::Page;
use crate::migration::CURRENT_SCHEMA_VERSION;
use crate::primitives::{BASE_SCHEMA_VERSION, BLOCK_FORMAT_VERSION, ROOT_ADDRESS, SCHEMA_ADDRESS};
use crate::schema::{Schema, SchemaRecord};
use crate::storage::{BlockStore, PageDelta, discard, persist, stage_empty};
use crate::{Address, Attribute, Datom, EntityId, TesseraError, TxId, TxMeta, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

// =============================================================================
// BACKUP SINKS
// =============================================================================

/// Destination of the safety export taken before a rebuild deletes anything.
pub trait BackupSink: Send + Sync {
    /// Durably store `export` and return where it went.
    fn write_backup(&self, graph_id: &str, export: &[u8]) -> Result<String, TesseraError>;
}

/// Writes backups as files in one directory.
#[derive(Debug, Clone)]
pub struct DirBackupSink {
    dir: PathBuf,
}

impl DirBackupSink {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackupSink for DirBackupSink {
    fn write_backup(&self, graph_id: &str, export: &[u8]) -> Result<String, TesseraError> {
        let io = |e: std::io::Error| TesseraError::StorageIo(e.to_string());
        fs::create_dir_all(&self.dir).map_err(io)?;

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut path = self.dir.join(format!("{graph_id}-{stamp}.tsx"));
        let mut n = 1u32;
        while path.exists() {
            path = self.dir.join(format!("{graph_id}-{stamp}-{n}.tsx"));
            n += 1;
        }

        // Write to a temp file first, then rename, so a partial backup never
        // carries the final name.
        let tmp = path.with_extension("tsx.tmp");
        {
            let mut file = fs::File::create(&tmp).map_err(io)?;
            file.write_all(export).map_err(io)?;
            file.sync_all().map_err(io)?;
        }
        fs::rename(&tmp, &path).map_err(io)?;
        Ok(path.display().to_string())
    }
}

/// Keeps backups in memory.
#[derive(Debug, Default)]
pub struct MemoryBackupSink {
    backups: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryBackupSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(graph_id, export)` for every backup taken, oldest first.
    #[must_use]
    pub fn backups(&self) -> Vec<(String, Vec<u8>)> {
        self.backups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BackupSink for MemoryBackupSink {
    fn write_backup(&self, graph_id: &str, export: &[u8]) -> Result<String, TesseraError> {
        let mut backups = self.backups.lock().unwrap_or_else(PoisonError::into_inner);
        backups.push((graph_id.to_string(), export.to_vec()));
        Ok(format!("memory:{graph_id}/{}", backups.len()))
    }
}

// =============================================================================
// FLATTEN
// =============================================================================

/// Everything readable that a damaged store still holds.
#[derive(Debug, Clone, Default)]
pub struct Flattened {
    pub schema: Option<SchemaRecord>,
    pub datoms: Vec<Datom>,
    pub max_eid: u64,
    pub max_tx: u64,
    pub scanned_blocks: usize,
    pub skipped_blocks: usize,
    /// Whether the root record was readable and limited the scan.
    pub used_root: bool,
    /// Every stored address other than the root and schema records.
    pub page_addresses: Vec<Address>,
    /// Lowest address above everything the store holds or has handed out.
    pub next_address: u64,
    /// First block framed in a format this build must not rewrite: a root
    /// or schema record in any other version, or a page in a newer one.
    pub foreign_format: Option<(Address, u8)>,
}

/// Collect the datoms of every readable leaf block.
pub fn flatten(store: &dyn BlockStore) -> Result<Flattened, TesseraError> {
    let blocks: BTreeMap<Address, _> = store
        .scan()?
        .into_iter()
        .map(|b| (b.address, b))
        .collect();
    let mut out = Flattened {
        scanned_blocks: blocks.len(),
        ..Flattened::default()
    };
    for (&address, block) in &blocks {
        out.next_address = out.next_address.max(address.0.saturating_add(1));
        let record = address.0 == ROOT_ADDRESS || address.0 == SCHEMA_ADDRESS;
        if !record {
            out.page_addresses.push(address);
        }
        if out.foreign_format.is_none() {
            if let Some(version) = block_version(&block.content) {
                let foreign = if record {
                    version != BLOCK_FORMAT_VERSION
                } else {
                    version > BLOCK_FORMAT_VERSION
                };
                if foreign {
                    out.foreign_format = Some((address, version));
                }
            }
        }
    }

    let decode = |address: Address| {
        blocks
            .get(&address)
            .and_then(|b| decode_block(address, &b.content).ok())
    };
    let root = match decode(Address(ROOT_ADDRESS)) {
        Some(BlockContent::Root(root)) => Some(root),
        _ => None,
    };
    out.schema = match decode(Address(SCHEMA_ADDRESS)) {
        Some(BlockContent::Schema(record)) => Some(record),
        _ => None,
    };

    // Live set: reachable through the stored reference lists, which stay
    // usable even when a parent page itself no longer decodes.
    let live: BTreeSet<Address> = match &root {
        Some(root) => {
            out.used_root = true;
            out.max_eid = root.max_eid;
            out.max_tx = root.max_tx;
            out.next_address = out.next_address.max(root.next_address);
            let mut seen = BTreeSet::new();
            let mut stack: Vec<Address> = root.roots.addresses().to_vec();
            while let Some(address) = stack.pop() {
                let Some(block) = blocks.get(&address) else {
                    continue;
                };
                if seen.insert(address) {
                    stack.extend(block.children.iter().copied());
                }
            }
            seen
        }
        None => blocks.keys().copied().collect(),
    };

    for address in live {
        if address.0 == ROOT_ADDRESS || address.0 == SCHEMA_ADDRESS {
            continue;
        }
        let Some(block) = blocks.get(&address) else {
            continue;
        };
        match decode_block(address, &block.content) {
            Ok(BlockContent::Page(Page::Leaf(datoms))) => out.datoms.extend(datoms),
            Ok(_) => {}
            Err(e) => {
                out.skipped_blocks += 1;
                tracing::warn!(block = %address, error = %e, "skipping unreadable block");
            }
        }
    }

    for datom in &out.datoms {
        out.max_eid = out.max_eid.max(datom.e.0);
        out.max_tx = out.max_tx.max(datom.tx.0);
    }
    Ok(out)
}

// =============================================================================
// CONFLICT RESOLUTION
// =============================================================================

/// Reduce recovered datoms to a set that satisfies `schema`.
///
/// Attributes the schema lacks are added with a permissive inferred spec.
/// Returns the surviving datoms and how many were dropped.
pub fn resolve_conflicts(datoms: Vec<Datom>, schema: &mut Schema) -> (Vec<Datom>, usize) {
    let total = datoms.len();

    // Same (e, a, v) from several indexes or stale copies: newest tx wins.
    let mut unique: BTreeMap<(EntityId, Attribute, Value), TxId> = BTreeMap::new();
    for datom in datoms {
        let tx = unique.entry((datom.e, datom.a, datom.v)).or_insert(datom.tx);
        *tx = (*tx).max(datom.tx);
    }
    let mut datoms: Vec<Datom> = unique
        .into_iter()
        .map(|((e, a, v), tx)| Datom::new(e, a, v, tx))
        .collect();

    let unknown = Schema::infer(datoms.iter().filter(|d| !schema.contains(&d.a)));
    for (attribute, spec) in unknown.iter() {
        schema.insert(attribute.clone(), spec.clone());
    }

    datoms.retain(|d| {
        schema
            .get(&d.a)
            .is_some_and(|spec| spec.value_type.accepts(&d.v))
    });

    // Cardinality-one: one value per (e, a). Unique: one entity per (a, v).
    let mut by_slot: BTreeMap<(EntityId, Attribute), Datom> = BTreeMap::new();
    let mut kept = Vec::with_capacity(datoms.len());
    for datom in datoms {
        match schema.get(&datom.a) {
            Some(spec) if !spec.is_many() => {
                let slot = (datom.e, datom.a.clone());
                match by_slot.get(&slot) {
                    Some(current) if (current.tx, &current.v) >= (datom.tx, &datom.v) => {}
                    _ => {
                        by_slot.insert(slot, datom);
                    }
                }
            }
            _ => kept.push(datom),
        }
    }
    kept.extend(by_slot.into_values());

    let mut by_value: BTreeMap<(Attribute, Value), Datom> = BTreeMap::new();
    let mut result = Vec::with_capacity(kept.len());
    for datom in kept {
        match schema.get(&datom.a) {
            Some(spec) if spec.unique.is_some() => {
                let key = (datom.a.clone(), datom.v.clone());
                match by_value.get(&key) {
                    Some(current) if (current.tx, current.e) >= (datom.tx, datom.e) => {}
                    _ => {
                        by_value.insert(key, datom);
                    }
                }
            }
            _ => result.push(datom),
        }
    }
    result.extend(by_value.into_values());
    result.sort();

    let dropped = total - result.len();
    (result, dropped)
}

// =============================================================================
// REBUILD
// =============================================================================

/// Where the rebuilt graph's schema came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    /// The stored schema record was readable.
    Stored,
    /// Supplied by the caller.
    Caller,
    /// Inferred from the recovered datoms.
    Inferred,
}

/// Outcome of a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildReport {
    pub graph_id: String,
    /// Where the safety export was written.
    pub backup_location: String,
    pub scanned_blocks: usize,
    pub skipped_blocks: usize,
    pub recovered_datoms: usize,
    pub dropped_datoms: usize,
    pub transactions: usize,
    pub schema_source: SchemaSource,
}

/// Rebuild the graph stored in `store` from whatever it still holds.
///
/// `fallback` is used when the stored schema record is unreadable; without
/// it the schema is inferred. A graph written by a newer build is refused
/// with `MigrationFailed` before anything is exported or written. Later
/// failures are reported as `RebuildFailed` and leave the store as it was.
pub fn rebuild(
    graph_id: &str,
    store: Arc<dyn BlockStore>,
    sink: &dyn BackupSink,
    fallback: Option<&Schema>,
) -> Result<(Db, RebuildReport), TesseraError> {
    let failed = |stage: &str, e: TesseraError| {
        TesseraError::RebuildFailed(format!("{stage} for graph '{graph_id}': {e}"))
    };

    tracing::warn!(graph = graph_id, "rebuilding graph from stored blocks");
    let flat = flatten(store.as_ref()).map_err(|e| failed("scan failed", e))?;
    refuse_foreign(graph_id, &flat)?;

    let (record, schema_source) = match flat.schema {
        Some(record) => (record, SchemaSource::Stored),
        None => match fallback {
            Some(schema) => (
                SchemaRecord::new(BASE_SCHEMA_VERSION, schema.clone()),
                SchemaSource::Caller,
            ),
            None => (
                SchemaRecord::new(BASE_SCHEMA_VERSION, Schema::new()),
                SchemaSource::Inferred,
            ),
        },
    };
    let SchemaRecord {
        version,
        mut schema,
    } = record;
    let (datoms, dropped) = resolve_conflicts(flat.datoms, &mut schema);
    let graph = CanonicalGraph::from_parts(
        SchemaRecord::new(version, schema),
        flat.max_eid,
        flat.max_tx,
        datoms,
    );

    let export = export_graph(&graph).map_err(|e| failed("safety export failed", e))?;
    let backup = sink
        .write_backup(graph_id, &export)
        .map_err(|e| failed("safety export failed", e))?;
    tracing::info!(graph = graph_id, %backup, datoms = graph.datoms.len(), "safety export written");

    let recovered = graph.datoms.len();
    let staged = stage_graph(Arc::clone(&store), graph, flat.next_address)
        .map_err(|e| failed(&format!("reload failed (backup kept at {backup})"), e))?;
    let mut delta = staged.delta;
    delta.superseded.extend(flat.page_addresses.iter().copied());
    commit(&staged.db, &delta)
        .map_err(|e| failed(&format!("swap failed (backup kept at {backup})"), e))?;
    if let Err(e) = store.compact() {
        tracing::warn!(graph = graph_id, error = %e, "compaction after rebuild failed");
    }

    let report = RebuildReport {
        graph_id: graph_id.to_string(),
        backup_location: backup,
        scanned_blocks: flat.scanned_blocks,
        skipped_blocks: flat.skipped_blocks,
        recovered_datoms: recovered,
        dropped_datoms: dropped,
        transactions: staged.transactions,
        schema_source,
    };
    tracing::info!(
        graph = graph_id,
        recovered = report.recovered_datoms,
        dropped = report.dropped_datoms,
        skipped = report.skipped_blocks,
        "rebuild complete"
    );
    Ok((staged.db, report))
}

/// Refuse to rebuild a graph this build cannot faithfully rewrite.
fn refuse_foreign(graph_id: &str, flat: &Flattened) -> Result<(), TesseraError> {
    if let Some((address, version)) = flat.foreign_format {
        tracing::error!(graph = graph_id, block = %address, version, "unsupported block format");
        return Err(unsupported_format(address, version));
    }
    if let Some(record) = &flat.schema {
        if record.version > CURRENT_SCHEMA_VERSION {
            tracing::error!(graph = graph_id, version = record.version, "schema version too new");
            return Err(TesseraError::MigrationFailed {
                stored: record.version,
                expected: CURRENT_SCHEMA_VERSION,
                reason: "graph was written by a newer version; refusing to rebuild".to_string(),
            });
        }
    }
    Ok(())
}

/// A graph built in memory and not yet written.
pub(crate) struct StagedGraph {
    pub(crate) db: Db,
    /// Every page the graph needs, plus the schema record.
    pub(crate) delta: PageDelta,
    pub(crate) transactions: usize,
}

/// Stage a canonical graph in a fresh arena allocating from `next_address`,
/// one load per original transaction id, oldest first.
///
/// Nothing is written: the caller commits the result with one `persist`.
pub(crate) fn stage_graph(
    store: Arc<dyn BlockStore>,
    graph: CanonicalGraph,
    next_address: u64,
) -> Result<StagedGraph, TesseraError> {
    let CanonicalGraph {
        schema,
        max_eid,
        max_tx,
        datoms,
    } = graph;
    let (mut db, mut delta) = stage_empty(store, schema, next_address)?;

    let mut by_tx: BTreeMap<TxId, Vec<Datom>> = BTreeMap::new();
    for datom in datoms {
        by_tx.entry(datom.tx).or_default().push(datom);
    }
    let transactions = by_tx.len();

    for (tx, datoms) in by_tx {
        let meta = TxMeta::new().with("source", "load").with("tx", tx.0.to_string());
        let report = db.load(datoms, meta)?;
        delta.absorb(report.delta, report.db_after.pages());
        db = report.db_after;
    }

    // Counters may be ahead of every surviving datom (retracted entities).
    let max_eid = db.max_eid().0.max(max_eid);
    let max_tx = db.max_tx().0.max(max_tx);
    let db = db.with_roots(db.roots(), max_eid, max_tx);
    Ok(StagedGraph {
        db,
        delta,
        transactions,
    })
}

fn commit(db: &Db, delta: &PageDelta) -> Result<(), TesseraError> {
    persist(db, delta).inspect_err(|_| discard(db.pages(), delta))
}

// =============================================================================
// TESTS
// =============================================================================
