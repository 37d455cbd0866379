//! # redb-backed Block Store
//!
//! Production `BlockStore` on the redb embedded database.
//!
//! redb supplies the durability guarantees the index layer relies on:
//! - ACID write transactions (one `put` = one transaction)
//! - Crash safety: an uncommitted transaction leaves no trace
//! - MVCC: readers never observe a half-applied batch
//!
//! Besides the blocks themselves, the store keeps each block's outgoing
//! references and the reverse `(child, parent)` relation, so deletion can
//! be gated on "no remaining referrer" inside the same transaction.

use super::block::{Block, BlockStore};
use crate::primitives::STORE_LAYOUT_VERSION;
use crate::{Address, TesseraError};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

/// Table for blocks: address -> encoded block bytes
const BLOCKS: TableDefinition<u64, &[u8]> = TableDefinition::new("blocks");

/// Table for outgoing references: address -> postcard `Vec<u64>`
const CHILDREN: TableDefinition<u64, &[u8]> = TableDefinition::new("children");

/// Reverse references: (child, parent) -> ()
const REFERRERS: TableDefinition<(u64, u64), ()> = TableDefinition::new("referrers");

/// Table for metadata: key string -> value u64
const METADATA: TableDefinition<&str, u64> = TableDefinition::new("metadata");

const LAYOUT_KEY: &str = "layout_version";

fn io_err(e: impl ToString) -> TesseraError {
    TesseraError::StorageIo(e.to_string())
}

fn encode_children(children: &[Address]) -> Result<Vec<u8>, TesseraError> {
    let raw: Vec<u64> = children.iter().map(|a| a.0).collect();
    postcard::to_stdvec(&raw).map_err(|e| TesseraError::Serialization(e.to_string()))
}

fn decode_children(bytes: &[u8]) -> Result<Vec<Address>, TesseraError> {
    let raw: Vec<u64> =
        postcard::from_bytes(bytes).map_err(|e| TesseraError::Deserialization(e.to_string()))?;
    Ok(raw.into_iter().map(Address).collect())
}

/// A `BlockStore` persisted in a single redb file.
pub struct RedbBlockStore {
    path: PathBuf,
    /// `None` once closed; dropping the `Database` releases the file lock.
    db: RwLock<Option<Database>>,
}

impl std::fmt::Debug for RedbBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBlockStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbBlockStore {
    /// Open or create a block store at the given path.
    ///
    /// Fails with `MigrationFailed` when the file was written with a newer
    /// table layout than this build understands.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TesseraError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path).map_err(io_err)?;

        // Initialize tables if they don't exist
        let write_txn = db.begin_write().map_err(io_err)?;
        {
            write_txn.open_table(BLOCKS).map_err(io_err)?;
            write_txn.open_table(CHILDREN).map_err(io_err)?;
            write_txn.open_table(REFERRERS).map_err(io_err)?;
            let mut meta = write_txn.open_table(METADATA).map_err(io_err)?;
            let stored = meta.get(LAYOUT_KEY).map_err(io_err)?.map(|v| v.value());
            match stored {
                Some(version) if version > STORE_LAYOUT_VERSION => {
                    return Err(TesseraError::MigrationFailed {
                        stored: u32::try_from(version).unwrap_or(u32::MAX),
                        expected: STORE_LAYOUT_VERSION as u32,
                        reason: format!("{} uses a newer block store layout", path.display()),
                    });
                }
                Some(_) => {}
                None => {
                    meta.insert(LAYOUT_KEY, STORE_LAYOUT_VERSION).map_err(io_err)?;
                }
            }
        }
        write_txn.commit().map_err(io_err)?;

        tracing::debug!(path = %path.display(), "opened redb block store");
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, TesseraError>,
    ) -> Result<T, TesseraError> {
        let guard = self.db.read().unwrap_or_else(PoisonError::into_inner);
        let db = guard.as_ref().ok_or_else(|| {
            TesseraError::StorageIo(format!("block store {} is closed", self.path.display()))
        })?;
        f(db)
    }
}

impl BlockStore for RedbBlockStore {
    fn get(&self, address: Address) -> Result<Option<Block>, TesseraError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(io_err)?;
            let blocks = read_txn.open_table(BLOCKS).map_err(io_err)?;
            let Some(content) = blocks.get(address.0).map_err(io_err)? else {
                return Ok(None);
            };
            let content = content.value().to_vec();

            let children_table = read_txn.open_table(CHILDREN).map_err(io_err)?;
            let children = match children_table.get(address.0).map_err(io_err)? {
                Some(raw) => decode_children(raw.value())?,
                None => Vec::new(),
            };
            Ok(Some(Block::new(address, content, children)))
        })
    }

    fn put(&self, blocks: Vec<Block>, delete_candidates: &[Address]) -> Result<(), TesseraError> {
        self.with_db(|db| {
            let write_txn = db.begin_write().map_err(io_err)?;
            let mut deleted = 0usize;
            {
                let mut blocks_table = write_txn.open_table(BLOCKS).map_err(io_err)?;
                let mut children_table = write_txn.open_table(CHILDREN).map_err(io_err)?;
                let mut referrers = write_txn.open_table(REFERRERS).map_err(io_err)?;

                for block in &blocks {
                    let address = block.address.0;
                    let previous = children_table
                        .get(address)
                        .map_err(io_err)?
                        .map(|raw| decode_children(raw.value()))
                        .transpose()?
                        .unwrap_or_default();
                    for child in previous {
                        referrers.remove((child.0, address)).map_err(io_err)?;
                    }

                    blocks_table
                        .insert(address, block.content.as_slice())
                        .map_err(io_err)?;
                    let encoded = encode_children(&block.children)?;
                    children_table
                        .insert(address, encoded.as_slice())
                        .map_err(io_err)?;
                    for child in &block.children {
                        referrers.insert((child.0, address), ()).map_err(io_err)?;
                    }
                }

                // Reachability-gated deletion, repeated to a fixpoint.
                let mut pending: BTreeSet<u64> = delete_candidates.iter().map(|a| a.0).collect();
                loop {
                    let mut free = Vec::new();
                    for &address in &pending {
                        let referenced = referrers
                            .range((address, 0u64)..=(address, u64::MAX))
                            .map_err(io_err)?
                            .next()
                            .is_some();
                        if !referenced {
                            free.push(address);
                        }
                    }
                    if free.is_empty() {
                        break;
                    }
                    for address in free {
                        pending.remove(&address);
                        let outgoing = children_table
                            .remove(address)
                            .map_err(io_err)?
                            .map(|raw| decode_children(raw.value()))
                            .transpose()?
                            .unwrap_or_default();
                        for child in outgoing {
                            referrers.remove((child.0, address)).map_err(io_err)?;
                        }
                        if blocks_table.remove(address).map_err(io_err)?.is_some() {
                            deleted += 1;
                        }
                    }
                }
            }
            write_txn.commit().map_err(io_err)?;

            tracing::trace!(written = blocks.len(), deleted, "block batch committed");
            Ok(())
        })
    }

    fn scan(&self) -> Result<Vec<Block>, TesseraError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(io_err)?;
            let blocks_table = read_txn.open_table(BLOCKS).map_err(io_err)?;
            let children_table = read_txn.open_table(CHILDREN).map_err(io_err)?;

            let mut out = Vec::new();
            for entry in blocks_table.iter().map_err(io_err)? {
                let (key, value) = entry.map_err(io_err)?;
                let address = key.value();
                let children = match children_table.get(address).map_err(io_err)? {
                    Some(raw) => decode_children(raw.value())?,
                    None => Vec::new(),
                };
                out.push(Block::new(Address(address), value.value().to_vec(), children));
            }
            Ok(out)
        })
    }

    fn missing_references(&self) -> Result<Vec<Address>, TesseraError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(io_err)?;
            let blocks_table = read_txn.open_table(BLOCKS).map_err(io_err)?;
            let referrers = read_txn.open_table(REFERRERS).map_err(io_err)?;

            let mut referenced = BTreeSet::new();
            for entry in referrers.iter().map_err(io_err)? {
                let (key, _) = entry.map_err(io_err)?;
                referenced.insert(key.value().0);
            }

            let mut missing = Vec::new();
            for address in referenced {
                if blocks_table.get(address).map_err(io_err)?.is_none() {
                    missing.push(Address(address));
                }
            }
            Ok(missing)
        })
    }

    fn clear(&self) -> Result<(), TesseraError> {
        self.with_db(|db| {
            let write_txn = db.begin_write().map_err(io_err)?;
            write_txn.delete_table(BLOCKS).map_err(io_err)?;
            write_txn.delete_table(CHILDREN).map_err(io_err)?;
            write_txn.delete_table(REFERRERS).map_err(io_err)?;
            write_txn.open_table(BLOCKS).map_err(io_err)?;
            write_txn.open_table(CHILDREN).map_err(io_err)?;
            write_txn.open_table(REFERRERS).map_err(io_err)?;
            write_txn.commit().map_err(io_err)?;
            tracing::info!(path = %self.path.display(), "block store cleared");
            Ok(())
        })
    }

    fn block_count(&self) -> Result<u64, TesseraError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(io_err)?;
            let blocks_table = read_txn.open_table(BLOCKS).map_err(io_err)?;
            blocks_table.len().map_err(io_err)
        })
    }

    fn compact(&self) -> Result<(), TesseraError> {
        let mut guard = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(db) = guard.as_mut() {
            db.compact().map_err(io_err)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TesseraError> {
        let closed = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if closed.is_some() {
            tracing::debug!(path = %self.path.display(), "closed redb block store");
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn block(address: u64, children: &[u64]) -> Block {
        Block::new(
            Address(address),
            format!("block-{address}").into_bytes(),
            children.iter().copied().map(Address).collect(),
        )
    }

    #[test]
    fn put_get_roundtrip() {
        let temp = tempdir().expect("temp dir");
        let store = RedbBlockStore::open(temp.path().join("g.redb")).expect("open");

        store
            .put(vec![block(0, &[2]), block(2, &[])], &[])
            .expect("put");
        let got = store.get(Address(0)).expect("get").expect("present");
        assert_eq!(got, block(0, &[2]));
        assert!(store.get(Address(9)).expect("get").is_none());
        assert_eq!(store.block_count().expect("count"), 2);
    }

    #[test]
    fn persistence_after_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("g.redb");

        {
            let store = RedbBlockStore::open(&path).expect("open");
            store.put(vec![block(0, &[])], &[]).expect("put");
        }

        let store = RedbBlockStore::open(&path).expect("reopen");
        assert_eq!(store.scan().expect("scan"), vec![block(0, &[])]);
    }

    #[test]
    fn gated_deletion_cascades() {
        let temp = tempdir().expect("temp dir");
        let store = RedbBlockStore::open(temp.path().join("g.redb")).expect("open");
        store
            .put(vec![block(0, &[2]), block(2, &[3]), block(3, &[])], &[])
            .expect("put");

        // Candidate 3 is still referenced by 2: kept.
        store.put(vec![], &[Address(3)]).expect("put");
        assert!(store.get(Address(3)).expect("get").is_some());

        // Re-pointing the root frees 2, and deleting 2 frees 3.
        store
            .put(vec![block(0, &[4]), block(4, &[])], &[Address(3), Address(2)])
            .expect("put");
        assert!(store.get(Address(2)).expect("get").is_none());
        assert!(store.get(Address(3)).expect("get").is_none());
        assert!(store.missing_references().expect("refs").is_empty());
    }

    #[test]
    fn uncommitted_write_leaves_no_trace() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("g.redb");
        {
            let store = RedbBlockStore::open(&path).expect("open");
            store.put(vec![block(0, &[])], &[]).expect("put");

            // Simulate a crash mid-batch: the transaction is dropped before commit.
            store
                .with_db(|db| {
                    let write_txn = db.begin_write().map_err(io_err)?;
                    {
                        let mut table = write_txn.open_table(BLOCKS).map_err(io_err)?;
                        table.insert(7u64, b"partial".as_slice()).map_err(io_err)?;
                    }
                    drop(write_txn);
                    Ok(())
                })
                .expect("abandoned write");
        }

        let store = RedbBlockStore::open(&path).expect("reopen");
        assert!(store.get(Address(7)).expect("get").is_none());
        assert_eq!(store.block_count().expect("count"), 1);
    }

    #[test]
    fn clear_and_close() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("g.redb");
        let store = RedbBlockStore::open(&path).expect("open");
        store
            .put(vec![block(0, &[2]), block(2, &[])], &[])
            .expect("put");

        store.clear().expect("clear");
        assert_eq!(store.block_count().expect("count"), 0);

        store.close().expect("close");
        assert!(matches!(
            store.get(Address(0)),
            Err(TesseraError::StorageIo(_))
        ));

        // The file lock is released on close.
        let reopened = RedbBlockStore::open(&path).expect("reopen after close");
        assert_eq!(reopened.block_count().expect("count"), 0);
    }

    #[test]
    fn newer_layout_is_rejected() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("g.redb");
        {
            let db = Database::create(&path).expect("create");
            let write_txn = db.begin_write().expect("begin");
            {
                let mut meta = write_txn.open_table(METADATA).expect("meta");
                meta.insert(LAYOUT_KEY, STORE_LAYOUT_VERSION + 1).expect("insert");
            }
            write_txn.commit().expect("commit");
        }

        let err = RedbBlockStore::open(&path).unwrap_err();
        assert!(matches!(err, TesseraError::MigrationFailed { .. }));
    }
}
