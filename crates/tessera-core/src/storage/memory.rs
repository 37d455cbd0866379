//! In-process `BlockStore`.

use super::block::{Block, BlockStore};
use crate::{Address, TesseraError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<Address, Block>,
    puts: u64,
}

/// A `BlockStore` held entirely in memory.
///
/// Handles created with [`MemoryBlockStore::handle`] share the same blocks
/// but close independently, which lets a graph be closed and reopened
/// without losing its data.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<Inner>>,
    closed: AtomicBool,
}

impl MemoryBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh, open handle onto the same blocks.
    #[must_use]
    pub fn handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of committed `put` batches.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.read().puts
    }

    /// Store raw bytes at an address without any reference bookkeeping.
    pub fn insert_raw(&self, address: Address, content: Vec<u8>) {
        let mut inner = self.write();
        let children = inner
            .blocks
            .get(&address)
            .map(|b| b.children.clone())
            .unwrap_or_default();
        inner
            .blocks
            .insert(address, Block::new(address, content, children));
    }

    /// Drop a block without any reference bookkeeping.
    pub fn remove_raw(&self, address: Address) -> Option<Block> {
        self.write().blocks.remove(&address)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), TesseraError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TesseraError::StorageIo("memory store is closed".to_string()));
        }
        Ok(())
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, address: Address) -> Result<Option<Block>, TesseraError> {
        self.ensure_open()?;
        Ok(self.read().blocks.get(&address).cloned())
    }

    fn put(&self, blocks: Vec<Block>, delete_candidates: &[Address]) -> Result<(), TesseraError> {
        self.ensure_open()?;
        // Nothing below can fail, so holding the write lock is enough for
        // readers to see either the old or the new state.
        let mut inner = self.write();
        for block in blocks {
            inner.blocks.insert(block.address, block);
        }

        let mut referrers: BTreeMap<Address, usize> = BTreeMap::new();
        for block in inner.blocks.values() {
            for child in &block.children {
                *referrers.entry(*child).or_default() += 1;
            }
        }

        let mut pending: BTreeSet<Address> = delete_candidates.iter().copied().collect();
        loop {
            let free: Vec<Address> = pending
                .iter()
                .copied()
                .filter(|a| referrers.get(a).copied().unwrap_or(0) == 0)
                .collect();
            if free.is_empty() {
                break;
            }
            for address in free {
                pending.remove(&address);
                if let Some(block) = inner.blocks.remove(&address) {
                    for child in block.children {
                        if let Some(count) = referrers.get_mut(&child) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
        }

        inner.puts += 1;
        Ok(())
    }

    fn scan(&self) -> Result<Vec<Block>, TesseraError> {
        self.ensure_open()?;
        Ok(self.read().blocks.values().cloned().collect())
    }

    fn missing_references(&self) -> Result<Vec<Address>, TesseraError> {
        self.ensure_open()?;
        let inner = self.read();
        let missing: BTreeSet<Address> = inner
            .blocks
            .values()
            .flat_map(|b| b.children.iter().copied())
            .filter(|child| !inner.blocks.contains_key(child))
            .collect();
        Ok(missing.into_iter().collect())
    }

    fn clear(&self) -> Result<(), TesseraError> {
        self.ensure_open()?;
        let mut inner = self.write();
        inner.blocks.clear();
        inner.puts += 1;
        Ok(())
    }

    fn block_count(&self) -> Result<u64, TesseraError> {
        self.ensure_open()?;
        Ok(self.read().blocks.len() as u64)
    }

    fn close(&self) -> Result<(), TesseraError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
