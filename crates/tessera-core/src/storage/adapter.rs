//! # Storage Adapter
//!
//! Maps index pages onto blocks.
//!
//! `PageStore` is the in-memory arena every snapshot of one graph shares:
//! pages are loaded from the block store on first touch and kept as
//! `Arc<Page>` for the rest of the session. Newly allocated pages live only
//! in the arena until `persist` writes them.
//!
//! A commit writes, in one atomic `put`:
//! 1. every page allocated by the transaction,
//! 2. the schema record when it changed,
//! 3. the root record pointing at the new index roots,
//! and hands every superseded page to the store as a delete candidate.

use crate::db::Db;
use crate::formats::{
    BlockContent, RootRecord, decode_block, decode_record, encode_block, encode_page,
};
use crate::index::{IndexOrder, IndexRoots, Page, TreeWriter};
use crate::primitives::{BLOCK_FORMAT_VERSION, FIRST_PAGE_ADDRESS, ROOT_ADDRESS, SCHEMA_ADDRESS};
use crate::schema::SchemaRecord;
use crate::storage::{Block, BlockStore};
use crate::{Address, TesseraError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// =============================================================================
// PAGE DELTA
// =============================================================================

/// Page-level effect of one write batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageDelta {
    /// Pages created by the batch and reachable from its new roots.
    pub allocated: BTreeSet<Address>,
    /// Pages of the previous snapshot the batch replaced.
    pub superseded: BTreeSet<Address>,
    /// Whether the schema record must be rewritten.
    pub schema_changed: bool,
}

impl PageDelta {
    /// A delta that only rewrites the schema record.
    #[must_use]
    pub fn schema_only() -> Self {
        Self {
            schema_changed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated.is_empty() && self.superseded.is_empty() && !self.schema_changed
    }

    /// Fold the delta of a later batch staged on top of this one.
    ///
    /// Pages this delta allocated that `next` replaces are evicted and never
    /// written.
    pub(crate) fn absorb(&mut self, next: PageDelta, pages: &PageStore) {
        self.allocated.extend(next.allocated);
        for address in next.superseded {
            if self.allocated.remove(&address) {
                pages.evict(address);
            } else {
                self.superseded.insert(address);
            }
        }
        self.schema_changed |= next.schema_changed;
    }
}

// =============================================================================
// PAGE ARENA
// =============================================================================

/// Shared page arena of one graph.
pub struct PageStore {
    store: Arc<dyn BlockStore>,
    cache: RwLock<BTreeMap<Address, Arc<Page>>>,
    next_address: AtomicU64,
}

impl std::fmt::Debug for PageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageStore")
            .field("cached_pages", &self.cached_pages())
            .field("next_address", &self.next_address())
            .finish_non_exhaustive()
    }
}

impl PageStore {
    /// Create an arena whose allocator starts at `next_address`.
    #[must_use]
    pub fn new(store: Arc<dyn BlockStore>, next_address: u64) -> Self {
        Self {
            store,
            cache: RwLock::new(BTreeMap::new()),
            next_address: AtomicU64::new(next_address.max(FIRST_PAGE_ADDRESS)),
        }
    }

    /// The block store behind this arena.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Fetch a page, reading and decoding its block on first access.
    pub fn load(&self, address: Address) -> Result<Arc<Page>, TesseraError> {
        if let Some(page) = self.read_cache().get(&address) {
            return Ok(Arc::clone(page));
        }

        let block = self
            .store
            .get(address)?
            .ok_or(TesseraError::BlockNotFound(address))?;
        match decode_block(address, &block.content)? {
            BlockContent::Page(page) => {
                let mut cache = self.write_cache();
                let entry = cache.entry(address).or_insert_with(|| Arc::new(page));
                Ok(Arc::clone(entry))
            }
            other => Err(TesseraError::CorruptIndex {
                address,
                reason: format!("expected an index page, found a {} record", other.kind()),
            }),
        }
    }

    /// Place a new page in the arena under a fresh address.
    pub(crate) fn allocate(&self, page: Page) -> Address {
        let address = Address(self.next_address.fetch_add(1, Ordering::SeqCst));
        self.write_cache().insert(address, Arc::new(page));
        address
    }

    /// Drop a page from the arena.
    pub(crate) fn evict(&self, address: Address) {
        self.write_cache().remove(&address);
    }

    /// Next address the allocator will hand out.
    #[must_use]
    pub fn next_address(&self) -> u64 {
        self.next_address.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn cached_pages(&self) -> usize {
        self.read_cache().len()
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, BTreeMap<Address, Arc<Page>>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, BTreeMap<Address, Arc<Page>>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// HYDRATE / INITIALIZE / PERSIST
// =============================================================================

fn read_block(
    store: &dyn BlockStore,
    address: Address,
) -> Result<Option<BlockContent>, TesseraError> {
    match store.get(address)? {
        Some(block) => decode_block(address, &block.content).map(Some),
        None => Ok(None),
    }
}

/// Read the root or schema record. A record in another block format fails
/// with `MigrationFailed` instead of reporting damage.
fn read_record(
    store: &dyn BlockStore,
    address: Address,
) -> Result<Option<BlockContent>, TesseraError> {
    match store.get(address)? {
        Some(block) => decode_record(address, &block.content).map(Some),
        None => Ok(None),
    }
}

/// Rebuild the current snapshot from the root record.
///
/// Returns `None` for a store that has never been initialized. The three
/// index root pages are loaded eagerly so a damaged root surfaces here
/// rather than on the first query.
pub fn hydrate(store: Arc<dyn BlockStore>) -> Result<Option<Db>, TesseraError> {
    let root_address = Address(ROOT_ADDRESS);
    let root = match read_record(store.as_ref(), root_address)? {
        None => return Ok(None),
        Some(BlockContent::Root(root)) => root,
        Some(other) => {
            return Err(TesseraError::CorruptIndex {
                address: root_address,
                reason: format!("expected the root record, found a {} block", other.kind()),
            });
        }
    };

    let schema_address = Address(SCHEMA_ADDRESS);
    let schema = match read_record(store.as_ref(), schema_address)? {
        None => return Err(TesseraError::BlockNotFound(schema_address)),
        Some(BlockContent::Schema(record)) => record,
        Some(other) => {
            return Err(TesseraError::CorruptIndex {
                address: schema_address,
                reason: format!("expected the schema record, found a {} block", other.kind()),
            });
        }
    };

    let pages = Arc::new(PageStore::new(store, root.next_address));
    for address in root.roots.addresses() {
        pages.load(address)?;
    }

    tracing::debug!(
        max_tx = root.max_tx,
        max_eid = root.max_eid,
        schema_version = schema.version,
        "hydrated snapshot"
    );
    Ok(Some(Db::from_parts(
        pages,
        Arc::new(schema),
        root.roots,
        root.max_eid,
        root.max_tx,
    )))
}

/// Write an empty graph (three empty indexes) with the given schema record.
pub fn initialize(store: Arc<dyn BlockStore>, schema: SchemaRecord) -> Result<Db, TesseraError> {
    let (db, delta) = stage_empty(store, schema, FIRST_PAGE_ADDRESS)?;
    persist(&db, &delta)?;
    tracing::debug!(schema_version = db.schema_version(), "initialized empty graph");
    Ok(db)
}

/// Build an empty graph in a fresh arena without writing anything.
///
/// Pages are allocated from `next_address` upwards. The returned delta
/// rewrites the schema record when persisted.
pub(crate) fn stage_empty(
    store: Arc<dyn BlockStore>,
    schema: SchemaRecord,
    next_address: u64,
) -> Result<(Db, PageDelta), TesseraError> {
    schema.schema.validate()?;
    let pages = Arc::new(PageStore::new(store, next_address));
    let mut delta = PageDelta::schema_only();
    let roots = {
        let mut writer = TreeWriter::new(&pages, &mut delta);
        IndexRoots {
            eavt: writer.empty_root(),
            aevt: writer.empty_root(),
            avet: writer.empty_root(),
        }
    };
    Ok((Db::from_parts(pages, Arc::new(schema), roots, 0, 0), delta))
}

/// Durably commit `db` as the current snapshot.
pub fn persist(db: &Db, delta: &PageDelta) -> Result<(), TesseraError> {
    let pages = db.pages();
    let mut blocks = Vec::with_capacity(delta.allocated.len() + 2);

    for &address in &delta.allocated {
        let page = pages.load(address)?;
        blocks.push(Block::new(
            address,
            encode_page(&page)?,
            page.child_addresses().to_vec(),
        ));
    }

    if delta.schema_changed {
        blocks.push(Block::new(
            Address(SCHEMA_ADDRESS),
            encode_block(&BlockContent::Schema(db.schema_record().clone()))?,
            Vec::new(),
        ));
    }

    let root = db.root_record();
    let mut root_children = vec![Address(SCHEMA_ADDRESS)];
    root_children.extend(root.roots.addresses());
    blocks.push(Block::new(
        Address(ROOT_ADDRESS),
        encode_block(&BlockContent::Root(root))?,
        root_children,
    ));

    let candidates: Vec<Address> = delta.superseded.iter().copied().collect();
    pages.store().put(blocks, &candidates)
}

/// Forget the pages of a batch that will never be committed.
pub(crate) fn discard(pages: &PageStore, delta: &PageDelta) {
    for &address in &delta.allocated {
        pages.evict(address);
    }
}

impl Db {
    pub(crate) fn root_record(&self) -> RootRecord {
        RootRecord {
            format_version: BLOCK_FORMAT_VERSION,
            roots: self.roots(),
            max_eid: self.max_eid().0,
            max_tx: self.max_tx().0,
            next_address: self.pages().next_address(),
        }
    }
}

// =============================================================================
// INTEGRITY
// =============================================================================

/// How thoroughly to check the stored index when a graph is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityCheck {
    /// Trust the root record.
    None,
    /// Check that no stored block references a missing block.
    #[default]
    References,
    /// Additionally read and decode every page reachable from the roots.
    Full,
}

/// Check the stored index behind `db`.
///
/// Fails with `BlockNotFound` or `CorruptIndex`, which callers treat as
/// index damage. Full verification decodes pages without adding them to the
/// arena.
pub fn verify(db: &Db, check: IntegrityCheck) -> Result<(), TesseraError> {
    if check == IntegrityCheck::None {
        return Ok(());
    }
    let store = db.pages().store();
    if let Some(&missing) = store.missing_references()?.first() {
        return Err(TesseraError::BlockNotFound(missing));
    }
    if check == IntegrityCheck::References {
        return Ok(());
    }

    let mut seen = BTreeSet::new();
    for order in IndexOrder::ALL {
        let mut stack = vec![db.roots().get(order)];
        while let Some(address) = stack.pop() {
            if !seen.insert(address) {
                continue;
            }
            match read_block(store.as_ref(), address)? {
                None => return Err(TesseraError::BlockNotFound(address)),
                Some(BlockContent::Page(page)) => {
                    stack.extend(page.child_addresses().iter().copied());
                }
                Some(other) => {
                    return Err(TesseraError::CorruptIndex {
                        address,
                        reason: format!("{order} index reaches a {} block", other.kind()),
                    });
                }
            }
        }
    }
    tracing::debug!(pages = seen.len(), "full integrity check passed");
    Ok(())
}
