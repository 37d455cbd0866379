//! # Scenario Tier Tests (T0-T4)
//!
//! End-to-end behavior through the public API.
//!
//! ## Tiers
//! - T0: Transaction Rules
//! - T1: Atomicity and Snapshots
//! - T2: Durability
//! - T3: Migration
//! - T4: Recovery

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tessera_core::index::Page;
use tessera_core::storage::Block;
use tessera_core::{
    Address, AttributeSpec, BlockStore, Connection, Db, EntityId, EntityRef, IndexOrder,
    IntegrityCheck, MemoryBackupSink, MemoryBlockStore, MemoryProvider, OpenOptions, Pattern,
    Schema, SessionConfig, SessionManager, StorageProvider, TesseraError, TxMeta, TxOp, Unique,
    Value, ValueType,
};

fn schema() -> Schema {
    Schema::new()
        .with("title", AttributeSpec::one(ValueType::String))
        .with("tag", AttributeSpec::many(ValueType::Keyword))
        .with(
            "email",
            AttributeSpec::one(ValueType::String).unique(Unique::Identity),
        )
        .with("parent", AttributeSpec::one(ValueType::Ref))
}

fn memory_session() -> (Arc<MemoryProvider>, Arc<MemoryBackupSink>, SessionManager) {
    let provider = Arc::new(MemoryProvider::new());
    let backups = Arc::new(MemoryBackupSink::new());
    let manager = SessionManager::new(SessionConfig {
        provider: provider.clone(),
        backup: backups.clone(),
        integrity: IntegrityCheck::Full,
    });
    (provider, backups, manager)
}

fn open(manager: &SessionManager, graph_id: &str) -> Arc<Connection> {
    manager
        .open(graph_id, OpenOptions::new().with_schema(schema()))
        .expect("open")
}

/// Address and content of the leftmost leaf of one index.
fn leftmost_leaf(db: &Db, order: IndexOrder) -> (Address, Arc<Page>) {
    let mut address = db.roots().get(order);
    loop {
        let page = db.pages().load(address).expect("page");
        match page.as_ref() {
            Page::Branch { children, .. } => address = children[0],
            Page::Leaf(_) => return (address, page),
        }
    }
}

fn title(conn: &Connection, e: u64) -> Vec<Value> {
    conn.db()
        .query(&Pattern::entity(EntityId(e)).with_attribute("title"))
        .map(|d| d.expect("read").v)
        .collect()
}

// =============================================================================
// TIER T0: TRANSACTION RULES
// =============================================================================

mod t0_transaction_rules {
    use super::*;

    /// T0.1: A cardinality-one value must be retracted before it is replaced.
    #[test]
    fn cardinality_one_title_replacement() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");

        conn.transact(
            vec![TxOp::add(EntityId(1), "title", Value::str("A"))],
            TxMeta::new(),
        )
        .expect("first title");

        let err = conn
            .transact(
                vec![TxOp::add(EntityId(1), "title", Value::str("B"))],
                TxMeta::new(),
            )
            .expect_err("second title must be rejected");
        assert!(matches!(err, TesseraError::ConstraintViolation { .. }));
        assert_eq!(title(&conn, 1), vec![Value::str("A")]);

        conn.transact(
            vec![
                TxOp::retract(EntityId(1), "title", Value::str("A")),
                TxOp::add(EntityId(1), "title", Value::str("B")),
            ],
            TxMeta::new(),
        )
        .expect("replace title");
        assert_eq!(title(&conn, 1), vec![Value::str("B")]);
    }

    /// T0.2: Unknown attributes and mistyped values are rejected.
    #[test]
    fn schema_is_enforced() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");

        let undeclared = conn.transact(
            vec![TxOp::add(EntityId(1), "colour", Value::str("red"))],
            TxMeta::new(),
        );
        assert!(matches!(
            undeclared,
            Err(TesseraError::ConstraintViolation { .. })
        ));

        let mistyped = conn.transact(
            vec![TxOp::add(EntityId(1), "title", Value::Long(7))],
            TxMeta::new(),
        );
        assert!(matches!(
            mistyped,
            Err(TesseraError::ConstraintViolation { .. })
        ));
    }

    /// T0.3: A unique identity value upserts through a tempid.
    #[test]
    fn identity_upsert_through_tempid() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "people");

        let first = conn
            .transact(
                vec![TxOp::add(
                    EntityRef::temp("ada"),
                    "email",
                    Value::str("ada@example.org"),
                )],
                TxMeta::new(),
            )
            .expect("create");
        let ada = first.tempid("ada").expect("resolved");

        let second = conn
            .transact(
                vec![
                    TxOp::add(EntityRef::temp("x"), "email", Value::str("ada@example.org")),
                    TxOp::add(EntityRef::temp("x"), "title", Value::str("Countess")),
                ],
                TxMeta::new(),
            )
            .expect("upsert");
        assert_eq!(second.tempid("x"), Some(ada));
        assert_eq!(title(&conn, ada.0), vec![Value::str("Countess")]);

        // The same value on an explicit, different entity is a conflict.
        let clash = conn.transact(
            vec![TxOp::add(
                EntityId(ada.0 + 100),
                "email",
                Value::str("ada@example.org"),
            )],
            TxMeta::new(),
        );
        assert!(clash.is_err());
    }

    /// T0.4: Re-asserting an existing datom changes nothing.
    #[test]
    fn reassertion_is_noop() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        let op = || TxOp::add(EntityId(1), "tag", Value::Keyword("draft".into()));

        conn.transact(vec![op()], TxMeta::new()).expect("first");
        let again = conn.transact(vec![op()], TxMeta::new()).expect("again");
        assert!(again.is_noop());
        assert_eq!(conn.db().count().expect("count"), 1);
    }

    /// T0.5: Retracting an entity removes every datom it holds.
    #[test]
    fn retract_entity_clears_all_attributes() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        conn.transact(
            vec![
                TxOp::add(EntityId(1), "title", Value::str("a")),
                TxOp::add(EntityId(1), "tag", Value::Keyword("x".into())),
                TxOp::add(EntityId(1), "tag", Value::Keyword("y".into())),
                TxOp::add(EntityId(2), "parent", Value::Ref(EntityId(1))),
            ],
            TxMeta::new(),
        )
        .expect("seed");

        let report = conn
            .transact(vec![TxOp::retract_entity(EntityId(1))], TxMeta::new())
            .expect("retract");
        assert_eq!(report.datoms_retracted.len(), 3);
        assert!(conn.db().entity(EntityId(1)).expect("entity").is_empty());
        // References to the entity are left alone.
        assert_eq!(conn.db().entity(EntityId(2)).expect("entity").len(), 1);
    }
}

// =============================================================================
// TIER T1: ATOMICITY AND SNAPSHOTS
// =============================================================================

mod t1_atomicity {
    use super::*;

    /// T1.1: One bad operation rejects the whole batch.
    #[test]
    fn failed_batch_applies_nothing() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        let before = conn.db();

        let result = conn.transact(
            vec![
                TxOp::add(EntityId(1), "title", Value::str("ok")),
                TxOp::add(EntityId(2), "title", Value::str("ok too")),
                TxOp::add(EntityId(3), "nope", Value::str("bad")),
            ],
            TxMeta::new(),
        );
        assert!(result.is_err());
        assert_eq!(conn.db().count().expect("count"), 0);
        assert_eq!(conn.db().max_tx(), before.max_tx());
    }

    /// T1.2: A held snapshot never changes.
    #[test]
    fn snapshots_are_immutable() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        let ops: Vec<TxOp> = (1..=300)
            .map(|e| TxOp::add(EntityId(e), "title", Value::str(format!("v{e}"))))
            .collect();
        conn.transact(ops, TxMeta::new()).expect("seed");
        let snapshot = conn.db();

        let retract: Vec<TxOp> = (1..=300)
            .filter(|e| e % 2 == 0)
            .map(|e| TxOp::retract_attribute(EntityId(e), "title"))
            .collect();
        conn.transact(retract, TxMeta::new()).expect("retract half");

        assert_eq!(snapshot.count().expect("old count"), 300);
        assert_eq!(conn.db().count().expect("new count"), 150);
        let old: Vec<_> = snapshot
            .datoms(IndexOrder::Aevt, Pattern::attribute("title"))
            .collect::<Result<_, _>>()
            .expect("old read");
        assert_eq!(old.len(), 300);
    }

    /// T1.3: Transactions from several threads are applied one at a time.
    #[test]
    fn concurrent_writers_are_serialized() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let conn = Arc::clone(&conn);
                std::thread::spawn(move || {
                    for i in 0..10u64 {
                        let e = EntityId(t * 100 + i + 1);
                        conn.transact(
                            vec![TxOp::add(e, "tag", Value::Keyword(format!("t{t}")))],
                            TxMeta::new(),
                        )
                        .expect("transact");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }

        let db = conn.db();
        assert_eq!(db.count().expect("count"), 40);
        assert_eq!(db.max_tx().0, 40);
    }
}

// =============================================================================
// TIER T2: DURABILITY
// =============================================================================

/// Block store whose writes can be made to fail, to stand in for a crash
/// that interrupts the durable write.
struct FlakyStore {
    inner: MemoryBlockStore,
    fail: Arc<AtomicBool>,
}

impl BlockStore for FlakyStore {
    fn get(&self, address: Address) -> Result<Option<Block>, TesseraError> {
        self.inner.get(address)
    }

    fn put(&self, blocks: Vec<Block>, delete: &[Address]) -> Result<(), TesseraError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TesseraError::StorageIo("write interrupted".to_string()));
        }
        self.inner.put(blocks, delete)
    }

    fn scan(&self) -> Result<Vec<Block>, TesseraError> {
        self.inner.scan()
    }

    fn missing_references(&self) -> Result<Vec<Address>, TesseraError> {
        self.inner.missing_references()
    }

    fn clear(&self) -> Result<(), TesseraError> {
        self.inner.clear()
    }

    fn block_count(&self) -> Result<u64, TesseraError> {
        self.inner.block_count()
    }

    fn close(&self) -> Result<(), TesseraError> {
        self.inner.close()
    }
}

#[derive(Default)]
struct FlakyProvider {
    stores: Mutex<Vec<(String, MemoryBlockStore)>>,
    fail: Arc<AtomicBool>,
}

impl StorageProvider for FlakyProvider {
    fn open(&self, graph_id: &str) -> Result<Arc<dyn BlockStore>, TesseraError> {
        let mut stores = self.stores.lock().expect("lock");
        if !stores.iter().any(|(id, _)| id == graph_id) {
            stores.push((graph_id.to_string(), MemoryBlockStore::new()));
        }
        let (_, store) = stores
            .iter()
            .find(|(id, _)| id == graph_id)
            .expect("present");
        Ok(Arc::new(FlakyStore {
            inner: store.handle(),
            fail: Arc::clone(&self.fail),
        }))
    }

    fn exists(&self, graph_id: &str) -> Result<bool, TesseraError> {
        let stores = self.stores.lock().expect("lock");
        Ok(stores.iter().any(|(id, _)| id == graph_id))
    }

    fn remove(&self, graph_id: &str) -> Result<(), TesseraError> {
        self.stores
            .lock()
            .expect("lock")
            .retain(|(id, _)| id != graph_id);
        Ok(())
    }
}

mod t2_durability {
    use super::*;

    /// T2.1: An interrupted commit leaves the store fully pre-transaction.
    #[test]
    fn interrupted_commit_leaves_previous_state() {
        let provider = Arc::new(FlakyProvider::default());
        let manager = SessionManager::new(SessionConfig {
            provider: provider.clone(),
            backup: Arc::new(MemoryBackupSink::new()),
            integrity: IntegrityCheck::Full,
        });
        let conn = open(&manager, "notes");
        conn.transact(
            vec![TxOp::add(EntityId(1), "title", Value::str("kept"))],
            TxMeta::new(),
        )
        .expect("first");
        let committed_tx = conn.db().max_tx();

        provider.fail.store(true, Ordering::SeqCst);
        let err = conn
            .transact(
                vec![TxOp::add(EntityId(2), "title", Value::str("lost"))],
                TxMeta::new(),
            )
            .expect_err("write fails");
        assert!(matches!(err, TesseraError::StorageIo(_)));
        assert_eq!(conn.db().max_tx(), committed_tx);
        assert_eq!(conn.db().count().expect("count"), 1);
        provider.fail.store(false, Ordering::SeqCst);

        // The next commit reuses the tx id the failed one would have had.
        let next = conn
            .transact(
                vec![TxOp::add(EntityId(3), "title", Value::str("next"))],
                TxMeta::new(),
            )
            .expect("after failure");
        assert_eq!(next.tx_id, committed_tx.next());

        manager.close("notes").expect("close");
        let reopened = open(&manager, "notes");
        assert_eq!(reopened.db().count().expect("count"), 2);
        assert!(title(&reopened, 2).is_empty());
        assert!(reopened.validate().expect("validate").is_valid());
    }

    /// T2.2: redb graphs keep their data across a dropped manager.
    #[test]
    fn redb_graph_reopens_after_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig::on_disk(temp.path().join("data"), temp.path().join("bak"));
        let export = {
            let manager = SessionManager::new(config.clone());
            let conn = open(&manager, "notes");
            for e in 1..=20 {
                conn.transact(
                    vec![TxOp::add(EntityId(e), "title", Value::str(format!("n{e}")))],
                    TxMeta::new(),
                )
                .expect("transact");
            }
            conn.export().expect("export")
        };

        let manager = SessionManager::new(config);
        let conn = open(&manager, "notes");
        assert_eq!(conn.db().max_tx().0, 20);
        assert_eq!(conn.export().expect("export"), export);
    }
}

// =============================================================================
// TIER T3: MIGRATION
// =============================================================================

mod t3_migration {
    use super::*;
    use tessera_core::CURRENT_SCHEMA_VERSION;
    use tessera_core::migrate;

    /// T3.1: Migrations run once; the stored version never goes back.
    #[test]
    fn migration_is_idempotent_across_opens() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        assert_eq!(conn.db().schema_version(), CURRENT_SCHEMA_VERSION);
        assert!(migrate(&conn).expect("migrate").is_noop());

        manager.close("notes").expect("close");
        let conn = open(&manager, "notes");
        assert_eq!(conn.db().schema_version(), CURRENT_SCHEMA_VERSION);
        assert!(migrate(&conn).expect("migrate").is_noop());
    }

    /// T3.2: Built-in attributes are usable after migration.
    #[test]
    fn builtin_ident_is_available() {
        let (_, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        let report = conn
            .transact(
                vec![TxOp::add(
                    EntityRef::temp("t"),
                    "db/ident",
                    Value::Keyword("tag/draft".into()),
                )],
                TxMeta::new(),
            )
            .expect("ident");
        let id = report.tempid("t").expect("resolved");

        let hits: Vec<_> = conn
            .db()
            .query(&Pattern::attribute("db/ident").with_value(Value::Keyword("tag/draft".into())))
            .collect::<Result<_, _>>()
            .expect("lookup");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].e, id);
    }
}

// =============================================================================
// TIER T4: RECOVERY
// =============================================================================

mod t4_recovery {
    use super::*;
    use tessera_core::primitives::BLOCK_FORMAT_VERSION;
    use tessera_core::storage::{initialize, persist};
    use tessera_core::{CURRENT_SCHEMA_VERSION, SchemaRecord, import_canonical};

    /// T4.1: Corrupting one leaf loses only what lived there, and only in
    /// the index it belonged to; the other indexes restore it.
    #[test]
    fn single_page_corruption_is_rebuilt() {
        let (provider, backups, manager) = memory_session();
        let conn = open(&manager, "notes");
        let ops: Vec<TxOp> = (1..=500)
            .map(|e| TxOp::add(EntityId(e), "title", Value::str(format!("n{e}"))))
            .collect();
        conn.transact(ops, TxMeta::new()).expect("seed");
        let db = conn.db();
        let original = db.count().expect("count");
        let root = db.roots().eavt;
        let leaf = db
            .index_pages(IndexOrder::Eavt)
            .expect("pages")
            .into_iter()
            .find(|a| *a != root)
            .expect("leaf");
        manager.close("notes").expect("close");

        provider
            .store("notes")
            .expect("store")
            .insert_raw(leaf, vec![0xde, 0xad]);

        let conn = open(&manager, "notes");
        assert_eq!(conn.db().count().expect("count"), original);
        assert!(conn.validate().expect("validate").is_valid());

        let saved = backups.backups();
        assert_eq!(saved.len(), 1);
        let graph = import_canonical(&saved[0].1).expect("backup decodes");
        assert_eq!(graph.datoms.len(), original);
    }

    /// T4.2: With every copy of some datoms gone, the rest survive.
    #[test]
    fn loss_in_every_index_drops_only_those_datoms() {
        let (provider, _, manager) = memory_session();
        let conn = open(&manager, "notes");
        // One attribute, one datom per entity: EAVT and AEVT see the same
        // inserts in the same order and end up with the same leaves.
        let ops: Vec<TxOp> = (1..=500)
            .map(|e| TxOp::add(EntityId(e), "title", Value::str(format!("n{e}"))))
            .collect();
        conn.transact(ops, TxMeta::new()).expect("seed");
        let db = conn.db();

        let (eavt_leaf, eavt_page) = leftmost_leaf(&db, IndexOrder::Eavt);
        let (aevt_leaf, aevt_page) = leftmost_leaf(&db, IndexOrder::Aevt);
        assert_eq!(eavt_page, aevt_page);
        let Page::Leaf(lost) = eavt_page.as_ref() else {
            unreachable!("leftmost_leaf returns leaves");
        };
        manager.close("notes").expect("close");

        let store = provider.store("notes").expect("store");
        store.insert_raw(eavt_leaf, Vec::new());
        store.insert_raw(aevt_leaf, Vec::new());

        let conn = open(&manager, "notes");
        assert_eq!(conn.db().count().expect("count"), 500 - lost.len());
        for datom in lost {
            assert!(conn.db().entity(datom.e).expect("entity").is_empty());
        }
        assert!(conn.validate().expect("validate").is_valid());
    }

    /// T4.3: A graph written in a newer block format is refused on open
    /// and on rebuild, and nothing is exported or deleted.
    #[test]
    fn newer_block_format_is_refused_without_loss() {
        let (provider, backups, manager) = memory_session();
        let conn = open(&manager, "notes");
        for e in 1..=50 {
            conn.transact(
                vec![TxOp::add(EntityId(e), "title", Value::str(format!("n{e}")))],
                TxMeta::new(),
            )
            .expect("transact");
        }
        manager.close("notes").expect("close");

        let store = provider.store("notes").expect("store");
        for block in store.scan().expect("scan") {
            let mut content = block.content;
            content[4] = BLOCK_FORMAT_VERSION + 1;
            store.insert_raw(block.address, content);
        }
        let stored = store.scan().expect("scan");

        let err = manager
            .open("notes", OpenOptions::new())
            .expect_err("newer format");
        assert!(matches!(err, TesseraError::MigrationFailed { .. }));
        let err = manager
            .rebuild("notes", OpenOptions::new())
            .expect_err("newer format");
        assert!(matches!(err, TesseraError::MigrationFailed { .. }));

        assert!(backups.backups().is_empty());
        assert_eq!(store.scan().expect("scan"), stored);
    }

    /// T4.4: A damaged graph stamped with a newer schema version is refused
    /// before the store is touched.
    #[test]
    fn newer_schema_version_with_damage_is_refused() {
        let (provider, backups, manager) = memory_session();
        // Create the graph's store, then write it as a newer build would.
        manager.open("notes", OpenOptions::new()).expect("open");
        manager.close("notes").expect("close");
        let store = provider.store("notes").expect("store");
        store.clear().expect("clear");

        let handle: Arc<dyn BlockStore> = Arc::new(store.handle());
        let record = SchemaRecord::new(CURRENT_SCHEMA_VERSION + 1, schema());
        let db = initialize(handle, record).expect("initialize");
        let ops: Vec<TxOp> = (1..=300)
            .map(|e| TxOp::add(EntityId(e), "title", Value::str(format!("n{e}"))))
            .collect();
        let report = db.transact(ops, TxMeta::new()).expect("transact");
        persist(&report.db_after, &report.delta).expect("persist");
        let (leaf, _) = leftmost_leaf(&report.db_after, IndexOrder::Eavt);
        store.insert_raw(leaf, vec![0xba, 0xd0]);
        let stored = store.scan().expect("scan");

        let err = manager
            .open("notes", OpenOptions::new())
            .expect_err("newer schema");
        assert!(matches!(
            err,
            TesseraError::MigrationFailed { stored, .. } if stored == CURRENT_SCHEMA_VERSION + 1
        ));
        assert!(backups.backups().is_empty());
        assert_eq!(store.scan().expect("scan"), stored);
    }

    /// T4.5: A rebuild interrupted before its commit lands leaves the old
    /// blocks in place, and the next open rebuilds from them in full.
    #[test]
    fn interrupted_rebuild_is_retried_on_next_open() {
        let provider = Arc::new(FlakyProvider::default());
        let backups = Arc::new(MemoryBackupSink::new());
        let manager = SessionManager::new(SessionConfig {
            provider: provider.clone(),
            backup: backups.clone(),
            integrity: IntegrityCheck::Full,
        });
        let conn = open(&manager, "notes");
        for chunk in 0..5u64 {
            let ops: Vec<TxOp> = (1..=10)
                .map(|i| {
                    let e = chunk * 10 + i;
                    TxOp::add(EntityId(e), "title", Value::str(format!("n{e}")))
                })
                .collect();
            conn.transact(ops, TxMeta::new()).expect("seed");
        }
        let export = conn.export().expect("export");
        let root = conn.db().roots().eavt;
        manager.close("notes").expect("close");

        let store = {
            let stores = provider.stores.lock().expect("lock");
            stores[0].1.handle()
        };
        store.insert_raw(root, b"torn".to_vec());

        provider.fail.store(true, Ordering::SeqCst);
        let err = manager
            .open("notes", OpenOptions::new())
            .expect_err("rebuild cannot commit");
        assert!(matches!(err, TesseraError::RebuildFailed(_)));
        assert_eq!(backups.backups().len(), 1);
        assert!(store.get(root).expect("get").is_some());
        provider.fail.store(false, Ordering::SeqCst);

        let conn = manager
            .open("notes", OpenOptions::new())
            .expect("reopen");
        assert_eq!(conn.db().count().expect("count"), 50);
        assert_eq!(conn.db().max_tx().0, 5);
        assert!(conn.validate().expect("validate").is_valid());
        assert_eq!(conn.export().expect("export"), export);
        assert_eq!(backups.backups().len(), 2);
    }
}
