//! # Session Module
//!
//! Lifecycle of named graphs.
//!
//! A `SessionManager` owns every open `Connection` and moves each graph
//! through `Closed -> Opening -> Open -> Closing -> Closed`. `Unlinked` is
//! reachable only from `Closed` and is final for the lifetime of the
//! manager.
//!
//! Opening a graph:
//! 1. open its block store through the `StorageProvider`
//! 2. hydrate the root record and run the configured integrity check
//! 3. on index damage, rebuild (safety export first)
//! 4. initialize brand-new graphs at the base schema version
//! 5. run migrations, then add newly supplied schema attributes
//! 6. attach the manager's commit listeners
//!
//! ## Storage Backends
//!
//! - `RedbProvider`: one redb file per graph under a data directory
//! - `MemoryProvider`: in-process stores that survive close/reopen

use crate::connection::Connection;
use crate::db::Db;
use crate::export::import_canonical;
use crate::listener::TxListener;
use crate::migration::migrate;
use crate::primitives::{
    BASE_SCHEMA_VERSION, FIRST_PAGE_ADDRESS, MAX_GRAPH_ID_LENGTH, ROOT_ADDRESS,
};
use crate::recovery::{
    BackupSink, DirBackupSink, MemoryBackupSink, RebuildReport, rebuild, stage_graph,
};
use crate::schema::{Schema, SchemaRecord};
use crate::storage::{
    BlockStore, IntegrityCheck, MemoryBlockStore, RedbBlockStore, hydrate, initialize, persist,
    verify,
};
use crate::{Address, TesseraError};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

// =============================================================================
// GRAPH STATE
// =============================================================================

/// Lifecycle state of one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GraphState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
    Unlinked,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Unlinked => "unlinked",
        };
        f.write_str(name)
    }
}

/// Reject graph ids that are empty, too long, or unsafe as file names.
pub fn validate_graph_id(graph_id: &str) -> Result<(), TesseraError> {
    let valid = !graph_id.is_empty()
        && graph_id.len() <= MAX_GRAPH_ID_LENGTH
        && graph_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid {
        return Err(TesseraError::InvalidOperation(format!(
            "invalid graph id '{graph_id}': use 1-{MAX_GRAPH_ID_LENGTH} ASCII letters, digits, '-' or '_'"
        )));
    }
    Ok(())
}

// =============================================================================
// STORAGE PROVIDERS
// =============================================================================

/// Maps graph ids to block stores.
pub trait StorageProvider: Send + Sync {
    /// Open (creating if needed) the store of `graph_id`.
    fn open(&self, graph_id: &str) -> Result<Arc<dyn BlockStore>, TesseraError>;

    /// Whether `graph_id` has durable data.
    fn exists(&self, graph_id: &str) -> Result<bool, TesseraError>;

    /// Delete the durable data of `graph_id`. Missing data is not an error.
    fn remove(&self, graph_id: &str) -> Result<(), TesseraError>;
}

/// One redb file per graph: `<dir>/<graph_id>.redb`.
#[derive(Debug, Clone)]
pub struct RedbProvider {
    dir: PathBuf,
}

impl RedbProvider {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `graph_id`.
    pub fn path_for(&self, graph_id: &str) -> Result<PathBuf, TesseraError> {
        validate_graph_id(graph_id)?;
        Ok(self.dir.join(format!("{graph_id}.redb")))
    }
}

impl StorageProvider for RedbProvider {
    fn open(&self, graph_id: &str) -> Result<Arc<dyn BlockStore>, TesseraError> {
        let path = self.path_for(graph_id)?;
        fs::create_dir_all(&self.dir).map_err(|e| TesseraError::StorageIo(e.to_string()))?;
        Ok(Arc::new(RedbBlockStore::open(path)?))
    }

    fn exists(&self, graph_id: &str) -> Result<bool, TesseraError> {
        Ok(self.path_for(graph_id)?.exists())
    }

    fn remove(&self, graph_id: &str) -> Result<(), TesseraError> {
        let path = self.path_for(graph_id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TesseraError::StorageIo(format!(
                "failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}

/// In-process stores keyed by graph id.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    stores: Mutex<BTreeMap<String, MemoryBlockStore>>,
}

impl MemoryProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle onto the blocks of `graph_id`, if it was ever opened.
    #[must_use]
    pub fn store(&self, graph_id: &str) -> Option<MemoryBlockStore> {
        self.lock().get(graph_id).map(MemoryBlockStore::handle)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MemoryBlockStore>> {
        self.stores.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageProvider for MemoryProvider {
    fn open(&self, graph_id: &str) -> Result<Arc<dyn BlockStore>, TesseraError> {
        validate_graph_id(graph_id)?;
        let mut stores = self.lock();
        let store = stores.entry(graph_id.to_string()).or_default();
        Ok(Arc::new(store.handle()))
    }

    fn exists(&self, graph_id: &str) -> Result<bool, TesseraError> {
        match self.lock().get(graph_id) {
            Some(store) => Ok(store.handle().block_count()? > 0),
            None => Ok(false),
        }
    }

    fn remove(&self, graph_id: &str) -> Result<(), TesseraError> {
        self.lock().remove(graph_id);
        Ok(())
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Everything a `SessionManager` needs from its environment.
#[derive(Clone)]
pub struct SessionConfig {
    pub provider: Arc<dyn StorageProvider>,
    /// Receives the safety export taken before any rebuild.
    pub backup: Arc<dyn BackupSink>,
    /// Check run on every open.
    pub integrity: IntegrityCheck,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("integrity", &self.integrity)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// redb files under `data_dir`, backups under `backup_dir`.
    #[must_use]
    pub fn on_disk(data_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider: Arc::new(RedbProvider::new(data_dir)),
            backup: Arc::new(DirBackupSink::new(backup_dir)),
            integrity: IntegrityCheck::default(),
        }
    }

    /// Everything in memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            provider: Arc::new(MemoryProvider::new()),
            backup: Arc::new(MemoryBackupSink::new()),
            integrity: IntegrityCheck::default(),
        }
    }

    #[must_use]
    pub fn with_integrity(mut self, integrity: IntegrityCheck) -> Self {
        self.integrity = integrity;
        self
    }
}

/// Per-call options of `SessionManager::open`.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Close every other open graph first.
    pub exclusive: bool,
    /// Schema for a new graph, or attributes to add to an existing one.
    pub schema: Option<Schema>,
}

impl OpenOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

#[derive(Debug, Default)]
struct GraphEntry {
    state: GraphState,
    connection: Option<Arc<Connection>>,
}

/// Opens, closes, rebuilds and removes graphs.
pub struct SessionManager {
    config: SessionConfig,
    graphs: Mutex<BTreeMap<String, GraphEntry>>,
    listeners: RwLock<Vec<Arc<dyn TxListener>>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("config", &self.config)
            .field("open_graphs", &self.open_graphs())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            graphs: Mutex::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open `graph_id`, creating it if it has no data yet.
    ///
    /// Opening a graph that is already open returns the same connection.
    pub fn open(&self, graph_id: &str, opts: OpenOptions) -> Result<Arc<Connection>, TesseraError> {
        validate_graph_id(graph_id)?;
        if opts.exclusive {
            self.close_others(graph_id)?;
        }
        if let Some(conn) = self.begin(graph_id)? {
            return Ok(conn);
        }
        let result = self.with_store(graph_id, |store| {
            let db = self.hydrate_or_recover(graph_id, store, opts.schema.as_ref())?;
            self.activate(graph_id, db, opts.schema.as_ref())
        });
        self.finish(graph_id, result)
    }

    /// Close `graph_id`. Closing a graph that is not open does nothing.
    pub fn close(&self, graph_id: &str) -> Result<(), TesseraError> {
        let conn = {
            let mut graphs = self.graphs();
            let Some(entry) = graphs.get_mut(graph_id) else {
                return Ok(());
            };
            if entry.state != GraphState::Open {
                return Ok(());
            }
            entry.state = GraphState::Closing;
            entry.connection.take()
        };

        let result = conn.map_or(Ok(()), |conn| conn.close());
        if let Some(entry) = self.graphs().get_mut(graph_id) {
            entry.state = GraphState::Closed;
        }
        match &result {
            Ok(()) => tracing::info!(graph = graph_id, "graph closed"),
            Err(e) => tracing::warn!(graph = graph_id, error = %e, "graph closed with errors"),
        }
        result
    }

    /// Close every open graph. Every graph is attempted; the first error is
    /// returned.
    pub fn close_all(&self) -> Result<(), TesseraError> {
        let mut first_error = None;
        for graph_id in self.open_graphs() {
            if let Err(e) = self.close(&graph_id) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete the durable data of a closed graph.
    pub fn unlink(&self, graph_id: &str) -> Result<(), TesseraError> {
        validate_graph_id(graph_id)?;
        let mut graphs = self.graphs();
        let entry = graphs.entry(graph_id.to_string()).or_default();
        if entry.state != GraphState::Closed {
            return Err(invalid_state(graph_id, entry.state));
        }
        self.config.provider.remove(graph_id)?;
        entry.state = GraphState::Unlinked;
        tracing::info!(graph = graph_id, "graph unlinked");
        Ok(())
    }

    /// Rebuild `graph_id` from its stored blocks, closing it first.
    pub fn rebuild(
        &self,
        graph_id: &str,
        opts: OpenOptions,
    ) -> Result<(Arc<Connection>, RebuildReport), TesseraError> {
        validate_graph_id(graph_id)?;
        if !self.config.provider.exists(graph_id)? {
            return Err(TesseraError::InvalidOperation(format!(
                "graph '{graph_id}' has no stored data to rebuild"
            )));
        }
        self.close(graph_id)?;
        if self.begin(graph_id)?.is_some() {
            // Reopened by another caller in between.
            return Err(invalid_state(graph_id, GraphState::Open));
        }

        let mut report = None;
        let result = self.with_store(graph_id, |store| {
            let (db, rebuilt) = rebuild(
                graph_id,
                Arc::clone(store),
                self.config.backup.as_ref(),
                opts.schema.as_ref(),
            )?;
            report = Some(rebuilt);
            self.activate(graph_id, db, opts.schema.as_ref())
        });
        let conn = self.finish(graph_id, result)?;
        let report = report.ok_or_else(|| {
            TesseraError::RebuildFailed(format!("graph '{graph_id}' produced no rebuild report"))
        })?;
        Ok((conn, report))
    }

    /// Create `graph_id` from a canonical export. The graph must not exist.
    pub fn import(
        &self,
        graph_id: &str,
        data: &[u8],
        opts: OpenOptions,
    ) -> Result<Arc<Connection>, TesseraError> {
        validate_graph_id(graph_id)?;
        let graph = import_canonical(data)?;
        if self.config.provider.exists(graph_id)? {
            return Err(TesseraError::InvalidOperation(format!(
                "graph '{graph_id}' already exists"
            )));
        }
        if self.begin(graph_id)?.is_some() {
            return Err(invalid_state(graph_id, GraphState::Open));
        }

        // The whole graph lands in one commit.
        let result = self.with_store(graph_id, |store| {
            let staged = stage_graph(Arc::clone(store), graph, FIRST_PAGE_ADDRESS)?;
            persist(&staged.db, &staged.delta)?;
            tracing::info!(
                graph = graph_id,
                transactions = staged.transactions,
                "graph imported"
            );
            self.activate(graph_id, staged.db, opts.schema.as_ref())
        });
        self.finish(graph_id, result)
    }

    /// Register a listener on every graph, open now or opened later.
    pub fn add_listener(&self, listener: Arc<dyn TxListener>) {
        for conn in self.graphs().values().filter_map(|e| e.connection.as_ref()) {
            conn.listen(Arc::clone(&listener));
        }
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// State of `graph_id`. Graphs never seen by this manager are `Closed`.
    #[must_use]
    pub fn state(&self, graph_id: &str) -> GraphState {
        self.graphs()
            .get(graph_id)
            .map_or(GraphState::Closed, |e| e.state)
    }

    /// The connection of an open graph.
    #[must_use]
    pub fn connection(&self, graph_id: &str) -> Option<Arc<Connection>> {
        self.graphs()
            .get(graph_id)
            .and_then(|e| e.connection.clone())
    }

    /// Ids of every open graph, sorted.
    #[must_use]
    pub fn open_graphs(&self) -> Vec<String> {
        self.graphs()
            .iter()
            .filter(|(_, e)| e.state == GraphState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn graphs(&self) -> MutexGuard<'_, BTreeMap<String, GraphEntry>> {
        self.graphs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_others(&self, graph_id: &str) -> Result<(), TesseraError> {
        for other in self.open_graphs() {
            if other != graph_id {
                self.close(&other)?;
            }
        }
        Ok(())
    }

    /// Move a closed graph to `Opening`, or hand back its live connection.
    fn begin(&self, graph_id: &str) -> Result<Option<Arc<Connection>>, TesseraError> {
        let mut graphs = self.graphs();
        let entry = graphs.entry(graph_id.to_string()).or_default();
        match entry.state {
            GraphState::Open => Ok(entry.connection.clone()),
            GraphState::Closed => {
                entry.state = GraphState::Opening;
                Ok(None)
            }
            state => Err(invalid_state(graph_id, state)),
        }
    }

    fn finish(
        &self,
        graph_id: &str,
        result: Result<Arc<Connection>, TesseraError>,
    ) -> Result<Arc<Connection>, TesseraError> {
        let mut graphs = self.graphs();
        let entry = graphs.entry(graph_id.to_string()).or_default();
        match &result {
            Ok(conn) => {
                entry.state = GraphState::Open;
                entry.connection = Some(Arc::clone(conn));
                tracing::info!(graph = graph_id, "graph opened");
            }
            Err(e) => {
                entry.state = GraphState::Closed;
                entry.connection = None;
                tracing::error!(graph = graph_id, error = %e, "failed to open graph");
            }
        }
        result
    }

    /// Run `f` on a freshly opened store, releasing the store if `f` fails.
    fn with_store<F>(&self, graph_id: &str, f: F) -> Result<Arc<Connection>, TesseraError>
    where
        F: FnOnce(&Arc<dyn BlockStore>) -> Result<Arc<Connection>, TesseraError>,
    {
        let store = self.config.provider.open(graph_id)?;
        f(&store).inspect_err(|_| {
            if let Err(e) = store.close() {
                tracing::warn!(graph = graph_id, error = %e, "failed to release store");
            }
        })
    }

    fn hydrate_or_recover(
        &self,
        graph_id: &str,
        store: &Arc<dyn BlockStore>,
        schema: Option<&Schema>,
    ) -> Result<Db, TesseraError> {
        let hydrated = hydrate(Arc::clone(store)).and_then(|db| {
            if let Some(db) = &db {
                verify(db, self.config.integrity)?;
            }
            Ok(db)
        });

        let damage = match hydrated {
            Ok(Some(db)) => return Ok(db),
            Ok(None) => {
                // No root record but blocks remain: the root itself was lost.
                if store.block_count()? > 0 {
                    TesseraError::BlockNotFound(Address(ROOT_ADDRESS))
                } else {
                    let schema = schema.cloned().unwrap_or_default();
                    tracing::info!(graph = graph_id, "initializing new graph");
                    return initialize(
                        Arc::clone(store),
                        SchemaRecord::new(BASE_SCHEMA_VERSION, schema),
                    );
                }
            }
            Err(e) if e.is_index_damage() => e,
            Err(e) => return Err(e),
        };

        tracing::warn!(graph = graph_id, error = %damage, "stored index is damaged");
        let sink = self.config.backup.as_ref();
        let (db, report) = rebuild(graph_id, Arc::clone(store), sink, schema)?;
        tracing::info!(
            graph = graph_id,
            backup = %report.backup_location,
            recovered = report.recovered_datoms,
            "graph recovered"
        );
        Ok(db)
    }

    /// Wrap `db` in a connection, migrate it, extend its schema and attach
    /// listeners.
    fn activate(
        &self,
        graph_id: &str,
        db: Db,
        schema: Option<&Schema>,
    ) -> Result<Arc<Connection>, TesseraError> {
        let conn = Arc::new(Connection::new(graph_id, db));
        let migrated = migrate(&conn)?;
        if !migrated.is_noop() {
            tracing::info!(
                graph = graph_id,
                from = migrated.from,
                to = migrated.to,
                "graph migrated"
            );
        }
        if let Some(schema) = schema {
            conn.extend_schema(schema)?;
        }
        for listener in self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            conn.listen(Arc::clone(listener));
        }
        Ok(conn)
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            tracing::warn!(error = %e, "failed to close graphs on shutdown");
        }
    }
}

fn invalid_state(graph_id: &str, state: GraphState) -> TesseraError {
    TesseraError::InvalidState {
        graph: graph_id.to_string(),
        state: state.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::index::IndexOrder;
    use crate::listener::TxLog;
    use crate::migration::CURRENT_SCHEMA_VERSION;
    use crate::query::Pattern;
    use crate::schema::AttributeSpec;
    use crate::{Attribute, EntityId, TxMeta, TxOp, Value, ValueType};

    fn schema() -> Schema {
        Schema::new()
            .with("title", AttributeSpec::one(ValueType::String))
            .with("tag", AttributeSpec::many(ValueType::Keyword))
    }

    struct Fixture {
        provider: Arc<MemoryProvider>,
        backups: Arc<MemoryBackupSink>,
        manager: SessionManager,
    }

    fn fixture(integrity: IntegrityCheck) -> Fixture {
        let provider = Arc::new(MemoryProvider::new());
        let backups = Arc::new(MemoryBackupSink::new());
        let manager = SessionManager::new(SessionConfig {
            provider: provider.clone(),
            backup: backups.clone(),
            integrity,
        });
        Fixture {
            provider,
            backups,
            manager,
        }
    }

    fn titles(conn: &Connection, n: u64) {
        let ops = (1..=n)
            .map(|e| TxOp::add(EntityId(e), "title", Value::str(format!("t{e}"))))
            .collect();
        conn.transact(ops, TxMeta::new()).unwrap();
    }

    #[test]
    fn new_graph_is_migrated_and_reopens_with_data() {
        let fx = fixture(IntegrityCheck::References);
        let opts = OpenOptions::new().with_schema(schema());
        let conn = fx.manager.open("g", opts.clone()).unwrap();
        assert_eq!(fx.manager.state("g"), GraphState::Open);
        assert_eq!(conn.db().schema_version(), CURRENT_SCHEMA_VERSION);
        titles(&conn, 3);

        let again = fx.manager.open("g", opts).unwrap();
        assert!(Arc::ptr_eq(&conn, &again));

        fx.manager.close("g").unwrap();
        fx.manager.close("g").unwrap();
        assert_eq!(fx.manager.state("g"), GraphState::Closed);
        assert!(conn.transact(vec![], TxMeta::new()).is_err());

        let reopened = fx.manager.open("g", OpenOptions::new()).unwrap();
        assert_eq!(reopened.db().count().unwrap(), 3);
        assert!(fx.backups.backups().is_empty());
    }

    #[test]
    fn exclusive_open_closes_others() {
        let fx = fixture(IntegrityCheck::None);
        fx.manager.open("a", OpenOptions::new()).unwrap();
        fx.manager.open("b", OpenOptions::new()).unwrap();
        assert_eq!(fx.manager.open_graphs(), vec!["a", "b"]);

        fx.manager.open("c", OpenOptions::new().exclusive()).unwrap();
        assert_eq!(fx.manager.open_graphs(), vec!["c"]);
        assert_eq!(fx.manager.state("a"), GraphState::Closed);
    }

    #[test]
    fn unlink_requires_closed_and_is_final() {
        let fx = fixture(IntegrityCheck::None);
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 1);

        let err = fx.manager.unlink("g").unwrap_err();
        assert!(matches!(err, TesseraError::InvalidState { ref state, .. } if state == "open"));

        fx.manager.close("g").unwrap();
        fx.manager.unlink("g").unwrap();
        assert_eq!(fx.manager.state("g"), GraphState::Unlinked);
        assert!(!fx.provider.exists("g").unwrap());
        assert!(matches!(
            fx.manager.open("g", OpenOptions::new()),
            Err(TesseraError::InvalidState { .. })
        ));
    }

    #[test]
    fn damaged_root_page_is_rebuilt_on_open() {
        let fx = fixture(IntegrityCheck::References);
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 10);
        let eavt_root = conn.db().roots().eavt;
        fx.manager.close("g").unwrap();

        fx.provider
            .store("g")
            .unwrap()
            .insert_raw(eavt_root, b"not a page".to_vec());

        let conn = fx.manager.open("g", OpenOptions::new()).unwrap();
        assert_eq!(conn.db().count().unwrap(), 10);
        assert!(conn.validate().unwrap().is_valid());
        assert_eq!(fx.backups.backups().len(), 1);
    }

    #[test]
    fn graph_in_newer_block_format_is_not_opened() {
        let fx = fixture(IntegrityCheck::Full);
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 50);
        fx.manager.close("g").unwrap();

        let store = fx.provider.store("g").unwrap();
        let original = store.scan().unwrap();
        for block in &original {
            let mut content = block.content.clone();
            content[4] = crate::primitives::BLOCK_FORMAT_VERSION + 1;
            store.insert_raw(block.address, content);
        }
        let bumped = store.scan().unwrap();

        let err = fx.manager.open("g", OpenOptions::new()).unwrap_err();
        assert!(matches!(err, TesseraError::MigrationFailed { .. }));
        assert!(matches!(
            fx.manager.rebuild("g", OpenOptions::new()),
            Err(TesseraError::MigrationFailed { .. })
        ));
        assert_eq!(fx.manager.state("g"), GraphState::Closed);
        assert!(fx.backups.backups().is_empty());
        assert_eq!(store.scan().unwrap(), bumped);

        // A build that reads the format again finds everything.
        for block in original {
            store.insert_raw(block.address, block.content);
        }
        let conn = fx.manager.open("g", OpenOptions::new()).unwrap();
        assert_eq!(conn.db().count().unwrap(), 50);
    }

    #[test]
    fn missing_leaf_is_caught_by_reference_check() {
        let fx = fixture(IntegrityCheck::References);
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 200);
        let db = conn.db();
        let root = db.roots().aevt;
        let leaf = db
            .index_pages(IndexOrder::Aevt)
            .unwrap()
            .into_iter()
            .find(|a| *a != root)
            .unwrap();
        fx.manager.close("g").unwrap();

        fx.provider.store("g").unwrap().remove_raw(leaf);

        let conn = fx.manager.open("g", OpenOptions::new()).unwrap();
        // EAVT still held every datom.
        assert_eq!(conn.db().count().unwrap(), 200);
        let hits: Vec<_> = conn
            .db()
            .query(&Pattern::attribute("title"))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(hits.len(), 200);
    }

    #[test]
    fn forced_rebuild_reports_and_reopens() {
        let fx = fixture(IntegrityCheck::None);
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 5);

        let (rebuilt, report) = fx.manager.rebuild("g", OpenOptions::new()).unwrap();
        assert!(conn.is_closed());
        assert_eq!(report.recovered_datoms, 5);
        assert_eq!(report.skipped_blocks, 0);
        assert_eq!(rebuilt.db().count().unwrap(), 5);
        assert_eq!(fx.manager.state("g"), GraphState::Open);

        assert!(fx.manager.rebuild("missing", OpenOptions::new()).is_err());
    }

    #[test]
    fn import_creates_new_graph_only() {
        let fx = fixture(IntegrityCheck::None);
        let conn = fx.manager.open("src", OpenOptions::new().with_schema(schema())).unwrap();
        titles(&conn, 4);
        let export = conn.export().unwrap();

        let copy = fx.manager.import("dst", &export, OpenOptions::new()).unwrap();
        assert_eq!(copy.db().count().unwrap(), 4);
        assert_eq!(copy.db().max_tx(), conn.db().max_tx());
        assert_eq!(copy.export().unwrap(), export);

        assert!(fx.manager.import("src", &export, OpenOptions::new()).is_err());
        assert!(fx.manager.import("bad", b"garbage", OpenOptions::new()).is_err());
        assert_eq!(fx.manager.state("bad"), GraphState::Closed);
    }

    #[test]
    fn listeners_reach_every_graph() {
        let fx = fixture(IntegrityCheck::None);
        let log = Arc::new(TxLog::new());
        let early = fx.manager.open("a", OpenOptions::new().with_schema(schema())).unwrap();
        fx.manager.add_listener(log.clone());
        let late = fx.manager.open("b", OpenOptions::new().with_schema(schema())).unwrap();

        titles(&early, 1);
        titles(&late, 2);
        let graphs: Vec<String> = log.entries().into_iter().map(|e| e.graph_id).collect();
        assert_eq!(graphs, vec!["a", "b"]);
    }

    #[test]
    fn schema_is_extended_additively() {
        let fx = fixture(IntegrityCheck::None);
        fx.manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
        fx.manager.close("g").unwrap();

        let more = Schema::new().with("rank", AttributeSpec::one(ValueType::Long));
        let conn = fx.manager.open("g", OpenOptions::new().with_schema(more)).unwrap();
        let db = conn.db();
        assert!(db.schema().contains(&Attribute::new("title")));
        assert!(db.schema().contains(&Attribute::new("rank")));

        // Redefining an attribute fails the open and leaves the graph closed.
        fx.manager.close("g").unwrap();
        let clash = Schema::new().with("title", AttributeSpec::many(ValueType::Long));
        assert!(fx.manager.open("g", OpenOptions::new().with_schema(clash)).is_err());
        assert_eq!(fx.manager.state("g"), GraphState::Closed);
        assert!(fx.manager.open("g", OpenOptions::new()).is_ok());
    }

    #[test]
    fn invalid_ids_are_rejected() {
        let fx = fixture(IntegrityCheck::None);
        let long = "x".repeat(MAX_GRAPH_ID_LENGTH + 1);
        for id in ["", "../etc", "a b", long.as_str()] {
            assert!(fx.manager.open(id, OpenOptions::new()).is_err(), "{id:?}");
        }
        assert!(validate_graph_id("notes_2024-v1").is_ok());
    }

    #[test]
    fn redb_graphs_survive_manager_restart() {
        let temp = tempfile::tempdir().unwrap();
        let config = SessionConfig::on_disk(temp.path().join("data"), temp.path().join("backups"))
            .with_integrity(IntegrityCheck::Full);
        {
            let manager = SessionManager::new(config.clone());
            let conn = manager.open("g", OpenOptions::new().with_schema(schema())).unwrap();
            titles(&conn, 70);
        }
        assert!(temp.path().join("data").join("g.redb").exists());

        let manager = SessionManager::new(config);
        let conn = manager.open("g", OpenOptions::new()).unwrap();
        assert_eq!(conn.db().count().unwrap(), 70);
        assert_eq!(conn.db().schema_version(), CURRENT_SCHEMA_VERSION);

        manager.close("g").unwrap();
        manager.unlink("g").unwrap();
        assert!(!temp.path().join("data").join("g.redb").exists());
    }
}
