//! # Connection
//!
//! Handle onto one open graph.
//!
//! All writes go through a single writer lock, so transactions commit one
//! at a time and listeners observe them in commit order. Readers take the
//! current snapshot with `db()` and are never blocked by a writer: the
//! snapshot they hold stays valid and unchanged for as long as they keep it.

use crate::db::Db;
use crate::export::export_canonical;
use crate::listener::{CommitEvent, TxListener};
use crate::schema::Schema;
use crate::storage::{PageDelta, discard, persist};
use crate::tx::{TxOp, TxReport};
use crate::validate::{ValidationReport, validate_db};
use crate::{Datom, TesseraError, TxMeta};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

/// Summary counters of an open graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStatus {
    pub graph_id: String,
    pub schema_version: u32,
    pub attributes: usize,
    pub datoms: usize,
    pub max_eid: u64,
    pub max_tx: u64,
    pub blocks: u64,
    pub cached_pages: usize,
}

/// Connection to one open graph.
pub struct Connection {
    graph_id: String,
    current: RwLock<Db>,
    writer: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn TxListener>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("graph_id", &self.graph_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(graph_id: impl Into<String>, db: Db) -> Self {
        Self {
            graph_id: graph_id.into(),
            current: RwLock::new(db),
            writer: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    /// The current snapshot.
    #[must_use]
    pub fn db(&self) -> Db {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Apply `ops` as one transaction and make the result current.
    pub fn transact(&self, ops: Vec<TxOp>, meta: TxMeta) -> Result<TxReport, TesseraError> {
        let _guard = self.write_lock()?;
        let report = self.db().transact(ops, meta)?;
        self.publish(&report.db_after, &report.delta)?;
        tracing::debug!(
            graph = %self.graph_id,
            tx = %report.tx_id,
            added = report.datoms_added.len(),
            retracted = report.datoms_retracted.len(),
            "transaction committed"
        );
        self.notify(&report);
        Ok(report)
    }

    /// Bulk-insert datoms with their original transaction ids.
    pub fn load(&self, datoms: Vec<Datom>, meta: TxMeta) -> Result<TxReport, TesseraError> {
        let _guard = self.write_lock()?;
        let report = self.db().load(datoms, meta)?;
        self.publish(&report.db_after, &report.delta)?;
        self.notify(&report);
        Ok(report)
    }

    /// Add the attributes of `schema` the graph does not declare yet.
    ///
    /// Returns how many were added. Redefining an existing attribute fails.
    pub fn extend_schema(&self, schema: &Schema) -> Result<usize, TesseraError> {
        schema.validate()?;
        let _guard = self.write_lock()?;
        let db = self.db();
        let mut record = db.schema_record().clone();
        let added = record.schema.extend_from(schema)?;
        if added > 0 {
            self.publish(&db.with_schema(record), &PageDelta::schema_only())?;
            tracing::info!(graph = %self.graph_id, added, "schema extended");
        }
        Ok(added)
    }

    /// Build a snapshot from the current one and commit it, holding the
    /// writer lock from the read to the publish.
    ///
    /// `build` starts from a schema-only delta and records the pages it
    /// allocates there. Returning `None` commits nothing.
    pub(crate) fn stage<F>(&self, build: F) -> Result<Option<Db>, TesseraError>
    where
        F: FnOnce(&Db, &mut PageDelta) -> Result<Option<Db>, TesseraError>,
    {
        let _guard = self.write_lock()?;
        let base = self.db();
        let mut delta = PageDelta::schema_only();
        match build(&base, &mut delta) {
            Ok(Some(next)) => {
                self.publish(&next, &delta)?;
                Ok(Some(next))
            }
            Ok(None) => {
                discard(base.pages(), &delta);
                Ok(None)
            }
            Err(e) => {
                discard(base.pages(), &delta);
                Err(e)
            }
        }
    }

    /// Register a commit listener.
    pub fn listen(&self, listener: Arc<dyn TxListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Canonical export of the current snapshot.
    pub fn export(&self) -> Result<Vec<u8>, TesseraError> {
        self.ensure_open()?;
        export_canonical(&self.db())
    }

    /// Check the current snapshot against its schema.
    pub fn validate(&self) -> Result<ValidationReport, TesseraError> {
        self.ensure_open()?;
        validate_db(&self.db())
    }

    pub fn status(&self) -> Result<GraphStatus, TesseraError> {
        self.ensure_open()?;
        let db = self.db();
        Ok(GraphStatus {
            graph_id: self.graph_id.clone(),
            schema_version: db.schema_version(),
            attributes: db.schema().len(),
            datoms: db.count()?,
            max_eid: db.max_eid().0,
            max_tx: db.max_tx().0,
            blocks: db.pages().store().block_count()?,
            cached_pages: db.pages().cached_pages(),
        })
    }

    /// Stop accepting work and release the block store.
    pub(crate) fn close(&self) -> Result<(), TesseraError> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.db().pages().store().close()
    }

    fn ensure_open(&self) -> Result<(), TesseraError> {
        if self.is_closed() {
            return Err(TesseraError::ConnectionClosed(self.graph_id.clone()));
        }
        Ok(())
    }

    fn write_lock(&self) -> Result<MutexGuard<'_, ()>, TesseraError> {
        let guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;
        Ok(guard)
    }

    /// Persist `db` and make it current. On failure the batch's pages are
    /// dropped and the current snapshot stays as it was.
    ///
    /// Superseded pages stay in the arena: the store may delete their
    /// blocks, but older snapshots still read them from memory.
    fn publish(&self, db: &Db, delta: &PageDelta) -> Result<(), TesseraError> {
        if let Err(e) = persist(db, delta) {
            discard(db.pages(), delta);
            tracing::error!(graph = %self.graph_id, error = %e, "commit failed");
            return Err(e);
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = db.clone();
        Ok(())
    }

    fn notify(&self, report: &TxReport) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if listeners.is_empty() {
            return;
        }
        let event = CommitEvent {
            graph_id: &self.graph_id,
            tx_id: report.tx_id,
            db_before: &report.db_before,
            db_after: &report.db_after,
            tx_meta: &report.tx_meta,
            datoms_added: &report.datoms_added,
            datoms_retracted: &report.datoms_retracted,
        };
        for listener in &listeners {
            if let Err(reason) = listener.on_commit(&event) {
                tracing::warn!(
                    graph = %self.graph_id,
                    listener = listener.name(),
                    tx = %report.tx_id,
                    %reason,
                    "commit listener failed"
                );
            }
        }
    }
}
