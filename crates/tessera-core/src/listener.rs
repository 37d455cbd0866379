//! # Commit Listeners
//!
//! Observers notified after each successful commit, in registration order.
//! A listener runs after the commit is durable; its failure is logged and
//! never undoes the commit.

use crate::db::Db;
use crate::{Datom, TxId, TxMeta};
use std::sync::{Mutex, PoisonError};

/// What a listener sees for one commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitEvent<'a> {
    pub graph_id: &'a str,
    pub tx_id: TxId,
    pub db_before: &'a Db,
    pub db_after: &'a Db,
    pub tx_meta: &'a TxMeta,
    pub datoms_added: &'a [Datom],
    pub datoms_retracted: &'a [Datom],
}

/// Commit observer.
pub trait TxListener: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str {
        "listener"
    }

    fn on_commit(&self, event: &CommitEvent<'_>) -> Result<(), String>;
}

/// One entry of a `TxLog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedTx {
    pub graph_id: String,
    pub tx_id: TxId,
    pub tx_meta: TxMeta,
    pub added: Vec<Datom>,
    pub retracted: Vec<Datom>,
}

/// Listener that keeps every commit it sees, e.g. to feed an undo history.
#[derive(Debug, Default)]
pub struct TxLog {
    entries: Mutex<Vec<LoggedTx>>,
}

impl TxLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn entries(&self) -> Vec<LoggedTx> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TxListener for TxLog {
    fn name(&self) -> &str {
        "tx-log"
    }

    fn on_commit(&self, event: &CommitEvent<'_>) -> Result<(), String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoggedTx {
                graph_id: event.graph_id.to_string(),
                tx_id: event.tx_id,
                tx_meta: event.tx_meta.clone(),
                added: event.datoms_added.to_vec(),
                retracted: event.datoms_retracted.to_vec(),
            });
        Ok(())
    }
}
