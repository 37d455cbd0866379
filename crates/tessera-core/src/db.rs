//! # Database Snapshot
//!
//! `Db` is an immutable view of one graph: three index roots, the schema
//! and the id counters. Cloning is cheap and a clone never changes, no
//! matter what is committed afterwards.

use crate::index::{DatomIter, IndexOrder, IndexRoots, collect_pages};
use crate::query::Pattern;
use crate::schema::{Schema, SchemaRecord};
use crate::storage::PageStore;
use crate::{Address, Datom, EntityId, TesseraError, TxId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Immutable database snapshot.
#[derive(Clone)]
pub struct Db {
    pages: Arc<PageStore>,
    schema: Arc<SchemaRecord>,
    roots: IndexRoots,
    max_eid: u64,
    max_tx: u64,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("roots", &self.roots)
            .field("schema_version", &self.schema.version)
            .field("max_eid", &self.max_eid)
            .field("max_tx", &self.max_tx)
            .finish_non_exhaustive()
    }
}

impl Db {
    pub(crate) fn from_parts(
        pages: Arc<PageStore>,
        schema: Arc<SchemaRecord>,
        roots: IndexRoots,
        max_eid: u64,
        max_tx: u64,
    ) -> Self {
        Self {
            pages,
            schema,
            roots,
            max_eid,
            max_tx,
        }
    }

    /// Same indexes, different schema record.
    pub(crate) fn with_schema(&self, schema: SchemaRecord) -> Self {
        Self {
            schema: Arc::new(schema),
            ..self.clone()
        }
    }

    /// Same snapshot with new roots and counters.
    pub(crate) fn with_roots(&self, roots: IndexRoots, max_eid: u64, max_tx: u64) -> Self {
        Self {
            roots,
            max_eid,
            max_tx,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema.schema
    }

    #[must_use]
    pub fn schema_record(&self) -> &SchemaRecord {
        &self.schema
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema.version
    }

    #[must_use]
    pub fn roots(&self) -> IndexRoots {
        self.roots
    }

    /// Highest entity id handed out so far.
    #[must_use]
    pub fn max_eid(&self) -> EntityId {
        EntityId(self.max_eid)
    }

    /// Id of the last committed transaction.
    #[must_use]
    pub fn max_tx(&self) -> TxId {
        TxId(self.max_tx)
    }

    #[must_use]
    pub fn pages(&self) -> &Arc<PageStore> {
        &self.pages
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Lazily scan one index for datoms matching `pattern`, in index order.
    #[must_use]
    pub fn datoms(&self, order: IndexOrder, pattern: Pattern) -> DatomIter {
        DatomIter::new(
            Arc::clone(&self.pages),
            order,
            self.roots.get(order),
            pattern,
        )
    }

    /// Datoms matching `pattern`, read from the best index for it.
    #[must_use]
    pub fn query(&self, pattern: &Pattern) -> DatomIter {
        let order = pattern.choose_index(self.schema());
        self.datoms(order, pattern.clone())
    }

    /// All current datoms of one entity, in attribute order.
    pub fn entity(&self, entity: EntityId) -> Result<Vec<Datom>, TesseraError> {
        self.datoms(IndexOrder::Eavt, Pattern::entity(entity)).collect()
    }

    /// Number of current datoms.
    pub fn count(&self) -> Result<usize, TesseraError> {
        let mut count = 0;
        for datom in self.datoms(IndexOrder::Eavt, Pattern::any()) {
            datom?;
            count += 1;
        }
        Ok(count)
    }

    /// Every page address reachable from one index root.
    pub fn index_pages(&self, order: IndexOrder) -> Result<BTreeSet<Address>, TesseraError> {
        collect_pages(&self.pages, self.roots.get(order))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::schema::AttributeSpec;
    use crate::storage::{BlockStore, MemoryBlockStore, initialize};
    use crate::{Attribute, TxMeta, TxOp, Value, ValueType};

    fn graph() -> Db {
        let store: Arc<dyn BlockStore> = Arc::new(MemoryBlockStore::new());
        let schema = Schema::new()
            .with("n", AttributeSpec::one(ValueType::Long).indexed())
            .with("tag", AttributeSpec::many(ValueType::Keyword));
        initialize(store, SchemaRecord::new(1, schema)).unwrap()
    }

    #[test]
    fn range_scan_stays_in_prefix() {
        let db = graph();
        let ops = (1..=200)
            .map(|e| TxOp::add(EntityId(e), "n", Value::Long(e as i64 % 7)))
            .collect();
        let db = db.transact(ops, TxMeta::new()).unwrap().db_after;

        let sevens: Vec<_> = db
            .query(&Pattern::attribute("n").with_value(Value::Long(3)))
            .collect::<Result<_, _>>()
            .unwrap();
        assert!(!sevens.is_empty());
        assert!(sevens.iter().all(|d| d.v == Value::Long(3)));
        assert!(sevens.windows(2).all(|w| w[0].e < w[1].e));

        assert_eq!(db.entity(EntityId(42)).unwrap().len(), 1);
        assert_eq!(db.count().unwrap(), 200);
        assert!(db.index_pages(IndexOrder::Eavt).unwrap().len() > 1);
    }

    #[test]
    fn snapshot_is_unaffected_by_later_commits() {
        let db = graph();
        let first = db
            .transact(vec![TxOp::add(EntityId(1), "tag", Value::Keyword("a".into()))], TxMeta::new())
            .unwrap()
            .db_after;
        let second = first
            .transact(vec![TxOp::add(EntityId(1), "tag", Value::Keyword("b".into()))], TxMeta::new())
            .unwrap()
            .db_after;

        assert_eq!(first.entity(EntityId(1)).unwrap().len(), 1);
        assert_eq!(second.entity(EntityId(1)).unwrap().len(), 2);
        assert_eq!(second.max_tx(), TxId(2));
        assert_eq!(
            second.entity(EntityId(1)).unwrap()[1].a,
            Attribute::new("tag")
        );
    }
}
