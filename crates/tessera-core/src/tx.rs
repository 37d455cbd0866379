//! # Transactions
//!
//! Applying a batch of operations to a snapshot.
//!
//! A transaction is validated and applied against a private copy of the
//! index roots. If any operation fails, the pages it allocated are dropped
//! and the caller's snapshot is untouched; otherwise the result is a new
//! snapshot plus a report of what changed.
//!
//! Rules enforced per asserted datom:
//! - the attribute must be declared and the value must match its type
//! - a cardinality-one attribute holds at most one value per entity
//! - a unique attribute value belongs to at most one entity
//! - re-asserting an existing datom is a no-op

use crate::db::Db;
use crate::index::{DatomIter, IndexOrder, IndexRoots, TreeWriter};
use crate::primitives::{MAX_TX_OPS, MAX_VALUE_LENGTH};
use crate::query::Pattern;
use crate::schema::Unique;
use crate::storage::{PageDelta, discard};
use crate::{Attribute, Datom, EntityId, TesseraError, TxId, TxMeta, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// OPERATIONS
// =============================================================================

/// Entity position of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityRef {
    /// An existing or explicitly chosen entity id.
    Id(EntityId),
    /// A name local to the transaction. Resolved to an existing entity via a
    /// unique-identity attribute, or to a newly allocated id.
    Temp(String),
}

impl EntityRef {
    #[must_use]
    pub fn temp(name: impl Into<String>) -> Self {
        Self::Temp(name.into())
    }
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        Self::Id(id)
    }
}

/// One operation of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TxOp {
    Add {
        e: EntityRef,
        a: Attribute,
        v: Value,
    },
    Retract {
        e: EntityRef,
        a: Attribute,
        v: Value,
    },
    /// Retract every value of one attribute on an entity.
    RetractAttribute { e: EntityRef, a: Attribute },
    /// Retract every datom of an entity. References to it are left alone.
    RetractEntity { e: EntityRef },
}

impl TxOp {
    #[must_use]
    pub fn add(e: impl Into<EntityRef>, a: impl Into<Attribute>, v: Value) -> Self {
        Self::Add {
            e: e.into(),
            a: a.into(),
            v,
        }
    }

    #[must_use]
    pub fn retract(e: impl Into<EntityRef>, a: impl Into<Attribute>, v: Value) -> Self {
        Self::Retract {
            e: e.into(),
            a: a.into(),
            v,
        }
    }

    #[must_use]
    pub fn retract_attribute(e: impl Into<EntityRef>, a: impl Into<Attribute>) -> Self {
        Self::RetractAttribute {
            e: e.into(),
            a: a.into(),
        }
    }

    #[must_use]
    pub fn retract_entity(e: impl Into<EntityRef>) -> Self {
        Self::RetractEntity { e: e.into() }
    }

    fn entity(&self) -> &EntityRef {
        match self {
            Self::Add { e, .. }
            | Self::Retract { e, .. }
            | Self::RetractAttribute { e, .. }
            | Self::RetractEntity { e } => e,
        }
    }
}

// =============================================================================
// REPORT
// =============================================================================

/// Outcome of a successful transaction.
#[derive(Debug, Clone)]
pub struct TxReport {
    pub db_before: Db,
    pub db_after: Db,
    pub tx_id: TxId,
    pub tx_meta: TxMeta,
    pub datoms_added: Vec<Datom>,
    pub datoms_retracted: Vec<Datom>,
    /// Resolution of every tempid used by the transaction.
    pub tempids: BTreeMap<String, EntityId>,
    /// Pages to write and pages that became garbage.
    pub delta: PageDelta,
}

impl TxReport {
    /// Whether the transaction changed no datom.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.datoms_added.is_empty() && self.datoms_retracted.is_empty()
    }

    /// Entity id a tempid resolved to.
    #[must_use]
    pub fn tempid(&self, name: &str) -> Option<EntityId> {
        self.tempids.get(name).copied()
    }
}

// =============================================================================
// APPLY
// =============================================================================

impl Db {
    /// Apply `ops` as one transaction. The new snapshot is returned in the
    /// report; `self` is unchanged whether or not this succeeds.
    pub fn transact(&self, ops: Vec<TxOp>, meta: TxMeta) -> Result<TxReport, TesseraError> {
        if ops.len() > MAX_TX_OPS {
            return Err(TesseraError::InvalidOperation(format!(
                "transaction has {} operations (limit {MAX_TX_OPS})",
                ops.len()
            )));
        }

        let tx = self.max_tx().next();
        let mut staging = Staging::new(self);
        match staging.apply(&ops, tx) {
            Ok(tempids) => Ok(staging.finish(tx, meta, tempids)),
            Err(e) => {
                discard(self.pages(), &staging.delta);
                Err(e)
            }
        }
    }

    /// Insert datoms with their original transaction ids.
    ///
    /// Applies the same schema rules as `transact`. Counters advance to cover
    /// the loaded entity and transaction ids. Used by rebuild and import.
    pub fn load(&self, datoms: Vec<Datom>, meta: TxMeta) -> Result<TxReport, TesseraError> {
        let mut staging = Staging::new(self);
        let mut max_tx = self.max_tx();
        let mut result = Ok(());
        for datom in datoms {
            staging.max_eid = staging.max_eid.max(datom.e.0);
            max_tx = max_tx.max(datom.tx);
            result = staging.assert(datom);
            if result.is_err() {
                break;
            }
        }
        match result {
            Ok(()) => Ok(staging.finish(max_tx, meta, BTreeMap::new())),
            Err(e) => {
                discard(self.pages(), &staging.delta);
                Err(e)
            }
        }
    }
}

/// Index roots under construction for one transaction.
struct Staging<'a> {
    base: &'a Db,
    roots: IndexRoots,
    delta: PageDelta,
    max_eid: u64,
    added: Vec<Datom>,
    retracted: Vec<Datom>,
}

impl<'a> Staging<'a> {
    fn new(base: &'a Db) -> Self {
        Self {
            base,
            roots: base.roots(),
            delta: PageDelta::default(),
            max_eid: base.max_eid().0,
            added: Vec::new(),
            retracted: Vec::new(),
        }
    }

    fn apply(&mut self, ops: &[TxOp], tx: TxId) -> Result<BTreeMap<String, EntityId>, TesseraError> {
        let tempids = self.resolve_tempids(ops)?;
        let resolve = |e: &EntityRef| match e {
            EntityRef::Id(id) => Ok(*id),
            EntityRef::Temp(name) => tempids.get(name).copied().ok_or_else(|| {
                TesseraError::InvalidOperation(format!("unresolved tempid '{name}'"))
            }),
        };

        for op in ops {
            let e = resolve(op.entity())?;
            match op {
                TxOp::Add { a, v, .. } => {
                    self.assert(Datom::new(e, a.clone(), v.clone(), tx))?;
                }
                TxOp::Retract { a, v, .. } => {
                    let pattern = Pattern::entity(e)
                        .with_attribute(a.clone())
                        .with_value(v.clone());
                    self.retract_matching(pattern)?;
                }
                TxOp::RetractAttribute { a, .. } => {
                    self.retract_matching(Pattern::entity(e).with_attribute(a.clone()))?;
                }
                TxOp::RetractEntity { .. } => {
                    self.retract_matching(Pattern::entity(e))?;
                }
            }
        }
        Ok(tempids)
    }

    /// Resolve every tempid in `ops`.
    ///
    /// Explicit ids advance the entity counter first. A tempid asserting a
    /// unique-identity value that an entity already holds resolves to that
    /// entity; the rest get fresh ids in order of first appearance.
    fn resolve_tempids(&mut self, ops: &[TxOp]) -> Result<BTreeMap<String, EntityId>, TesseraError> {
        let mut tempids = BTreeMap::new();
        let mut asserted = BTreeSet::new();

        for op in ops {
            match op.entity() {
                EntityRef::Id(id) => self.max_eid = self.max_eid.max(id.0),
                EntityRef::Temp(name) => {
                    let TxOp::Add { a, v, .. } = op else {
                        continue;
                    };
                    asserted.insert(name.clone());
                    let identity = self
                        .base
                        .schema()
                        .get(a)
                        .is_some_and(|spec| spec.unique == Some(Unique::Identity));
                    if !identity {
                        continue;
                    }
                    let Some(owner) = self.owner(a, v)? else {
                        continue;
                    };
                    match tempids.get(name) {
                        Some(&existing) if existing != owner => {
                            return Err(TesseraError::constraint(
                                owner,
                                a,
                                format!("tempid '{name}' resolves to both {existing} and {owner}"),
                            ));
                        }
                        Some(_) => {}
                        None => {
                            tempids.insert(name.clone(), owner);
                        }
                    }
                }
            }
        }

        for op in ops {
            let EntityRef::Temp(name) = op.entity() else {
                continue;
            };
            if tempids.contains_key(name) {
                continue;
            }
            if !asserted.contains(name) {
                return Err(TesseraError::InvalidOperation(format!(
                    "tempid '{name}' is only used in retractions"
                )));
            }
            self.max_eid = self.max_eid.checked_add(1).ok_or_else(|| {
                TesseraError::InvalidOperation("entity id space exhausted".to_string())
            })?;
            tempids.insert(name.clone(), EntityId(self.max_eid));
        }
        Ok(tempids)
    }

    fn scan(&self, order: IndexOrder, pattern: Pattern) -> DatomIter {
        DatomIter::new(
            Arc::clone(self.base.pages()),
            order,
            self.roots.get(order),
            pattern,
        )
    }

    /// Entity currently holding `value` for a unique attribute.
    fn owner(&self, attribute: &Attribute, value: &Value) -> Result<Option<EntityId>, TesseraError> {
        let pattern = Pattern::attribute(attribute.clone()).with_value(value.clone());
        let found = self.scan(IndexOrder::Avet, pattern).next().transpose()?;
        Ok(found.map(|d| d.e))
    }

    fn assert(&mut self, datom: Datom) -> Result<(), TesseraError> {
        let schema = self.base.schema();
        let Some(spec) = schema.get(&datom.a) else {
            return Err(TesseraError::constraint(
                datom.e,
                &datom.a,
                "attribute is not declared in the schema",
            ));
        };
        if !spec.value_type.accepts(&datom.v) {
            return Err(TesseraError::constraint(
                datom.e,
                &datom.a,
                format!("expected a {:?} value, got {}", spec.value_type, datom.v),
            ));
        }
        if let Value::Str(s) | Value::Keyword(s) = &datom.v
            && s.len() > MAX_VALUE_LENGTH
        {
            return Err(TesseraError::constraint(
                datom.e,
                &datom.a,
                format!("value of {} bytes exceeds limit {MAX_VALUE_LENGTH}", s.len()),
            ));
        }

        let existing: Vec<Datom> = self
            .scan(
                IndexOrder::Eavt,
                Pattern::entity(datom.e).with_attribute(datom.a.clone()),
            )
            .collect::<Result<_, _>>()?;
        if existing.iter().any(|d| d.v == datom.v) {
            return Ok(());
        }
        if !spec.is_many()
            && let Some(current) = existing.first()
        {
            return Err(TesseraError::constraint(
                datom.e,
                &datom.a,
                format!(
                    "cardinality-one attribute already holds {}; retract it first",
                    current.v
                ),
            ));
        }
        if spec.unique.is_some()
            && let Some(owner) = self.owner(&datom.a, &datom.v)?
            && owner != datom.e
        {
            return Err(TesseraError::constraint(
                datom.e,
                &datom.a,
                format!("unique value {} is already held by entity {owner}", datom.v),
            ));
        }

        self.write(&datom, true)?;
        self.added.push(datom);
        Ok(())
    }

    fn retract_matching(&mut self, pattern: Pattern) -> Result<(), TesseraError> {
        let found: Vec<Datom> = self
            .scan(IndexOrder::Eavt, pattern)
            .collect::<Result<_, _>>()?;
        for datom in found {
            self.write(&datom, false)?;
            // Asserted and retracted in the same batch: it never existed.
            if let Some(pos) = self
                .added
                .iter()
                .position(|d| IndexOrder::Eavt.compare(d, &datom).is_eq())
            {
                self.added.remove(pos);
            } else {
                self.retracted.push(datom);
            }
        }
        Ok(())
    }

    fn write(&mut self, datom: &Datom, insert: bool) -> Result<(), TesseraError> {
        let in_avet = self.base.schema().in_avet(&datom.a);
        let mut writer = TreeWriter::new(self.base.pages(), &mut self.delta);
        for order in IndexOrder::ALL {
            if order == IndexOrder::Avet && !in_avet {
                continue;
            }
            let root = self.roots.get(order);
            let next = if insert {
                writer.insert(order, root, datom)?
            } else {
                writer.remove(order, root, datom)?
            };
            if let Some(next) = next {
                self.roots.set(order, next);
            }
        }
        Ok(())
    }

    fn finish(self, tx: TxId, meta: TxMeta, tempids: BTreeMap<String, EntityId>) -> TxReport {
        let db_after = self.base.with_roots(self.roots, self.max_eid, tx.0);
        TxReport {
            db_before: self.base.clone(),
            db_after,
            tx_id: tx,
            tx_meta: meta,
            datoms_added: self.added,
            datoms_retracted: self.retracted,
            tempids,
            delta: self.delta,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
