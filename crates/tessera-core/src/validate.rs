//! # Validation
//!
//! Offline consistency check of a snapshot against its schema and of the
//! indexes against each other. Transactions already enforce these rules;
//! this pass is for graphs produced by recovery, imports, or older builds.

use crate::db::Db;
use crate::index::IndexOrder;
use crate::query::Pattern;
use crate::{Attribute, EntityId, TesseraError, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of rule a violation breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    UndeclaredAttribute,
    ValueType,
    Cardinality,
    Uniqueness,
    IndexMismatch,
}

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub entity: Option<EntityId>,
    pub attribute: Option<Attribute>,
    pub detail: String,
}

/// Result of `validate_db`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub datoms_checked: usize,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    fn push(
        &mut self,
        kind: ViolationKind,
        entity: Option<EntityId>,
        attribute: Option<&Attribute>,
        detail: String,
    ) {
        self.violations.push(Violation {
            kind,
            entity,
            attribute: attribute.cloned(),
            detail,
        });
    }
}

/// Check every datom of `db` against the schema and the index invariants.
pub fn validate_db(db: &Db) -> Result<ValidationReport, TesseraError> {
    let schema = db.schema();
    let mut report = ValidationReport::default();
    let mut owners: BTreeMap<(Attribute, Value), EntityId> = BTreeMap::new();
    let mut previous: Option<(EntityId, Attribute)> = None;
    let mut expected_avet = 0usize;

    for datom in db.datoms(IndexOrder::Eavt, Pattern::any()) {
        let datom = datom?;
        report.datoms_checked += 1;

        let same_slot = previous
            .as_ref()
            .is_some_and(|(e, a)| *e == datom.e && *a == datom.a);
        previous = Some((datom.e, datom.a.clone()));

        let Some(spec) = schema.get(&datom.a) else {
            report.push(
                ViolationKind::UndeclaredAttribute,
                Some(datom.e),
                Some(&datom.a),
                format!("{datom} uses an undeclared attribute"),
            );
            continue;
        };
        if spec.in_avet() {
            expected_avet += 1;
        }
        if !spec.value_type.accepts(&datom.v) {
            report.push(
                ViolationKind::ValueType,
                Some(datom.e),
                Some(&datom.a),
                format!("{datom} is not a {:?} value", spec.value_type),
            );
        }
        // EAVT order puts every value of one (e, a) next to each other.
        if !spec.is_many() && same_slot {
            report.push(
                ViolationKind::Cardinality,
                Some(datom.e),
                Some(&datom.a),
                format!("{datom} is a second value of a cardinality-one attribute"),
            );
        }
        if spec.unique.is_some() {
            let key = (datom.a.clone(), datom.v.clone());
            match owners.get(&key) {
                Some(owner) if *owner != datom.e => report.push(
                    ViolationKind::Uniqueness,
                    Some(datom.e),
                    Some(&datom.a),
                    format!("{datom} repeats a unique value held by entity {owner}"),
                ),
                Some(_) => {}
                None => {
                    owners.insert(key, datom.e);
                }
            }
        }
    }

    let aevt = count(db, IndexOrder::Aevt)?;
    if aevt != report.datoms_checked {
        report.push(
            ViolationKind::IndexMismatch,
            None,
            None,
            format!("EAVT holds {} datoms, AEVT holds {aevt}", report.datoms_checked),
        );
    }
    let avet = count(db, IndexOrder::Avet)?;
    if avet != expected_avet {
        report.push(
            ViolationKind::IndexMismatch,
            None,
            None,
            format!("AVET holds {avet} datoms, expected {expected_avet}"),
        );
    }

    tracing::debug!(
        datoms = report.datoms_checked,
        violations = report.violations.len(),
        "validation finished"
    );
    Ok(report)
}

fn count(db: &Db, order: IndexOrder) -> Result<usize, TesseraError> {
    let mut n = 0;
    for datom in db.datoms(order, Pattern::any()) {
        datom?;
        n += 1;
    }
    Ok(n)
}
