//! # Migration Engine
//!
//! Brings a graph's stored schema version up to the version this build
//! expects, one step at a time.
//!
//! Each step reads the current snapshot, applies its change and commits it
//! together with the version bump while holding the connection's writer
//! lock, so transactions cannot interleave with a step. A crash between
//! steps resumes from the last completed step and a crash inside a step
//! leaves the previous version in place. A graph stamped with a version
//! newer than any known step is refused.

use crate::connection::Connection;
use crate::db::Db;
use crate::index::{IndexOrder, TreeWriter};
use crate::query::Pattern;
use crate::schema::{AttributeSpec, Schema, Unique};
use crate::storage::PageDelta;
use crate::{Attribute, TesseraError, ValueType};

/// A step's transformation. Pages it allocates must be recorded in the delta.
pub type MigrationFn = fn(&Db, &mut PageDelta) -> Result<Db, TesseraError>;

/// One versioned migration step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Schema version the graph has once this step is applied.
    pub version: u32,
    pub name: &'static str,
    pub apply: MigrationFn,
}

/// The built-in steps, in version order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base-layout",
        apply: base_layout,
    },
    Migration {
        version: 2,
        name: "builtin-attributes",
        apply: builtin_attributes,
    },
    Migration {
        version: 3,
        name: "backfill-avet",
        apply: backfill_avet,
    },
];

/// Schema version of a fully migrated graph.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Names of the applied steps. Empty if the graph was already current.
    pub applied: Vec<&'static str>,
}

impl MigrationReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Run the built-in steps on an open graph.
pub fn migrate(conn: &Connection) -> Result<MigrationReport, TesseraError> {
    run_migrations(conn, MIGRATIONS)
}

/// Run `steps` (ascending by version) on an open graph.
pub fn run_migrations(
    conn: &Connection,
    steps: &[Migration],
) -> Result<MigrationReport, TesseraError> {
    let stored = conn.db().schema_version();
    let expected = steps.last().map_or(stored, |s| s.version);

    if steps.windows(2).any(|w| w[0].version >= w[1].version) {
        return Err(TesseraError::MigrationFailed {
            stored,
            expected,
            reason: "migration steps are not in ascending version order".to_string(),
        });
    }
    if stored > expected {
        return Err(TesseraError::MigrationFailed {
            stored,
            expected,
            reason: "graph was written by a newer version".to_string(),
        });
    }

    let mut report = MigrationReport {
        from: stored,
        to: stored,
        applied: Vec::new(),
    };
    for step in steps.iter().filter(|s| s.version > stored) {
        let staged = conn.stage(|db, delta| {
            if db.schema_version() >= step.version {
                return Ok(None);
            }
            let migrated = (step.apply)(db, delta)?;
            let mut record = migrated.schema_record().clone();
            record.version = step.version;
            Ok(Some(migrated.with_schema(record)))
        });
        match staged {
            Ok(Some(_)) => {
                tracing::info!(
                    graph = conn.graph_id(),
                    version = step.version,
                    step = step.name,
                    "migration step applied"
                );
                report.to = step.version;
                report.applied.push(step.name);
            }
            // Applied by a concurrent run.
            Ok(None) => report.to = step.version,
            Err(e) => {
                tracing::error!(
                    graph = conn.graph_id(),
                    step = step.name,
                    error = %e,
                    "migration step failed"
                );
                return Err(TesseraError::MigrationFailed {
                    stored: conn.db().schema_version(),
                    expected,
                    reason: format!("step {} ({}) failed: {e}", step.version, step.name),
                });
            }
        }
    }
    Ok(report)
}

// =============================================================================
// BUILT-IN STEPS
// =============================================================================

/// Graphs created before versioning carry no layout changes to apply.
fn base_layout(db: &Db, _delta: &mut PageDelta) -> Result<Db, TesseraError> {
    Ok(db.clone())
}

/// Declare the attributes every graph can rely on.
fn builtin_attributes(db: &Db, _delta: &mut PageDelta) -> Result<Db, TesseraError> {
    let builtins = Schema::new()
        .with(
            "db/ident",
            AttributeSpec::one(ValueType::Keyword).unique(Unique::Identity),
        )
        .with("db/doc", AttributeSpec::one(ValueType::String));
    let mut record = db.schema_record().clone();
    record.schema.extend_from(&builtins)?;
    Ok(db.with_schema(record))
}

/// Make sure every indexed or unique attribute has its datoms in AVET.
fn backfill_avet(db: &Db, delta: &mut PageDelta) -> Result<Db, TesseraError> {
    let attributes: Vec<Attribute> = db
        .schema()
        .iter()
        .filter(|(_, spec)| spec.in_avet())
        .map(|(attribute, _)| attribute.clone())
        .collect();

    let mut roots = db.roots();
    let mut inserted = 0usize;
    let mut writer = TreeWriter::new(db.pages(), delta);
    for attribute in attributes {
        for datom in db.datoms(IndexOrder::Aevt, Pattern::attribute(attribute)) {
            let datom = datom?;
            if let Some(root) = writer.insert(IndexOrder::Avet, roots.avet, &datom)? {
                roots.avet = root;
                inserted += 1;
            }
        }
    }
    tracing::debug!(inserted, "avet backfill");
    Ok(db.with_roots(roots, db.max_eid().0, db.max_tx().0))
}
