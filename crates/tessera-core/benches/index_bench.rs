//! # Index Benchmarks
//!
//! Performance benchmarks for tessera-core index operations.
//!
//! Run with: `cargo bench -p tessera-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use tessera_core::{
    AttributeSpec, Connection, EntityId, OpenOptions, Pattern, Schema, SessionConfig,
    SessionManager, TxMeta, TxOp, Value, ValueType, export_canonical,
};

fn schema() -> Schema {
    Schema::new()
        .with("title", AttributeSpec::one(ValueType::String))
        .with("rank", AttributeSpec::one(ValueType::Long).indexed())
}

/// Open an in-memory graph holding `size` entities with a title and a rank.
fn populated(size: u64) -> (SessionManager, Arc<Connection>) {
    let manager = SessionManager::new(SessionConfig::in_memory());
    let conn = manager
        .open("bench", OpenOptions::new().with_schema(schema()))
        .expect("open");
    let ops = (1..=size)
        .flat_map(|e| {
            [
                TxOp::add(EntityId(e), "title", Value::str(format!("entity {e}"))),
                TxOp::add(EntityId(e), "rank", Value::Long((e % 100) as i64)),
            ]
        })
        .collect();
    conn.transact(ops, TxMeta::new()).expect("transact");
    (manager, conn)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_bulk_transact(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_transact");

    for size in [100u64, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(populated(size)));
        });
    }

    group.finish();
}

fn bench_single_transact(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_transact");

    for size in [1000u64, 10000].iter() {
        let (_manager, conn) = populated(*size);
        let mut next = *size;
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                next += 1;
                let op = TxOp::add(EntityId(next), "title", Value::str("new"));
                black_box(conn.transact(vec![op], TxMeta::new()).expect("transact"))
            });
        });
    }

    group.finish();
}

fn bench_entity_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("entity_lookup");

    for size in [1000u64, 10000].iter() {
        let (_manager, conn) = populated(*size);
        let db = conn.db();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(db.entity(EntityId(size / 2)).expect("entity")));
        });
    }

    group.finish();
}

fn bench_value_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("value_lookup");

    for size in [1000u64, 10000].iter() {
        let (_manager, conn) = populated(*size);
        let db = conn.db();
        let pattern = Pattern::attribute("rank").with_value(Value::Long(42));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(db.query(&pattern).count()));
        });
    }

    group.finish();
}

fn bench_export_canonical(c: &mut Criterion) {
    let mut group = c.benchmark_group("export_canonical");

    for size in [1000u64, 10000].iter() {
        let (_manager, conn) = populated(*size);
        let db = conn.db();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(export_canonical(&db)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_bulk_transact,
    bench_single_transact,
    bench_entity_lookup,
    bench_value_lookup,
    bench_export_canonical,
);

criterion_main!(benches);
