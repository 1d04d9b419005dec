//! Query engine: predicate composition, ordering and tie-breaks, grouping,
//! pagination, link traversal, virtual unions, and the batched cursor.

use lattice_core::schema::ColumnDescriptor;
use lattice_core::{LatticeError, Schema, StoreConfig, TableDescriptor, Value};
use lattice_storage::query::QueryCancellation;
use lattice_storage::{col, Store};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn schema() -> Schema {
    Schema::new(vec![
        TableDescriptor::new(
            "User",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::int("age").indexed(),
            ],
        ),
        TableDescriptor::new(
            "Trip",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::int("days").indexed(),
                ColumnDescriptor::link("owner", "User"),
                ColumnDescriptor::list("riders", "User"),
            ],
        ),
        TableDescriptor::new(
            "Place",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::int("days").indexed(),
            ],
        ),
    ])
}

fn open_store() -> Store {
    Store::open(StoreConfig::ephemeral(), schema()).unwrap()
}

fn insert_trip(store: &Store, name: &str, days: i64) -> i64 {
    let row = store.new_object("Trip").unwrap();
    row.set("name", name).unwrap();
    row.set("days", days).unwrap();
    store.insert(&row).unwrap()
}

fn insert_user(store: &Store, name: &str, age: i64) -> lattice_storage::DynamicRow {
    let row = store.new_object("User").unwrap();
    row.set("name", name).unwrap();
    row.set("age", age).unwrap();
    store.insert(&row).unwrap();
    row
}

fn names(rows: &[lattice_storage::query::ResultRow]) -> Vec<String> {
    rows.iter()
        .map(|r| r.get("name").unwrap().as_text().unwrap().to_string())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Predicates
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn filter_composes_with_and() {
    let store = open_store();
    insert_trip(&store, "a", 2);
    insert_trip(&store, "b", 6);
    insert_trip(&store, "c", 9);

    let count = store
        .query("Trip")
        .unwrap()
        .filter(col("days").gt(3))
        .filter(col("days").lt(8))
        .count()
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn or_not_between_in_contains_starts_with() {
    let store = open_store();
    insert_trip(&store, "alpine loop", 2);
    insert_trip(&store, "beach day", 6);
    insert_trip(&store, "canyon", 9);

    let q = store.query("Trip").unwrap();
    assert_eq!(
        q.clone()
            .filter(col("days").eq(2i64).or(col("days").eq(9i64)))
            .count()
            .unwrap(),
        2
    );
    assert_eq!(
        q.clone().filter(col("days").between(5i64, 10i64)).count().unwrap(),
        2
    );
    assert_eq!(
        q.clone()
            .filter(col("days").in_values(vec![Value::Int(2), Value::Int(6)]))
            .count()
            .unwrap(),
        2
    );
    assert_eq!(
        q.clone().filter(col("name").contains("an")).count().unwrap(),
        1
    );
    assert_eq!(
        q.clone().filter(col("name").starts_with("b")).count().unwrap(),
        1
    );
    assert_eq!(
        q.clone()
            .filter(col("days").gt(3).negate())
            .count()
            .unwrap(),
        1
    );
}

#[test]
fn link_traversal_filters_by_target_fields() {
    let store = open_store();
    let ada = insert_user(&store, "ada", 36);
    let bob = insert_user(&store, "bob", 17);

    let t1 = store.new_object("Trip").unwrap();
    t1.set("name", "grand tour").unwrap();
    t1.set("days", 10i64).unwrap();
    t1.set("owner", ada.global_id()).unwrap();
    store.insert(&t1).unwrap();
    t1.append_link("riders", &bob).unwrap();

    let t2 = store.new_object("Trip").unwrap();
    t2.set("name", "day ride").unwrap();
    t2.set("days", 1i64).unwrap();
    t2.set("owner", bob.global_id()).unwrap();
    store.insert(&t2).unwrap();

    let owned_by_adults = store
        .query("Trip")
        .unwrap()
        .filter(col("owner.age").ge(18))
        .results()
        .all()
        .unwrap();
    assert_eq!(names(&owned_by_adults), ["grand tour"]);

    let with_bob_riding = store
        .query("Trip")
        .unwrap()
        .filter(col("riders.name").eq("bob"))
        .count()
        .unwrap();
    assert_eq!(with_bob_riding, 1);
}

#[test]
fn unknown_column_is_query_invalid() {
    let store = open_store();
    let err = store
        .query("Trip")
        .unwrap()
        .filter(col("bogus").eq(1i64))
        .count()
        .unwrap_err();
    assert!(matches!(err, LatticeError::QueryInvalid { .. }));
}

#[test]
fn unknown_table_is_query_invalid() {
    let store = open_store();
    assert!(matches!(
        store.query("Nope"),
        Err(LatticeError::QueryInvalid { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ordering, grouping, pagination
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn order_by_ties_break_on_primary_key() {
    let store = open_store();
    let pk_a = insert_trip(&store, "a", 5);
    let pk_b = insert_trip(&store, "b", 5);
    let pk_c = insert_trip(&store, "c", 2);

    let rows = store
        .query("Trip")
        .unwrap()
        .order_by("days", true)
        .results()
        .all()
        .unwrap();
    let pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    assert_eq!(pks, [pk_c, pk_a, pk_b]);
}

#[test]
fn group_without_order_keeps_smallest_primary_key() {
    let store = open_store();
    let first_5 = insert_trip(&store, "one", 5);
    insert_trip(&store, "two", 5);
    let first_2 = insert_trip(&store, "three", 2);

    let rows = store
        .query("Trip")
        .unwrap()
        .group_by("days")
        .results()
        .all()
        .unwrap();
    let mut pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    pks.sort_unstable();
    assert_eq!(pks, [first_5, first_2]);
}

#[test]
fn group_with_order_emits_first_row_per_group() {
    let store = open_store();
    insert_trip(&store, "alpha", 5);
    insert_trip(&store, "zulu", 5);
    insert_trip(&store, "mike", 2);

    let rows = store
        .query("Trip")
        .unwrap()
        .group_by("days")
        .order_by("name", false)
        .results()
        .all()
        .unwrap();
    // Within each group the ordering applies; representative is the first
    // row under it (descending name).
    assert_eq!(names(&rows), ["zulu", "mike"]);
}

#[test]
fn limit_and_offset_paginate() {
    let store = open_store();
    for i in 0..10 {
        insert_trip(&store, &format!("t{i}"), i);
    }
    let rows = store
        .query("Trip")
        .unwrap()
        .order_by("days", true)
        .limit(3)
        .offset(4)
        .results()
        .all()
        .unwrap();
    assert_eq!(names(&rows), ["t4", "t5", "t6"]);
}

#[test]
fn snapshot_materializes_a_window() {
    let store = open_store();
    for i in 0..10 {
        insert_trip(&store, &format!("t{i}"), i);
    }
    let results = store
        .query("Trip")
        .unwrap()
        .order_by("days", true)
        .results();
    let window = results.snapshot(2, 3).unwrap();
    assert_eq!(names(&window), ["t3", "t4"]);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cursor iteration
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn cursor_iterates_past_the_batch_size() {
    let store = open_store();
    store
        .transaction(|s| {
            for i in 0..250 {
                insert_trip(s, &format!("t{i:03}"), i);
            }
            Ok(())
        })
        .unwrap();

    let results = store.query("Trip").unwrap().order_by("days", true).results();
    let mut seen = 0;
    let mut last_days = -1i64;
    for row in results.iter() {
        let row = row.unwrap();
        let days = row.get("days").unwrap().as_int().unwrap();
        assert!(days > last_days);
        last_days = days;
        seen += 1;
    }
    assert_eq!(seen, 250);
}

#[test]
fn cancelled_iteration_stops_cleanly() {
    let store = open_store();
    for i in 0..10 {
        insert_trip(&store, &format!("t{i}"), i);
    }
    let token = QueryCancellation::new();
    token.cancel();
    let results = store
        .query("Trip")
        .unwrap()
        .results()
        .with_cancellation(token);
    assert_eq!(results.iter().count(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Virtual results
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn virtual_query_unions_member_tables() {
    let store = open_store();
    insert_trip(&store, "banff", 3);
    insert_trip(&store, "dolomites", 8);
    let place = store.new_object("Place").unwrap();
    place.set("name", "chamonix").unwrap();
    place.set("days", 6i64).unwrap();
    store.insert(&place).unwrap();

    let vq = store
        .virtual_query(&["Trip", "Place"])
        .unwrap()
        .filter(col("days").gt(4))
        .order_by("name", true);
    assert_eq!(vq.count().unwrap(), 2);

    let rows = vq.rows().unwrap();
    let labels: Vec<(String, String)> = rows
        .iter()
        .map(|r| {
            (
                r.table.clone(),
                r.row.get("name").unwrap().as_text().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        labels,
        [
            ("Place".to_string(), "chamonix".to_string()),
            ("Trip".to_string(), "dolomites".to_string()),
        ]
    );
}

#[test]
fn virtual_query_rejects_unshared_order_column() {
    let store = open_store();
    let err = store
        .virtual_query(&["Trip", "User"])
        .unwrap()
        .order_by("days", true)
        .count()
        .unwrap_err();
    assert!(matches!(err, LatticeError::QueryInvalid { .. }));
}
