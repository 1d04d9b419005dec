//! Audit log semantics: upsert op recording, changed-field completeness,
//! sequence/timestamp monotonicity, and transaction scoping.

use lattice_core::audit::AuditOp;
use lattice_core::schema::{ColumnDescriptor, UniqueConstraint};
use lattice_core::{LatticeError, Schema, StoreConfig, TableDescriptor, Value};
use lattice_storage::Store;

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn user_schema() -> Schema {
    Schema::new(vec![TableDescriptor::new(
        "User",
        vec![
            ColumnDescriptor::text("email"),
            ColumnDescriptor::int("score"),
        ],
    )
    .with_constraint(UniqueConstraint::on("email").upsert())])
}

fn open_store() -> Store {
    Store::open(StoreConfig::ephemeral(), user_schema()).unwrap()
}

fn insert_user(store: &Store, email: &str, score: i64) -> i64 {
    let row = store.new_object("User").unwrap();
    row.set("email", email).unwrap();
    row.set("score", score).unwrap();
    store.insert(&row).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Upsert
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn upsert_updates_in_place_and_audits_update() {
    let store = open_store();
    let pk1 = insert_user(&store, "a@b", 1);
    let pk2 = insert_user(&store, "a@b", 2);

    // Same primary key: the collision became an in-place update.
    assert_eq!(pk1, pk2);
    assert_eq!(store.query("User").unwrap().count().unwrap(), 1);
    let row = store.get("User", pk1).unwrap();
    assert_eq!(row.get("score").unwrap(), Value::Int(2));

    let entries = store.events_after(None).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].op, AuditOp::Insert);
    assert_eq!(entries[1].op, AuditOp::Update);
    // Only the differing column appears in the update entry.
    assert_eq!(entries[1].changed_field_names.as_slice(), ["score"]);
    assert_eq!(
        entries[1].changed_fields.get("score"),
        Some(&Value::Int(2))
    );
}

#[test]
fn upsert_with_identical_values_records_nothing() {
    let store = open_store();
    insert_user(&store, "a@b", 1);
    insert_user(&store, "a@b", 1);

    let entries = store.events_after(None).unwrap();
    assert_eq!(entries.len(), 1, "no-diff upsert should not audit");
}

// ═══════════════════════════════════════════════════════════════════════════════
// Changed-field completeness
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn insert_audits_non_default_columns() {
    let store = open_store();
    insert_user(&store, "x@y", 9);

    let entries = store.events_after(None).unwrap();
    let mut names: Vec<&str> = entries[0]
        .changed_field_names
        .iter()
        .map(String::as_str)
        .collect();
    names.sort_unstable();
    assert_eq!(names, ["email", "score"]);
}

#[test]
fn update_audits_exactly_the_changed_column() {
    let store = open_store();
    let pk = insert_user(&store, "x@y", 1);
    let row = store.get("User", pk).unwrap();
    row.set("score", 2i64).unwrap();

    let entries = store.events_after(None).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].changed_field_names.as_slice(), ["score"]);
    assert_eq!(entries[1].row_id, pk);
}

#[test]
fn writing_the_current_value_is_a_noop() {
    let store = open_store();
    let pk = insert_user(&store, "x@y", 1);
    let row = store.get("User", pk).unwrap();
    row.set("score", 1i64).unwrap();

    assert_eq!(store.events_after(None).unwrap().len(), 1);
}

#[test]
fn delete_audits_with_empty_changed_fields() {
    let store = open_store();
    let pk = insert_user(&store, "x@y", 1);
    let gid = store.get("User", pk).unwrap().global_id();
    store.delete("User", pk).unwrap();

    let entries = store.events_after(None).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].op, AuditOp::Delete);
    assert!(entries[1].changed_fields.is_empty());
    // The global id alone identifies the victim.
    assert_eq!(entries[1].global_row_id, gid);
}

#[test]
fn audit_count_equals_mutation_count() {
    let store = open_store();
    let pk = insert_user(&store, "a@a", 1); // insert
    let row = store.get("User", pk).unwrap();
    row.set("score", 2i64).unwrap(); // update
    row.set("score", 3i64).unwrap(); // update (not coalesced)
    store.delete("User", pk).unwrap(); // delete

    assert_eq!(store.audit_entry_count().unwrap(), 4);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Ordering
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn sequence_order_implies_monotonic_timestamps() {
    let store = open_store();
    for i in 0..20 {
        insert_user(&store, &format!("u{i}@x"), i);
    }
    let entries = store.events_after(None).unwrap();
    for pair in entries.windows(2) {
        assert!(pair[0].sequence_id < pair[1].sequence_id);
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn events_after_resolves_global_id() {
    let store = open_store();
    insert_user(&store, "a@a", 1);
    insert_user(&store, "b@b", 2);
    insert_user(&store, "c@c", 3);

    let all = store.events_after(None).unwrap();
    let after_second = store.events_after(Some(all[1].global_id)).unwrap();
    assert_eq!(after_second.len(), 1);
    assert_eq!(after_second[0].global_id, all[2].global_id);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transactions
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn transaction_batches_audit_entries_at_commit() {
    let store = open_store();
    store.begin().unwrap();
    insert_user(&store, "a@a", 1);
    insert_user(&store, "b@b", 2);
    assert_eq!(store.audit_entry_count().unwrap(), 0, "nothing durable yet");
    store.commit().unwrap();

    assert_eq!(store.audit_entry_count().unwrap(), 2);
    assert_eq!(store.query("User").unwrap().count().unwrap(), 2);
}

#[test]
fn rollback_discards_data_and_audit() {
    let store = open_store();
    store.begin().unwrap();
    insert_user(&store, "a@a", 1);
    store.rollback().unwrap();

    assert_eq!(store.query("User").unwrap().count().unwrap(), 0);
    assert_eq!(store.audit_entry_count().unwrap(), 0);
}

#[test]
fn nested_begin_is_transaction_misuse() {
    let store = open_store();
    store.begin().unwrap();
    assert!(matches!(
        store.begin(),
        Err(LatticeError::TransactionMisuse { .. })
    ));
    store.rollback().unwrap();
}

#[test]
fn commit_without_begin_is_transaction_misuse() {
    let store = open_store();
    assert!(matches!(
        store.commit(),
        Err(LatticeError::TransactionMisuse { .. })
    ));
}

#[test]
fn transaction_closure_commits_on_ok() {
    let store = open_store();
    store
        .transaction(|s| {
            insert_user(s, "a@a", 1);
            insert_user(s, "b@b", 2);
            Ok(())
        })
        .unwrap();
    assert_eq!(store.query("User").unwrap().count().unwrap(), 2);
}

#[test]
fn transaction_closure_rolls_back_on_err() {
    let store = open_store();
    let result: Result<(), _> = store.transaction(|s| {
        insert_user(s, "a@a", 1);
        Err(LatticeError::Io {
            message: "boom".into(),
        })
    });
    assert!(result.is_err());
    assert_eq!(store.query("User").unwrap().count().unwrap(), 0);
}
