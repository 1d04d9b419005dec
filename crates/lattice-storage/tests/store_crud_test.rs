//! Store lifecycle and row CRUD: open/reopen durability, typed reads and
//! writes, defaults, link-list ordering, and live counts.

use lattice_core::schema::{ColumnDescriptor, UniqueConstraint};
use lattice_core::{GeoPoint, LatticeError, Schema, StoreConfig, TableDescriptor, Value};
use lattice_storage::{col, Store};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn trip_schema() -> Schema {
    Schema::new(vec![TableDescriptor::new(
        "Trip",
        vec![
            ColumnDescriptor::text("name"),
            ColumnDescriptor::int("days").indexed(),
            ColumnDescriptor::text("notes").nullable(),
        ],
    )])
}

fn social_schema() -> Schema {
    Schema::new(vec![
        TableDescriptor::new("User", vec![ColumnDescriptor::text("name")]),
        TableDescriptor::new(
            "Trip",
            vec![
                ColumnDescriptor::text("name"),
                ColumnDescriptor::link("owner", "User"),
                ColumnDescriptor::list("riders", "User"),
            ],
        ),
    ])
}

fn open_ephemeral(schema: Schema) -> Store {
    Store::open(StoreConfig::ephemeral(), schema).unwrap()
}

fn insert_trip(store: &Store, name: &str, days: i64) -> i64 {
    let row = store.new_object("Trip").unwrap();
    row.set("name", name).unwrap();
    row.set("days", days).unwrap();
    store.insert(&row).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Insert + query
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn insert_then_filtered_count() {
    let store = open_ephemeral(trip_schema());
    insert_trip(&store, "X", 3);
    insert_trip(&store, "Y", 7);

    let query = store.query("Trip").unwrap().filter(col("days").gt(4));
    assert_eq!(query.count().unwrap(), 1);

    let rows = query.results().all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&Value::Text("Y".into())));
}

#[test]
fn insert_transitions_handle_to_managed() {
    let store = open_ephemeral(trip_schema());
    let row = store.new_object("Trip").unwrap();
    assert!(!row.is_managed());
    assert!(row.primary_key().is_none());

    row.set("name", "X").unwrap();
    row.set("days", 3i64).unwrap();
    let gid_before = row.global_id();
    let pk = store.insert(&row).unwrap();

    assert!(row.is_managed());
    assert_eq!(row.primary_key(), Some(pk));
    assert_eq!(row.global_id(), gid_before);

    // Writes now flow through the kernel.
    row.set("days", 5i64).unwrap();
    let reread = store.get("Trip", pk).unwrap();
    assert_eq!(reread.get("days").unwrap(), Value::Int(5));
}

#[test]
fn double_insert_is_refused() {
    let store = open_ephemeral(trip_schema());
    let row = store.new_object("Trip").unwrap();
    row.set("name", "X").unwrap();
    row.set("days", 1i64).unwrap();
    store.insert(&row).unwrap();
    assert!(matches!(
        store.insert(&row),
        Err(LatticeError::TransactionMisuse { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Round-trip & defaults
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn field_map_round_trips_through_insert() {
    let store = open_ephemeral(trip_schema());
    let row = store.new_object("Trip").unwrap();
    row.set("name", "Tahoe").unwrap();
    row.set("days", 4i64).unwrap();
    let before = row.field_map().unwrap();

    let pk = store.insert(&row).unwrap();
    let after = store.get("Trip", pk).unwrap().field_map().unwrap();
    assert_eq!(before, after);
}

#[test]
fn nullable_columns_default_to_null() {
    let store = open_ephemeral(trip_schema());
    let pk = insert_trip(&store, "X", 3);
    let row = store.get("Trip", pk).unwrap();
    assert_eq!(row.get("notes").unwrap(), Value::Null);
}

#[test]
fn non_nullable_column_without_value_is_rejected() {
    let store = open_ephemeral(trip_schema());
    let row = store.new_object("Trip").unwrap();
    row.set("name", "X").unwrap();
    // days never set — stays Null and the column is NOT NULL.
    assert!(store.insert(&row).is_err());
}

#[test]
fn unknown_column_access_fails() {
    let store = open_ephemeral(trip_schema());
    let row = store.new_object("Trip").unwrap();
    assert!(row.set("bogus", 1i64).is_err());
    assert!(row.get("bogus").is_err());
}

#[test]
fn get_missing_row_is_not_found() {
    let store = open_ephemeral(trip_schema());
    assert!(matches!(
        store.get("Trip", 999),
        Err(LatticeError::NotFound { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Durability across reopen
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn committed_rows_and_audit_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::file(dir.path().join("trips.lattice"));

    {
        let store = Store::open(config.clone(), trip_schema()).unwrap();
        insert_trip(&store, "X", 3);
        insert_trip(&store, "Y", 7);
        assert_eq!(store.audit_entry_count().unwrap(), 2);
    }

    let store = Store::open(config, trip_schema()).unwrap();
    assert_eq!(store.query("Trip").unwrap().count().unwrap(), 2);
    assert_eq!(store.audit_entry_count().unwrap(), 2);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Deletes & live counts
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn delete_removes_row_and_returns_existence() {
    let store = open_ephemeral(trip_schema());
    let pk = insert_trip(&store, "X", 3);
    assert!(store.delete("Trip", pk).unwrap());
    assert!(!store.delete("Trip", pk).unwrap());
    assert!(matches!(
        store.get("Trip", pk),
        Err(LatticeError::NotFound { .. })
    ));
}

#[test]
fn delete_where_counts_matches() {
    let store = open_ephemeral(trip_schema());
    insert_trip(&store, "a", 1);
    insert_trip(&store, "b", 5);
    insert_trip(&store, "c", 9);

    let deleted = store.delete_where("Trip", &col("days").ge(5)).unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(store.query("Trip").unwrap().count().unwrap(), 1);
}

#[test]
fn count_matches_select_at_same_instant() {
    let store = open_ephemeral(trip_schema());
    for days in 0..10 {
        insert_trip(&store, "t", days);
    }
    let query = store.query("Trip").unwrap().filter(col("days").lt(6));
    assert_eq!(
        query.count().unwrap(),
        query.results().all().unwrap().len()
    );

    insert_trip(&store, "late", 2);
    // Live collection: the same query observes the new row.
    assert_eq!(query.count().unwrap(), 7);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Link lists
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn link_list_preserves_insertion_order() {
    let store = open_ephemeral(social_schema());
    let trip = store.new_object("Trip").unwrap();
    trip.set("name", "coast ride").unwrap();
    store.insert(&trip).unwrap();

    let mut riders = Vec::new();
    for name in ["ada", "grace", "edsger"] {
        let user = store.new_object("User").unwrap();
        user.set("name", name).unwrap();
        store.insert(&user).unwrap();
        riders.push(user);
    }
    for rider in &riders {
        trip.append_link("riders", rider).unwrap();
    }

    assert_eq!(trip.link_count("riders").unwrap(), 3);
    let first = trip.link_at("riders", 0).unwrap().unwrap();
    assert_eq!(first.get("name").unwrap(), Value::Text("ada".into()));
    assert_eq!(trip.find_link_index("riders", &riders[2]).unwrap(), Some(2));

    // Removal keeps relative order of survivors.
    let removed = trip.remove_link_at("riders", 1).unwrap();
    assert_eq!(removed, Some(riders[1].global_id()));
    let second = trip.link_at("riders", 1).unwrap().unwrap();
    assert_eq!(second.get("name").unwrap(), Value::Text("edsger".into()));
}

#[test]
fn link_list_order_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::file(dir.path().join("social.lattice"));
    let trip_pk;
    {
        let store = Store::open(config.clone(), social_schema()).unwrap();
        let trip = store.new_object("Trip").unwrap();
        trip.set("name", "tour").unwrap();
        trip_pk = store.insert(&trip).unwrap();
        for name in ["one", "two", "three"] {
            let user = store.new_object("User").unwrap();
            user.set("name", name).unwrap();
            store.insert(&user).unwrap();
            trip.append_link("riders", &user).unwrap();
        }
    }

    let store = Store::open(config, social_schema()).unwrap();
    let trip = store.get("Trip", trip_pk).unwrap();
    let names: Vec<String> = (0..trip.link_count("riders").unwrap())
        .map(|i| {
            trip.link_at("riders", i)
                .unwrap()
                .unwrap()
                .get("name")
                .unwrap()
                .as_text()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(names, ["one", "two", "three"]);
}

#[test]
fn find_link_indices_where_filters_targets() {
    let store = open_ephemeral(social_schema());
    let trip = store.new_object("Trip").unwrap();
    trip.set("name", "ride").unwrap();
    store.insert(&trip).unwrap();

    for name in ["anna", "bob", "alice"] {
        let user = store.new_object("User").unwrap();
        user.set("name", name).unwrap();
        store.insert(&user).unwrap();
        trip.append_link("riders", &user).unwrap();
    }

    let indices = trip
        .find_link_indices_where("riders", &col("name").starts_with("a"))
        .unwrap();
    assert_eq!(indices, vec![0, 2]);
}

#[test]
fn geo_values_round_trip() {
    let schema = Schema::new(vec![TableDescriptor::new(
        "Pin",
        vec![
            ColumnDescriptor::text("label"),
            ColumnDescriptor::geo("at").nullable().indexed(),
        ],
    )]);
    let store = open_ephemeral(schema);
    let pin = store.new_object("Pin").unwrap();
    pin.set("label", "office").unwrap();
    pin.set("at", GeoPoint::new(37.77, -122.42)).unwrap();
    let pk = store.insert(&pin).unwrap();

    let read = store.get("Pin", pk).unwrap().get("at").unwrap();
    assert_eq!(read, Value::Geo(GeoPoint::new(37.77, -122.42)));
}

#[test]
fn unique_constraint_without_upsert_rejects() {
    let schema = Schema::new(vec![TableDescriptor::new(
        "Account",
        vec![ColumnDescriptor::text("handle")],
    )
    .with_constraint(UniqueConstraint::on("handle"))]);
    let store = open_ephemeral(schema);

    let a = store.new_object("Account").unwrap();
    a.set("handle", "kernel").unwrap();
    store.insert(&a).unwrap();

    let b = store.new_object("Account").unwrap();
    b.set("handle", "kernel").unwrap();
    assert!(matches!(
        store.insert(&b),
        Err(LatticeError::ConstraintViolation { .. })
    ));
}
