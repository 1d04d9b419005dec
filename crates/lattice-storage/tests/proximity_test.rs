//! Proximity queries: bounding boxes, geographic nearest, vector k-NN,
//! full-text matching, and combined nearest intersection.

use lattice_core::schema::{ColumnDescriptor, VectorMetric};
use lattice_core::{GeoPoint, LatticeError, Schema, StoreConfig, TableDescriptor, Value};
use lattice_storage::query::GeoBounds;
use lattice_storage::{col, Store};

// ─── Fixtures ────────────────────────────────────────────────────────────────

fn place_schema() -> Schema {
    Schema::new(vec![TableDescriptor::new(
        "Place",
        vec![
            ColumnDescriptor::text("name"),
            ColumnDescriptor::text("description").indexed(),
            ColumnDescriptor::geo("location").nullable().indexed(),
            ColumnDescriptor::vector("embedding", 3).nullable().indexed(),
            ColumnDescriptor::geo("unindexed_location").nullable(),
        ],
    )])
}

fn open_store() -> Store {
    Store::open(StoreConfig::ephemeral(), place_schema()).unwrap()
}

fn insert_place(
    store: &Store,
    name: &str,
    description: &str,
    location: Option<GeoPoint>,
    embedding: Option<Vec<f32>>,
) -> i64 {
    let row = store.new_object("Place").unwrap();
    row.set("name", name).unwrap();
    row.set("description", description).unwrap();
    if let Some(location) = location {
        row.set("location", location).unwrap();
    }
    if let Some(embedding) = embedding {
        row.set("embedding", embedding).unwrap();
    }
    store.insert(&row).unwrap()
}

const SF_CENTER: GeoPoint = GeoPoint {
    lat: 37.77,
    lon: -122.42,
};

fn seed_san_francisco(store: &Store) -> (i64, i64, i64) {
    // Two places near the center, one in Los Angeles.
    let espresso = insert_place(
        store,
        "espresso bar",
        "great coffee and pastries",
        Some(GeoPoint::new(37.7749, -122.4194)),
        Some(vec![1.0, 0.0, 0.0]),
    );
    let teahouse = insert_place(
        store,
        "teahouse",
        "quiet tea room",
        Some(GeoPoint::new(37.7755, -122.4180)),
        Some(vec![0.0, 1.0, 0.0]),
    );
    let roaster = insert_place(
        store,
        "la roaster",
        "coffee roaster downtown",
        Some(GeoPoint::new(34.0522, -118.2437)),
        Some(vec![1.0, 0.0, 0.0]),
    );
    (espresso, teahouse, roaster)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bounding boxes
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn within_bounds_uses_the_rtree() {
    let store = open_store();
    let (espresso, teahouse, _roaster) = seed_san_francisco(&store);

    let bay_area = GeoBounds::new(37.0, 38.0, -123.0, -122.0);
    let rows = store
        .query("Place")
        .unwrap()
        .within_bounds("location", bay_area)
        .results()
        .all()
        .unwrap();
    let mut pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    pks.sort_unstable();
    assert_eq!(pks, [espresso, teahouse]);
}

#[test]
fn within_bounds_intersects_with_predicates() {
    let store = open_store();
    seed_san_francisco(&store);

    let bay_area = GeoBounds::new(37.0, 38.0, -123.0, -122.0);
    let count = store
        .query("Place")
        .unwrap()
        .within_bounds("location", bay_area)
        .filter(col("name").starts_with("tea"))
        .count()
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn rows_without_a_location_are_not_in_the_index() {
    let store = open_store();
    insert_place(&store, "nowhere", "no location", None, None);
    let everywhere = GeoBounds::new(-90.0, 90.0, -180.0, 180.0);
    let count = store
        .query("Place")
        .unwrap()
        .within_bounds("location", everywhere)
        .count()
        .unwrap();
    assert_eq!(count, 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Geographic nearest
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn nearest_geo_filters_by_radius_and_sorts_by_distance() {
    let store = open_store();
    let (espresso, teahouse, _roaster) = seed_san_francisco(&store);

    let rows = store
        .query("Place")
        .unwrap()
        .nearest_geo("location", SF_CENTER, 2_000.0, None, true)
        .results()
        .all()
        .unwrap();
    let pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    assert_eq!(pks, [espresso, teahouse], "sorted by haversine distance");

    for row in &rows {
        let d = row.distance("location").unwrap();
        assert!(d <= 2_000.0, "distance {d} exceeds the radius");
    }
}

#[test]
fn nearest_geo_limit_truncates_candidates() {
    let store = open_store();
    seed_san_francisco(&store);
    let count = store
        .query("Place")
        .unwrap()
        .nearest_geo("location", SF_CENTER, 2_000.0, Some(1), true)
        .count()
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn proximity_on_unindexed_column_is_query_invalid() {
    let store = open_store();
    let err = store
        .query("Place")
        .unwrap()
        .nearest_geo("unindexed_location", SF_CENTER, 1_000.0, None, true)
        .count()
        .unwrap_err();
    assert!(matches!(err, LatticeError::QueryInvalid { .. }));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Vector k-NN
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn nearest_vector_returns_true_top_k_under_cosine() {
    let store = open_store();
    let a = insert_place(&store, "a", "x", None, Some(vec![1.0, 0.0, 0.0]));
    let b = insert_place(&store, "b", "x", None, Some(vec![0.9, 0.1, 0.0]));
    let _c = insert_place(&store, "c", "x", None, Some(vec![0.0, 0.0, 1.0]));

    let rows = store
        .query("Place")
        .unwrap()
        .nearest_vector("embedding", vec![1.0, 0.0, 0.0], 2, Some(VectorMetric::Cosine))
        .results()
        .all()
        .unwrap();
    let pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    assert_eq!(pks, [a, b]);
    assert!(rows[0].distance("embedding").unwrap() < 1e-9);
}

#[test]
fn nearest_vector_ties_break_on_primary_key() {
    let store = open_store();
    let a = insert_place(&store, "a", "x", None, Some(vec![1.0, 0.0, 0.0]));
    let b = insert_place(&store, "b", "x", None, Some(vec![1.0, 0.0, 0.0]));

    let rows = store
        .query("Place")
        .unwrap()
        .nearest_vector("embedding", vec![1.0, 0.0, 0.0], 2, None)
        .results()
        .all()
        .unwrap();
    let pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    assert_eq!(pks, [a, b]);
}

#[test]
fn dimension_mismatch_is_query_invalid() {
    let store = open_store();
    insert_place(&store, "a", "x", None, Some(vec![1.0, 0.0, 0.0]));
    let err = store
        .query("Place")
        .unwrap()
        .nearest_vector("embedding", vec![1.0, 0.0], 1, None)
        .count()
        .unwrap_err();
    assert!(matches!(err, LatticeError::QueryInvalid { .. }));
}

// ═══════════════════════════════════════════════════════════════════════════════
// Full-text matching
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn matching_finds_terms_and_phrases() {
    let store = open_store();
    seed_san_francisco(&store);

    let q = store.query("Place").unwrap();
    assert_eq!(
        q.clone().matching("description", "coffee", None).count().unwrap(),
        2
    );
    assert_eq!(
        q.clone()
            .matching(
                "description",
                lattice_storage::query::TextQuery::phrase("tea room"),
                None,
            )
            .count()
            .unwrap(),
        1
    );
    assert_eq!(
        q.clone()
            .matching(
                "description",
                lattice_storage::query::TextQuery::prefix("pastr"),
                None,
            )
            .count()
            .unwrap(),
        1
    );
    assert_eq!(
        q.matching(
            "description",
            lattice_storage::query::TextQuery::any_of(["tea", "pastries"]),
            None,
        )
        .count()
        .unwrap(),
        2
    );
}

#[test]
fn fts_index_follows_updates_and_deletes() {
    let store = open_store();
    let pk = insert_place(&store, "spot", "old words here", None, None);

    let row = store.get("Place", pk).unwrap();
    row.set("description", "fresh sourdough bread").unwrap();

    let q = store.query("Place").unwrap();
    assert_eq!(q.clone().matching("description", "old", None).count().unwrap(), 0);
    assert_eq!(
        q.clone().matching("description", "sourdough", None).count().unwrap(),
        1
    );

    store.delete("Place", pk).unwrap();
    assert_eq!(q.matching("description", "sourdough", None).count().unwrap(), 0);
}

// ═══════════════════════════════════════════════════════════════════════════════
// Combined nearest
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn combined_nearest_intersects_all_constraints() {
    let store = open_store();
    let (espresso, _teahouse, _roaster) = seed_san_francisco(&store);

    // Geo: near SF center. Text: mentions coffee. Vector: close to the
    // espresso embedding. Only the espresso bar satisfies all three.
    let query = store
        .query("Place")
        .unwrap()
        .nearest_geo("location", SF_CENTER, 1_000.0, None, true)
        .matching("description", "coffee", None)
        .nearest_vector("embedding", vec![1.0, 0.0, 0.0], 5, None);

    let rows = query.results().all().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].primary_key, espresso);

    // All three buckets contribute a distance.
    assert!(rows[0].distance("location").is_some());
    assert!(rows[0].distance("description").is_some());
    assert!(rows[0].distance("embedding").is_some());
}

#[test]
fn order_by_distance_picks_the_driving_bucket() {
    let store = open_store();
    let (espresso, teahouse, _roaster) = seed_san_francisco(&store);

    // Sort by vector distance to the teahouse embedding while also
    // constraining by geography: the teahouse comes first even though the
    // espresso bar is geographically closer.
    let rows = store
        .query("Place")
        .unwrap()
        .nearest_geo("location", SF_CENTER, 2_000.0, None, true)
        .nearest_vector("embedding", vec![0.0, 1.0, 0.0], 5, None)
        .order_by_distance("embedding")
        .results()
        .all()
        .unwrap();
    let pks: Vec<i64> = rows.iter().map(|r| r.primary_key).collect();
    assert_eq!(pks, [teahouse, espresso]);
}

#[test]
fn nearest_matches_pair_rows_with_distances() {
    let store = open_store();
    seed_san_francisco(&store);

    let matches = store
        .query("Place")
        .unwrap()
        .nearest_geo("location", SF_CENTER, 2_000.0, None, true)
        .results()
        .nearest_matches()
        .unwrap();
    assert_eq!(matches.len(), 2);
    assert!(matches[0].row.is_managed());
    assert!(matches[0].distances.contains_key("location"));
    assert_eq!(
        matches[0].row.get("name").unwrap(),
        Value::Text("espresso bar".into())
    );
}
