//! Scalar SQL functions registered on every connection.
//!
//! `lattice_haversine(lat1, lon1, lat2, lon2)` — great-circle distance in
//! meters. `lattice_vec_dist(a, b, metric)` — distance between two f32
//! BLOB vectors under `l2 | cosine | l1`. Both are deterministic, so the
//! query planner may cache and reorder them freely.

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;

use lattice_core::value::vector_from_blob;
use lattice_core::{LatticeResult, VectorMetric};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two points in degrees.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().asin()
}

/// Distance between two vectors under the given metric.
/// Cosine distance is `1 - similarity`; a zero-norm operand yields the
/// maximum cosine distance.
pub fn vector_distance(a: &[f32], b: &[f32], metric: VectorMetric) -> f64 {
    match metric {
        VectorMetric::L2 => a
            .iter()
            .zip(b)
            .map(|(x, y)| {
                let d = (*x - *y) as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt(),
        VectorMetric::L1 => a
            .iter()
            .zip(b)
            .map(|(x, y)| ((*x - *y) as f64).abs())
            .sum(),
        VectorMetric::Cosine => {
            let mut dot = 0.0f64;
            let mut na = 0.0f64;
            let mut nb = 0.0f64;
            for (x, y) in a.iter().zip(b) {
                dot += (*x as f64) * (*y as f64);
                na += (*x as f64) * (*x as f64);
                nb += (*y as f64) * (*y as f64);
            }
            if na == 0.0 || nb == 0.0 {
                return 1.0;
            }
            1.0 - dot / (na.sqrt() * nb.sqrt())
        }
    }
}

fn user_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(msg.into())
}

/// Register both scalar functions on a connection.
pub fn register_functions(conn: &Connection) -> LatticeResult<()> {
    conn.create_scalar_function(
        "lattice_haversine",
        4,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let lat1: f64 = ctx.get(0)?;
            let lon1: f64 = ctx.get(1)?;
            let lat2: f64 = ctx.get(2)?;
            let lon2: f64 = ctx.get(3)?;
            Ok(haversine_m(lat1, lon1, lat2, lon2))
        },
    )?;

    conn.create_scalar_function(
        "lattice_vec_dist",
        3,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a_blob: Vec<u8> = ctx.get(0)?;
            let b_blob: Vec<u8> = ctx.get(1)?;
            let metric_name: String = ctx.get(2)?;
            let a = vector_from_blob(&a_blob).map_err(|e| user_err(e.to_string()))?;
            let b = vector_from_blob(&b_blob).map_err(|e| user_err(e.to_string()))?;
            if a.len() != b.len() {
                return Err(user_err(format!(
                    "vector dimension mismatch: {} vs {}",
                    a.len(),
                    b.len()
                )));
            }
            let metric =
                VectorMetric::parse(&metric_name).map_err(|e| user_err(e.to_string()))?;
            Ok(vector_distance(&a, &b, metric))
        },
    )?;

    Ok(())
}
