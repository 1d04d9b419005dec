//! The dynamic value model: one `Value` variant per column kind, plus the
//! conversions the storage layer and the audit wire format need.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::{LatticeError, LatticeResult};
use crate::ids::GlobalId;
use crate::schema::ColumnKind;

/// A geographic point in degrees. Persisted as two REAL columns and
/// mirrored into the table's R*Tree sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// A dynamic field value.
///
/// `List` holds the ordered target global ids of a link list; the storage
/// layer persists it in the column's link table, never in the row itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Link(GlobalId),
    List(Vec<GlobalId>),
    Geo(GeoPoint),
    Vector(Vec<f32>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Real(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_geo(&self) -> Option<GeoPoint> {
        match self {
            Value::Geo(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_link(&self) -> Option<GlobalId> {
        match self {
            Value::Link(id) => Some(*id),
            _ => None,
        }
    }

    /// Whether this value is storable in a column of the given kind.
    /// `Null` is kind-compatible with everything; nullability is enforced
    /// separately by the kernel.
    pub fn matches_kind(&self, kind: &ColumnKind) -> bool {
        match (self, kind) {
            (Value::Null, _) => true,
            (Value::Int(_), ColumnKind::Int) => true,
            (Value::Real(_), ColumnKind::Real) => true,
            (Value::Int(_), ColumnKind::Real) => true,
            (Value::Text(_), ColumnKind::Text) => true,
            (Value::Blob(_), ColumnKind::Blob) => true,
            (Value::Link(_), ColumnKind::Link { .. }) => true,
            (Value::List(_), ColumnKind::List { .. }) => true,
            (Value::Geo(_), ColumnKind::Geo) => true,
            (Value::Vector(v), ColumnKind::Vector { dims, .. }) => v.len() == *dims,
            _ => false,
        }
    }

    // ── SQL conversion ──────────────────────────────────────────────────

    /// Convert to an owned SQLite value for a scalar column.
    ///
    /// `Geo` and `List` never map to a single SQL value; the kernel splits
    /// geo points into their two physical columns and routes lists to the
    /// link table before calling this.
    pub fn to_sql_value(&self) -> LatticeResult<rusqlite::types::Value> {
        use rusqlite::types::Value as Sq;
        Ok(match self {
            Value::Null => Sq::Null,
            Value::Int(v) => Sq::Integer(*v),
            Value::Real(v) => Sq::Real(*v),
            Value::Text(v) => Sq::Text(v.clone()),
            Value::Blob(v) => Sq::Blob(v.clone()),
            Value::Link(id) => Sq::Text(id.to_string()),
            Value::Vector(v) => Sq::Blob(vector_to_blob(v)),
            Value::Geo(_) | Value::List(_) => {
                return Err(LatticeError::Io {
                    message: "geo/list values have no single-column SQL form".to_string(),
                })
            }
        })
    }

    /// Read a column value back from SQLite under the declared kind.
    pub fn from_sql_value(
        raw: rusqlite::types::Value,
        kind: &ColumnKind,
    ) -> LatticeResult<Value> {
        use rusqlite::types::Value as Sq;
        Ok(match (raw, kind) {
            (Sq::Null, _) => Value::Null,
            (Sq::Integer(v), ColumnKind::Int) => Value::Int(v),
            (Sq::Integer(v), ColumnKind::Real) => Value::Real(v as f64),
            (Sq::Real(v), ColumnKind::Real) => Value::Real(v),
            (Sq::Text(v), ColumnKind::Text) => Value::Text(v),
            (Sq::Blob(v), ColumnKind::Blob) => Value::Blob(v),
            (Sq::Text(v), ColumnKind::Link { .. }) => Value::Link(GlobalId::parse(&v)?),
            (Sq::Blob(v), ColumnKind::Vector { .. }) => Value::Vector(vector_from_blob(&v)?),
            (raw, kind) => {
                return Err(LatticeError::Io {
                    message: format!("column value {raw:?} does not match declared kind {kind:?}"),
                })
            }
        })
    }

    // ── Audit wire format ───────────────────────────────────────────────

    /// Encode as the audit wire format's tagged primitive union.
    ///
    /// The listed kinds are `int | string | date | null`; the remaining
    /// column kinds extend the union (`real`, `blob` base64, `geo`,
    /// `vector`). Links and lists encode as strings so the union stays
    /// primitive.
    pub fn to_tagged_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Null => json!({ "kind": "null", "value": null }),
            Value::Int(v) => json!({ "kind": "int", "value": v }),
            Value::Real(v) => json!({ "kind": "real", "value": v }),
            Value::Text(v) => json!({ "kind": "string", "value": v }),
            Value::Blob(v) => json!({
                "kind": "blob",
                "value": base64::engine::general_purpose::STANDARD.encode(v),
            }),
            Value::Link(id) => json!({ "kind": "string", "value": id.to_string() }),
            Value::List(ids) => {
                let arr: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                json!({
                    "kind": "string",
                    "value": serde_json::to_string(&arr).unwrap_or_default(),
                })
            }
            Value::Geo(p) => json!({ "kind": "geo", "value": [p.lat, p.lon] }),
            Value::Vector(v) => json!({ "kind": "vector", "value": v }),
        }
    }

    /// Decode a tagged primitive union from the audit wire format.
    /// `date` values decode as ms-since-epoch integers.
    pub fn from_tagged_json(v: &serde_json::Value) -> LatticeResult<Value> {
        let bad = |msg: &str| LatticeError::Io {
            message: format!("malformed tagged value: {msg}"),
        };
        let kind = v
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| bad("missing kind"))?;
        let value = v.get("value").unwrap_or(&serde_json::Value::Null);
        Ok(match kind {
            "null" => Value::Null,
            "int" | "date" => Value::Int(value.as_i64().ok_or_else(|| bad("expected integer"))?),
            "real" => Value::Real(value.as_f64().ok_or_else(|| bad("expected number"))?),
            "string" => Value::Text(
                value
                    .as_str()
                    .ok_or_else(|| bad("expected string"))?
                    .to_string(),
            ),
            "blob" => {
                let text = value.as_str().ok_or_else(|| bad("expected base64 string"))?;
                Value::Blob(
                    base64::engine::general_purpose::STANDARD
                        .decode(text)
                        .map_err(|e| bad(&format!("bad base64: {e}")))?,
                )
            }
            "geo" => {
                let arr = value.as_array().ok_or_else(|| bad("expected [lat, lon]"))?;
                if arr.len() != 2 {
                    return Err(bad("expected [lat, lon]"));
                }
                Value::Geo(GeoPoint::new(
                    arr[0].as_f64().ok_or_else(|| bad("bad lat"))?,
                    arr[1].as_f64().ok_or_else(|| bad("bad lon"))?,
                ))
            }
            "vector" => {
                let arr = value.as_array().ok_or_else(|| bad("expected float array"))?;
                let mut out = Vec::with_capacity(arr.len());
                for item in arr {
                    out.push(item.as_f64().ok_or_else(|| bad("bad vector element"))? as f32);
                }
                Value::Vector(out)
            }
            other => return Err(bad(&format!("unknown kind '{other}'"))),
        })
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<GlobalId> for Value {
    fn from(v: GlobalId) -> Self {
        Value::Link(v)
    }
}

impl From<GeoPoint> for Value {
    fn from(v: GeoPoint) -> Self {
        Value::Geo(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Vector(v)
    }
}

/// Encode a vector column as a little-endian f32 BLOB.
pub fn vector_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for f in v {
        out.extend_from_slice(&f.to_le_bytes());
    }
    out
}

/// Decode a vector column from its BLOB form.
pub fn vector_from_blob(b: &[u8]) -> LatticeResult<Vec<f32>> {
    if b.len() % 4 != 0 {
        return Err(LatticeError::Io {
            message: format!("vector blob length {} is not a multiple of 4", b.len()),
        });
    }
    let mut out = Vec::with_capacity(b.len() / 4);
    for chunk in b.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 0.0, 3.75];
        assert_eq!(vector_from_blob(&vector_to_blob(&v)).unwrap(), v);
    }

    #[test]
    fn vector_blob_rejects_ragged_length() {
        assert!(vector_from_blob(&[0u8, 1, 2]).is_err());
    }

    #[test]
    fn tagged_json_roundtrip() {
        let values = [
            Value::Null,
            Value::Int(42),
            Value::Real(2.5),
            Value::Text("hello".into()),
            Value::Blob(vec![1, 2, 3]),
            Value::Geo(GeoPoint::new(37.77, -122.42)),
            Value::Vector(vec![0.5, 1.5]),
        ];
        for v in values {
            let decoded = Value::from_tagged_json(&v.to_tagged_json()).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn tagged_json_date_decodes_as_int() {
        let wire = serde_json::json!({ "kind": "date", "value": 1700000000000i64 });
        assert_eq!(
            Value::from_tagged_json(&wire).unwrap(),
            Value::Int(1_700_000_000_000)
        );
    }

    #[test]
    fn link_encodes_as_string() {
        let id = GlobalId::random();
        let wire = Value::Link(id).to_tagged_json();
        assert_eq!(wire["kind"], "string");
        assert_eq!(wire["value"], id.to_string());
    }
}
