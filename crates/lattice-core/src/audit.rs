//! Audit record types and the JSON wire format used by the sync boundary.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::errors::{LatticeError, LatticeResult};
use crate::ids::GlobalId;
use crate::value::Value;

/// The operation an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    Insert,
    Update,
    Delete,
}

impl AuditOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOp::Insert => "insert",
            AuditOp::Update => "update",
            AuditOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> LatticeResult<Self> {
        match s {
            "insert" => Ok(AuditOp::Insert),
            "update" => Ok(AuditOp::Update),
            "delete" => Ok(AuditOp::Delete),
            other => Err(LatticeError::Io {
                message: format!("unknown audit op '{other}'"),
            }),
        }
    }
}

/// One durable record of one row mutation — the unit of replication.
///
/// Entries are append-only; only `is_synchronized` ever flips after commit.
/// For deletes `changed_fields` is empty and the row's global id alone
/// identifies the victim.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    /// Monotonic within the store; equals commit order.
    pub sequence_id: u64,
    /// Unique id of the entry itself, stable across replicas.
    pub global_id: GlobalId,
    pub table: String,
    pub op: AuditOp,
    /// Local primary key of the target row at commit time.
    pub row_id: i64,
    /// Global id of the target row.
    pub global_row_id: GlobalId,
    pub changed_fields: FxHashMap<String, Value>,
    /// Mutation order of the changed fields.
    pub changed_field_names: SmallVec<[String; 4]>,
    /// Milliseconds since the epoch; non-decreasing in sequence order.
    pub timestamp: i64,
    pub is_from_remote: bool,
    pub is_synchronized: bool,
}

impl AuditEntry {
    /// The structured row event this entry records.
    pub fn row_event(&self) -> crate::events::RowEvent {
        crate::events::RowEvent {
            op: self.op,
            table: self.table.clone(),
            primary_key: self.row_id,
        }
    }

    /// The commit time as a UTC datetime.
    pub fn timestamp_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Encode with the wire field names of the sync protocol.
    pub fn to_wire(&self) -> serde_json::Value {
        let changed: serde_json::Map<String, serde_json::Value> = self
            .changed_field_names
            .iter()
            .filter_map(|name| {
                self.changed_fields
                    .get(name)
                    .map(|v| (name.clone(), v.to_tagged_json()))
            })
            .collect();
        serde_json::json!({
            "sequenceId": self.sequence_id,
            "globalId": self.global_id.to_string(),
            "table": self.table,
            "op": self.op.as_str(),
            "rowId": self.row_id,
            "globalRowId": self.global_row_id.to_string(),
            "changedFields": changed,
            "changedFieldsNames": self.changed_field_names.iter().collect::<Vec<_>>(),
            "timestamp": self.timestamp,
            "isFromRemote": self.is_from_remote,
            "isSynchronized": self.is_synchronized,
        })
    }

    /// Decode a wire entry. Unknown fields are ignored; `sequenceId` from a
    /// remote store is advisory only (local sequence ids are reassigned).
    pub fn from_wire(v: &serde_json::Value) -> LatticeResult<Self> {
        let bad = |field: &str| LatticeError::Io {
            message: format!("malformed audit entry: missing or invalid '{field}'"),
        };
        let table = v
            .get("table")
            .and_then(|t| t.as_str())
            .ok_or_else(|| bad("table"))?
            .to_string();
        let op = AuditOp::parse(v.get("op").and_then(|o| o.as_str()).ok_or_else(|| bad("op"))?)?;
        let global_id =
            GlobalId::parse(v.get("globalId").and_then(|g| g.as_str()).ok_or_else(|| bad("globalId"))?)?;
        let global_row_id = GlobalId::parse(
            v.get("globalRowId")
                .and_then(|g| g.as_str())
                .ok_or_else(|| bad("globalRowId"))?,
        )?;

        let mut changed_fields = FxHashMap::default();
        if let Some(map) = v.get("changedFields").and_then(|c| c.as_object()) {
            for (name, tagged) in map {
                changed_fields.insert(name.clone(), Value::from_tagged_json(tagged)?);
            }
        }
        let mut changed_field_names: SmallVec<[String; 4]> = SmallVec::new();
        if let Some(names) = v.get("changedFieldsNames").and_then(|n| n.as_array()) {
            for name in names {
                changed_field_names
                    .push(name.as_str().ok_or_else(|| bad("changedFieldsNames"))?.to_string());
            }
        } else {
            changed_field_names.extend(changed_fields.keys().cloned());
        }

        Ok(AuditEntry {
            sequence_id: v.get("sequenceId").and_then(|s| s.as_u64()).unwrap_or(0),
            global_id,
            table,
            op,
            row_id: v.get("rowId").and_then(|r| r.as_i64()).unwrap_or(0),
            global_row_id,
            changed_fields,
            changed_field_names,
            timestamp: v
                .get("timestamp")
                .and_then(|t| t.as_i64())
                .ok_or_else(|| bad("timestamp"))?,
            is_from_remote: v.get("isFromRemote").and_then(|b| b.as_bool()).unwrap_or(false),
            is_synchronized: v
                .get("isSynchronized")
                .and_then(|b| b.as_bool())
                .unwrap_or(false),
        })
    }
}

/// A server-sent sync payload: either a batch of audit entries to apply or
/// an acknowledgement of entries the server has durably received.
#[derive(Debug, Clone)]
pub enum SyncPayload {
    AuditLog { entries: Vec<AuditEntry> },
    Ack { ids: Vec<GlobalId> },
}

impl SyncPayload {
    pub fn decode(bytes: &[u8]) -> LatticeResult<Self> {
        let v: serde_json::Value = serde_json::from_slice(bytes)?;
        let kind = v
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| LatticeError::Io {
                message: "sync payload missing 'kind'".to_string(),
            })?;
        match kind {
            "auditLog" => {
                let raw = v
                    .get("entries")
                    .and_then(|e| e.as_array())
                    .ok_or_else(|| LatticeError::Io {
                        message: "auditLog payload missing 'entries'".to_string(),
                    })?;
                let mut entries = Vec::with_capacity(raw.len());
                for entry in raw {
                    entries.push(AuditEntry::from_wire(entry)?);
                }
                Ok(SyncPayload::AuditLog { entries })
            }
            "ack" => {
                let raw = v
                    .get("ids")
                    .and_then(|i| i.as_array())
                    .ok_or_else(|| LatticeError::Io {
                        message: "ack payload missing 'ids'".to_string(),
                    })?;
                let mut ids = Vec::with_capacity(raw.len());
                for id in raw {
                    ids.push(GlobalId::parse(id.as_str().ok_or_else(|| LatticeError::Io {
                        message: "ack id is not a string".to_string(),
                    })?)?);
                }
                Ok(SyncPayload::Ack { ids })
            }
            other => Err(LatticeError::Io {
                message: format!("unknown sync payload kind '{other}'"),
            }),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let v = match self {
            SyncPayload::AuditLog { entries } => serde_json::json!({
                "kind": "auditLog",
                "entries": entries.iter().map(AuditEntry::to_wire).collect::<Vec<_>>(),
            }),
            SyncPayload::Ack { ids } => serde_json::json!({
                "kind": "ack",
                "ids": ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
            }),
        };
        serde_json::to_vec(&v).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> AuditEntry {
        let mut changed = FxHashMap::default();
        changed.insert("name".to_string(), Value::Text("Z".into()));
        changed.insert("days".to_string(), Value::Int(3));
        AuditEntry {
            sequence_id: 7,
            global_id: GlobalId::random(),
            table: "Trip".into(),
            op: AuditOp::Update,
            row_id: 12,
            global_row_id: GlobalId::random(),
            changed_fields: changed,
            changed_field_names: SmallVec::from_vec(vec!["name".into(), "days".into()]),
            timestamp: 1_700_000_000_000,
            is_from_remote: false,
            is_synchronized: false,
        }
    }

    #[test]
    fn wire_roundtrip() {
        let e = entry();
        let decoded = AuditEntry::from_wire(&e.to_wire()).unwrap();
        assert_eq!(decoded.global_id, e.global_id);
        assert_eq!(decoded.op, AuditOp::Update);
        assert_eq!(decoded.changed_fields, e.changed_fields);
        assert_eq!(decoded.changed_field_names, e.changed_field_names);
        assert_eq!(decoded.timestamp, e.timestamp);
    }

    #[test]
    fn payload_roundtrip() {
        let payload = SyncPayload::AuditLog {
            entries: vec![entry()],
        };
        let bytes = payload.encode();
        match SyncPayload::decode(&bytes).unwrap() {
            SyncPayload::AuditLog { entries } => assert_eq!(entries.len(), 1),
            _ => panic!("wrong payload kind"),
        }
    }

    #[test]
    fn ack_payload_decodes() {
        let id = GlobalId::random();
        let bytes = SyncPayload::Ack { ids: vec![id] }.encode();
        match SyncPayload::decode(&bytes).unwrap() {
            SyncPayload::Ack { ids } => assert_eq!(ids, vec![id]),
            _ => panic!("wrong payload kind"),
        }
    }
}
