//! The row/value model shared by every component (`spec.md` §3).
//!
//! A host row, a CRDT materialized view, and a remote query binding are
//! all "a mapping from field names to values" — but plain `serde_json::Value`
//! cannot distinguish a record id from a string that merely looks like
//! one, nor a date from a string that happens to parse as RFC3339. This
//! module re-architects the host runtime's dynamically-typed rows as an
//! explicit tagged sum type, so identifier normalization and diffing
//! dispatch on a real variant instead of re-sniffing strings everywhere
//! they appear.

use crate::identifier::RecordId;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// A single field value in a row. `Object` uses a `BTreeMap` so key order
/// is always sorted, which is what `spec.md` §4.6 requires for the
/// structural-comparison fallback ("nested objects with sorted keys").
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    DateTime(DateTime<Utc>),
    /// Opaque binary payload (e.g. an undecoded envelope field). Left
    /// untouched by `normalize_deep`.
    Bytes(Vec<u8>),
    /// An interned record identifier. `normalize_deep` replaces
    /// record-id-shaped leaves with this variant; `Display`/`to_json`
    /// render it back to its canonical `"<table>:<key>"` form.
    RecordId(RecordId),
    Array(Vec<FieldValue>),
    Object(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            FieldValue::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_record_id(&self) -> Option<&RecordId> {
        match self {
            FieldValue::RecordId(id) => Some(id),
            _ => None,
        }
    }

    /// Converts a plain JSON value into a `FieldValue` tree, with no
    /// record-id detection — that is `identifier::normalize_deep`'s job,
    /// run as a separate pass so the two concerns stay decoupled.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FieldValue::Null,
            serde_json::Value::Bool(b) => FieldValue::Bool(*b),
            serde_json::Value::Number(n) => FieldValue::Number(n.clone()),
            serde_json::Value::String(s) => {
                if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                    FieldValue::DateTime(dt.with_timezone(&Utc))
                } else {
                    FieldValue::String(s.clone())
                }
            }
            serde_json::Value::Array(items) => {
                FieldValue::Array(items.iter().map(FieldValue::from_json).collect())
            }
            serde_json::Value::Object(map) => FieldValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts back to plain JSON, e.g. to hand a row to a remote
    /// database client or to serialize it as AEAD plaintext.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Number(n) => serde_json::Value::Number(n.clone()),
            FieldValue::String(s) => serde_json::Value::String(s.clone()),
            FieldValue::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            FieldValue::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            FieldValue::RecordId(id) => serde_json::Value::String(id.to_string()),
            FieldValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// A row: a mapping from field names to values containing at minimum an
/// `id` (`spec.md` §3). Field order is irrelevant to equality (`BTreeMap`
/// sorts by key), matching the structural-comparison requirement for
/// diffing.
pub type Row = BTreeMap<String, FieldValue>;

/// Reads the reserved `sync_deleted` tombstone field, defaulting to
/// `false` when absent (a row with no sync fields is never considered
/// deleted).
pub fn sync_deleted(row: &Row) -> bool {
    matches!(row.get("sync_deleted"), Some(FieldValue::Bool(true)))
}

/// Reads the reserved `updated_at` field as a timestamp, if present and
/// well-formed.
pub fn updated_at(row: &Row) -> Option<DateTime<Utc>> {
    match row.get("updated_at") {
        Some(FieldValue::DateTime(dt)) => Some(*dt),
        Some(FieldValue::String(s)) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Some(FieldValue::Number(n)) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

/// Row-equivalence per `spec.md` §4.6: when sync-field filtering is
/// active, only `(sync_deleted, updated_at)` are compared; otherwise a
/// full structural comparison (dates as ISO strings, sorted keys — both
/// already guaranteed by `FieldValue`/`Row`).
pub fn rows_equivalent(a: &Row, b: &Row, sync_field_mode: bool) -> bool {
    if sync_field_mode {
        sync_deleted(a) == sync_deleted(b) && updated_at(a) == updated_at(b)
    } else {
        a == b
    }
}
