//! CRDT document profiles (`spec.md` §3 "CRDT document").
//!
//! A profile is a value, not a class hierarchy — per `spec.md` §9's
//! design notes, the json/richtext split is two small structs
//! implementing one trait, parameterized over the capability traits in
//! [`super`], not a `dyn Any`-keyed registry.

use super::CrdtDoc;
use crate::change::Change;
use crate::error::AdapterError;
use crate::identifier::RecordId;
use crate::value::{FieldValue, Row};

/// Materializes a document into a row and applies local mutations to it.
pub trait Profile: Send + Sync {
    fn apply_local_change(&self, doc: &dyn CrdtDoc, change: &Change) -> Result<(), AdapterError>;

    /// The profile's projection of the doc into a row, with `id`
    /// overwritten to the canonical record id (`spec.md` §4.3).
    fn materialize(&self, doc: &dyn CrdtDoc, id: &RecordId) -> Row;
}

/// Materializes from a root map merged with `{id}`. Local changes write
/// each field of the submitted value into the root map (skipping `id`);
/// deletions set a `deleted` flag.
pub struct JsonProfile;

impl Profile for JsonProfile {
    fn apply_local_change(&self, doc: &dyn CrdtDoc, change: &Change) -> Result<(), AdapterError> {
        let map = doc.root_map();
        match change {
            Change::Insert(row) | Change::Update(row) => {
                for (key, value) in row {
                    if key == "id" {
                        continue;
                    }
                    map.set(key, value.to_json());
                }
            }
            Change::Delete(_) => {
                map.set("deleted", serde_json::Value::Bool(true));
            }
        }
        Ok(())
    }

    fn materialize(&self, doc: &dyn CrdtDoc, id: &RecordId) -> Row {
        let mut row: Row = doc
            .root_map()
            .to_json()
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(&v)))
            .collect();
        row.insert("id".to_string(), FieldValue::RecordId(id.clone()));
        row
    }
}

/// Materializes `{id, content, ...metadata}` where `content` is the full
/// text of a designated text container and metadata is the root map.
/// `content` writes replace the text container wholesale.
pub struct RichTextProfile {
    pub text_field: String,
}

impl Default for RichTextProfile {
    fn default() -> Self {
        Self {
            text_field: "content".to_string(),
        }
    }
}

impl Profile for RichTextProfile {
    fn apply_local_change(&self, doc: &dyn CrdtDoc, change: &Change) -> Result<(), AdapterError> {
        let map = doc.root_map();
        match change {
            Change::Insert(row) | Change::Update(row) => {
                let text = doc.text(&self.text_field);
                for (key, value) in row {
                    if key == "id" {
                        continue;
                    }
                    if key == &self.text_field {
                        if let FieldValue::String(s) = value {
                            text.update(s);
                        }
                        continue;
                    }
                    map.set(key, value.to_json());
                }
            }
            Change::Delete(_) => {
                map.set("deleted", serde_json::Value::Bool(true));
            }
        }
        Ok(())
    }

    fn materialize(&self, doc: &dyn CrdtDoc, id: &RecordId) -> Row {
        let mut row: Row = doc
            .root_map()
            .to_json()
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(&v)))
            .collect();
        row.insert(
            self.text_field.clone(),
            FieldValue::String(doc.text(&self.text_field).get()),
        );
        row.insert("id".to_string(), FieldValue::RecordId(id.clone()));
        row
    }
}
