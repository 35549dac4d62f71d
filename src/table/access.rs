//! Table Access (`spec.md` §4.4): a thin, query-shaped surface over the
//! remote database. Translation and transport only — identifier
//! interning and diffing are the Sync Engine's job, so the events this
//! module delivers carry plain JSON-derived values, not yet-interned
//! [`crate::identifier::RecordId`]s.

use chrono::Utc;
use std::sync::Arc;

use super::query::Subset;
use super::remote::{LiveHandle, RawLiveEvent, RemoteDatabase};
use crate::error::AdapterError;
use crate::identifier::{self, RecordId};
use crate::value::{FieldValue, Row};

/// A translated LIVE event, ready for the Sync Engine to normalize and
/// diff. `Delete` carries the raw id value since Table Access does not
/// own an `IdentityCache`.
#[derive(Clone, Debug)]
pub enum LiveEvent {
    Insert(Row),
    Update(Row),
    Delete(FieldValue),
}

fn row_to_json(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

fn json_to_row(value: &serde_json::Value) -> Row {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
            .collect(),
        _ => Row::new(),
    }
}

/// `{name, relation?}`: the table a `TableAccess` targets. A relation
/// table rewrites `from`/`to` where-fields to the remote's `in`/`out`.
#[derive(Clone, Debug)]
pub struct TableRef {
    pub name: String,
    pub is_relation: bool,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_relation: false,
        }
    }

    pub fn relation(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_relation: true,
        }
    }
}

pub struct TableAccess {
    remote: Arc<dyn RemoteDatabase>,
    table: TableRef,
    /// Whether `sync_deleted`/`updated_at` semantics are active (CRDT
    /// mode, or plain sync-field mode without CRDT).
    sync_field_mode: bool,
}

impl TableAccess {
    pub fn new(remote: Arc<dyn RemoteDatabase>, table: TableRef, sync_field_mode: bool) -> Self {
        Self {
            remote,
            table,
            sync_field_mode,
        }
    }

    /// `listAll()`.
    pub async fn list_all(&self) -> Result<Vec<Row>, AdapterError> {
        if self.sync_field_mode {
            let subset = Subset {
                where_expr: Some(super::query::WhereExpr::Cmp {
                    field: "sync_deleted".to_string(),
                    op: super::query::Op::Eq,
                    value: super::query::Rhs::Literal(FieldValue::Bool(false)),
                }),
                ..Default::default()
            };
            self.load_subset(&subset).await
        } else {
            let rows = self.remote.select(&self.table.name).await?;
            Ok(rows.iter().map(json_to_row).collect())
        }
    }

    /// `loadSubset(subset)`.
    pub async fn load_subset(&self, subset: &Subset) -> Result<Vec<Row>, AdapterError> {
        let (sql, bindings) = subset.to_surql(&self.table.name, self.table.is_relation)?;
        let result = self.remote.query(&sql, bindings).await?;
        let rows = result.into_iter().next().flatten().unwrap_or_default();
        Ok(rows.iter().map(json_to_row).collect())
    }

    /// `create(row)`: typed INSERT when `row.id` is present (after
    /// canonicalizing it), otherwise a CREATE with a server-generated id.
    pub async fn create(&self, row: Row) -> Result<Row, AdapterError> {
        let mut row = row;
        if let Some(id_value) = row.get("id").cloned() {
            let canonical = identifier::to_canonical_string(&id_value).ok_or_else(|| {
                AdapterError::Translation(format!("{id_value:?} is not a valid record id"))
            })?;
            row.insert("id".to_string(), FieldValue::String(canonical));
            let result = self.remote.insert(&self.table.name, row_to_json(&row)).await?;
            Ok(json_to_row(&result))
        } else {
            let result = self.remote.create(&self.table.name, row_to_json(&row)).await?;
            Ok(json_to_row(&result))
        }
    }

    /// `update(id, partial)`: MERGE; in CRDT/sync-field mode also stamps
    /// `sync_deleted = false` and `updated_at = now`.
    pub async fn update(&self, id: &RecordId, mut partial: Row) -> Result<Row, AdapterError> {
        partial.remove("id");
        if self.sync_field_mode {
            partial.insert("sync_deleted".to_string(), FieldValue::Bool(false));
            partial.insert("updated_at".to_string(), FieldValue::DateTime(Utc::now()));
        }
        let result = self.remote.update(id, row_to_json(&partial)).await?;
        Ok(json_to_row(&result))
    }

    /// `softDelete(id)`: MERGE a tombstone when sync-field semantics are
    /// active, otherwise a hard DELETE.
    pub async fn soft_delete(&self, id: &RecordId) -> Result<(), AdapterError> {
        if self.sync_field_mode {
            let mut tombstone = Row::new();
            tombstone.insert("sync_deleted".to_string(), FieldValue::Bool(true));
            tombstone.insert("updated_at".to_string(), FieldValue::DateTime(Utc::now()));
            self.remote.update(id, row_to_json(&tombstone)).await?;
            Ok(())
        } else {
            self.remote.delete(id).await
        }
    }

    /// `subscribe(cb)`: opens a LIVE subscription and translates raw
    /// events into [`LiveEvent`]s, dropping `KILLED` (which instead kills
    /// the handle) and logging unrecognized actions per `spec.md` §7's
    /// Contract-error policy ("ignored with a log").
    pub async fn subscribe(
        &self,
        on_event: Arc<dyn Fn(LiveEvent) + Send + Sync>,
    ) -> Result<Arc<dyn LiveHandle>, AdapterError> {
        let handle = self.remote.live(&self.table.name).await?;
        let handle_for_kill = handle.clone();
        handle.subscribe(Arc::new(move |raw: RawLiveEvent| {
            match raw.action.as_str() {
                "CREATE" => on_event(LiveEvent::Insert(json_to_row(&raw.value))),
                "UPDATE" => on_event(LiveEvent::Update(json_to_row(&raw.value))),
                "DELETE" => match raw.value.get("id") {
                    Some(id) => on_event(LiveEvent::Delete(FieldValue::from_json(id))),
                    None => tracing::warn!("DELETE live event missing id"),
                },
                "KILLED" => {
                    let handle = handle_for_kill.clone();
                    tokio::spawn(async move { handle.kill().await });
                }
                other => tracing::warn!(action = other, "unrecognized live event action"),
            }
        }));
        Ok(handle)
    }

    pub fn supports_live_queries(&self) -> bool {
        self.remote.supports_live_queries()
    }
}
