//! The remote database capability contract (`spec.md` §6).
//!
//! Modeled as traits so the crate has no required dependency on any
//! specific database client — an embedder wires a real `surrealdb`
//! client, a test double, or anything else that can satisfy this shape.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::AdapterError;
use crate::identifier::RecordId;

/// One raw message off a LIVE subscription, before Table Access
/// translates it: `{action ∈ {CREATE,UPDATE,DELETE,KILLED}, value}`.
#[derive(Clone, Debug)]
pub struct RawLiveEvent {
    pub action: String,
    pub value: serde_json::Value,
}

/// A LIVE subscription handle: push a callback to receive raw events,
/// and kill the subscription (idempotent).
#[async_trait]
pub trait LiveHandle: Send + Sync {
    fn subscribe(&self, callback: Arc<dyn Fn(RawLiveEvent) + Send + Sync>);
    async fn kill(&self);
}

/// The remote database capabilities Table Access drives (`spec.md` §6).
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    async fn select(&self, table: &str) -> Result<Vec<serde_json::Value>, AdapterError>;

    /// `query(sql, bindings) -> [[rows]|null]`: one entry per statement,
    /// `None` where the remote returned a null result set.
    async fn query(
        &self,
        sql: &str,
        bindings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<Option<Vec<serde_json::Value>>>, AdapterError>;

    async fn create(&self, table: &str, obj: serde_json::Value) -> Result<serde_json::Value, AdapterError>;

    /// Typed insert with an explicit id, used when the submitted row
    /// already carries one (`spec.md` §4.4).
    async fn insert(&self, table: &str, obj: serde_json::Value) -> Result<serde_json::Value, AdapterError>;

    async fn update(&self, id: &RecordId, partial: serde_json::Value) -> Result<serde_json::Value, AdapterError>;

    async fn upsert(&self, id: &RecordId, partial: serde_json::Value) -> Result<serde_json::Value, AdapterError>;

    async fn delete(&self, id: &RecordId) -> Result<(), AdapterError>;

    async fn live(&self, table: &str) -> Result<Arc<dyn LiveHandle>, AdapterError>;

    fn supports_live_queries(&self) -> bool;
}
