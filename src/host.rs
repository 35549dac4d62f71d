//! The host reactive-collection-runtime contract (`spec.md` §6).
//!
//! Two directions cross this seam. The host calls *into* the adapter
//! through [`SyncContext`] (begin/write/commit/mark_ready/truncate) to
//! let the Sync Engine drive batches into the host's in-memory
//! collection; the adapter hands the host a [`CollectionConfig`] so the
//! host can drive hydration (`sync`), lazy subsets, and mutation
//! callbacks. Per `spec.md` §9's design note, the host's write-utility
//! bag is a capability struct ([`WriteUtils`]) passed explicitly into
//! each mutation callback, not looked up by string key.

use futures::future::BoxFuture;
use std::sync::Arc;

use crate::change::Change;
use crate::error::AdapterError;
use crate::identifier::RecordId;
use crate::table::query::Subset;
use crate::value::Row;

/// `syncMode` (`spec.md` §4.6, §6). The one piece of `AdapterConfig`
/// that is plain data end to end, so it alone carries `serde` derives —
/// the rest of the config mixes in capability injections (`db`,
/// `crypto`, `doc_factory`) that have no meaningful deserialized form.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    Eager,
    OnDemand,
    Progressive,
}

/// The control surface a sync invocation is handed (`spec.md` §6's `ctx`).
/// `collection` (an opaque handle back into the host's own collection) is
/// in the wire contract but has no use inside this crate, since nothing
/// here reaches back into host-internal state through it — only the
/// other four members are ever called.
pub trait SyncContext: Send + Sync {
    fn begin(&self);
    fn write(&self, change: Change);
    fn commit(&self);
    fn mark_ready(&self);
    fn truncate(&self);
}

/// The write-utility bag a mutation callback uses for its optimistic
/// local write, ahead of the remote round-trip (`spec.md` §4.6, §9).
pub trait WriteUtils: Send + Sync {
    fn upsert(&self, row: Row);
    fn delete(&self, id: RecordId);
}

/// `onInsert`/`onUpdate`/`onDelete` (`spec.md` §4.6, §6).
#[async_trait::async_trait]
pub trait MutationCallbacks: Send + Sync {
    async fn on_insert(&self, row: Row, utils: Arc<dyn WriteUtils>) -> Result<(), AdapterError>;
    async fn on_update(
        &self,
        key: RecordId,
        modified: Row,
        utils: Arc<dyn WriteUtils>,
    ) -> Result<(), AdapterError>;
    async fn on_delete(&self, key: RecordId, utils: Arc<dyn WriteUtils>) -> Result<(), AdapterError>;
}

/// The on-demand-only half of a sync invocation's return value: the host
/// drives hydration of a subset, and tears it down again, through these
/// two functions (`spec.md` §4.6's `Ready-OnDemand`).
pub struct OnDemandHandle {
    pub load_subset:
        Arc<dyn Fn(Subset) -> BoxFuture<'static, Result<Vec<Row>, AdapterError>> + Send + Sync>,
    pub unload_subset: Arc<dyn Fn(Subset) + Send + Sync>,
}

/// What a sync invocation hands back to the host: always a cleanup
/// function, plus `loadSubset`/`unloadSubset` in on-demand mode
/// (`spec.md` §6's `cleanup|{cleanup, loadSubset, unloadSubset}`).
pub struct SyncHandle {
    pub cleanup: Arc<dyn Fn() + Send + Sync>,
    pub on_demand: Option<OnDemandHandle>,
}

/// The sync entry point the host calls once per collection instance.
pub trait SyncEntryPoint: Send + Sync {
    fn sync(&self, ctx: Arc<dyn SyncContext>) -> SyncHandle;
}

/// Validates and normalizes insert inputs before they reach the Sync
/// Engine (`spec.md` §4.7).
pub trait RowSchema: Send + Sync {
    fn validate_insert(&self, value: serde_json::Value) -> Result<Row, AdapterError>;
}

/// The shape the adapter returns for the host to build a collection
/// config around (`spec.md` §6's `{id?, getKey, schema, sync, onInsert,
/// onUpdate, onDelete, queryKey, queryClient, syncMode}`). `queryClient`
/// is dropped: it is an opaque cache-scope handle the host threads
/// through its own cache invalidation, with no behavior this crate
/// defines or consumes.
pub struct CollectionConfig {
    pub id: Option<String>,
    pub get_key: Arc<dyn Fn(&Row) -> Option<RecordId> + Send + Sync>,
    pub schema: Arc<dyn RowSchema>,
    pub sync: Arc<dyn SyncEntryPoint>,
    pub callbacks: Arc<dyn MutationCallbacks>,
    pub query_key: Vec<serde_json::Value>,
    pub sync_mode: SyncMode,
}
