//! Sync Engine (`spec.md` §4.6): the state machine that hydrates,
//! subscribes, diffs, and reconciles a remote table against the host's
//! reactive collection, plus the mutation callbacks the host drives
//! local writes back through.
//!
//! Live events and hydration batches are serialized through a single
//! work queue per sync instance (`spec.md` §4.6, §5, §9's "cooperative
//! work queue" design note): a bounded `tokio::sync::mpsc` channel of
//! boxed futures, drained one at a time by a background task spawned
//! from [`SyncEngine::start`]. Cancellation is the `killed` flag,
//! checked both before a queued item runs and before it calls `begin`.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::change::Change;
use crate::crdt::{LogPayload, ReplicationLayer, UpdateLogEntry, UpdateLogStore};
use crate::envelope::{AadOverride, CryptoProvider, Envelope};
use crate::error::{AdapterError, ErrorSink};
use crate::host::{
    MutationCallbacks, OnDemandHandle, SyncContext, SyncEntryPoint, SyncHandle, SyncMode,
    WriteUtils,
};
use crate::identifier::{self, IdentityCache, RecordId};
use crate::subset_cache::SubsetCache;
use crate::table::access::{LiveEvent, TableAccess};
use crate::table::query::{Op, OrderBy, Rhs, Subset, WhereExpr};
use crate::table::remote::{LiveHandle, RemoteDatabase};
use crate::value::{self, FieldValue, Row};

/// `spec.md` §4.6's six states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Hydrating,
    ReadyEager,
    ReadyOnDemand,
    ReadyProgressive,
    TornDown,
}

type WorkItem = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Bridges [`UpdateLogStore`] (the replication layer's narrow persistence
/// seam) onto a real [`RemoteDatabase`], the way the replication layer's
/// own doc comment anticipates ("the Sync Engine wires a real
/// implementation... in"). Rows are plain JSON: `{doc, ts, actor?}` plus
/// either `update_bytes`/`snapshot_bytes` (base64) or the envelope's five
/// full field names (`spec.md` §3, §6).
struct RemoteUpdateLogStore {
    remote: Arc<dyn RemoteDatabase>,
    updates_table: String,
    snapshot_table: String,
    identity: Arc<IdentityCache>,
}

fn entry_to_json(entry: &UpdateLogEntry, field: &str) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(
        "doc".to_string(),
        serde_json::Value::String(entry.doc.to_string()),
    );
    map.insert(
        "ts".to_string(),
        serde_json::Value::String(entry.ts.to_rfc3339()),
    );
    if let Some(actor) = &entry.actor {
        map.insert("actor".to_string(), serde_json::Value::String(actor.clone()));
    }
    match &entry.payload {
        LogPayload::Plain(bytes) => {
            map.insert(
                field.to_string(),
                serde_json::Value::String(BASE64.encode(bytes)),
            );
        }
        LogPayload::Encrypted(envelope) => {
            if let serde_json::Value::Object(fields) =
                serde_json::to_value(envelope).expect("Envelope always serializes")
            {
                map.extend(fields);
            }
        }
    }
    serde_json::Value::Object(map)
}

fn json_entry_from_value(
    value: &serde_json::Value,
    field: &str,
    identity: &IdentityCache,
) -> Result<UpdateLogEntry, AdapterError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AdapterError::Contract("update-log row is not an object".into()))?;
    let doc_value = obj
        .get("doc")
        .ok_or_else(|| AdapterError::Contract("update-log row missing doc".into()))?;
    let doc = identity
        .intern(&FieldValue::from_json(doc_value))
        .ok_or_else(|| AdapterError::Contract("update-log row has an invalid doc id".into()))?;
    let ts = obj
        .get("ts")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| AdapterError::Contract("update-log row missing/invalid ts".into()))?;
    let actor = obj.get("actor").and_then(|v| v.as_str()).map(String::from);
    let payload = match obj.get(field) {
        Some(serde_json::Value::String(encoded)) => {
            let bytes = BASE64
                .decode(encoded)
                .map_err(|e| AdapterError::Contract(format!("bad {field} encoding: {e}")))?;
            LogPayload::Plain(bytes)
        }
        _ => {
            let envelope: Envelope = serde_json::from_value(value.clone()).map_err(|e| {
                AdapterError::Contract(format!("malformed envelope fields on update-log row: {e}"))
            })?;
            LogPayload::Encrypted(envelope)
        }
    };
    Ok(UpdateLogEntry {
        doc,
        ts,
        actor,
        payload,
    })
}

fn row_to_json_value(row: &Row) -> serde_json::Value {
    serde_json::Value::Object(row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
}

impl RemoteUpdateLogStore {
    fn new(
        remote: Arc<dyn RemoteDatabase>,
        updates_table: String,
        snapshot_table: String,
        identity: Arc<IdentityCache>,
    ) -> Self {
        Self {
            remote,
            updates_table,
            snapshot_table,
            identity,
        }
    }

    async fn select_rows(
        &self,
        subset: &Subset,
        table: &str,
    ) -> Result<Vec<serde_json::Value>, AdapterError> {
        let (sql, bindings) = subset.to_surql(table, false)?;
        let result = self.remote.query(&sql, bindings).await?;
        Ok(result.into_iter().next().flatten().unwrap_or_default())
    }
}

#[async_trait]
impl UpdateLogStore for RemoteUpdateLogStore {
    async fn append_update(&self, entry: UpdateLogEntry) -> Result<(), AdapterError> {
        self.remote
            .create(&self.updates_table, entry_to_json(&entry, "update_bytes"))
            .await?;
        Ok(())
    }

    async fn append_snapshot(&self, entry: UpdateLogEntry) -> Result<(), AdapterError> {
        self.remote
            .create(&self.snapshot_table, entry_to_json(&entry, "snapshot_bytes"))
            .await?;
        Ok(())
    }

    async fn latest_snapshot(&self, doc: &RecordId) -> Result<Option<UpdateLogEntry>, AdapterError> {
        let subset = Subset {
            where_expr: Some(WhereExpr::Cmp {
                field: "doc".to_string(),
                op: Op::Eq,
                value: Rhs::Literal(FieldValue::RecordId(doc.clone())),
            }),
            order_by: vec![OrderBy {
                field: "ts".to_string(),
                descending: true,
            }],
            limit: Some(1),
            ..Default::default()
        };
        let rows = self.select_rows(&subset, &self.snapshot_table).await?;
        rows.first()
            .map(|v| json_entry_from_value(v, "snapshot_bytes", &self.identity))
            .transpose()
    }

    async fn updates_since(
        &self,
        doc: &RecordId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<UpdateLogEntry>, AdapterError> {
        let mut clauses = vec![WhereExpr::Cmp {
            field: "doc".to_string(),
            op: Op::Eq,
            value: Rhs::Literal(FieldValue::RecordId(doc.clone())),
        }];
        if let Some(ts) = since {
            clauses.push(WhereExpr::Cmp {
                field: "ts".to_string(),
                op: Op::Gt,
                value: Rhs::Literal(FieldValue::DateTime(ts)),
            });
        }
        let subset = Subset {
            where_expr: Some(WhereExpr::And(clauses)),
            ..Default::default()
        };
        let rows = self.select_rows(&subset, &self.updates_table).await?;
        rows.iter()
            .map(|v| json_entry_from_value(v, "update_bytes", &self.identity))
            .collect()
    }

    async fn known_docs(&self) -> Result<Vec<RecordId>, AdapterError> {
        let rows = self.select_rows(&Subset::default(), &self.updates_table).await?;
        let mut seen = std::collections::HashSet::new();
        let mut docs = Vec::new();
        for row in &rows {
            if let Some(doc_value) = row.get("doc") {
                if let Some(id) = self.identity.intern(&FieldValue::from_json(doc_value)) {
                    if seen.insert(id.clone()) {
                        docs.push(id);
                    }
                }
            }
        }
        Ok(docs)
    }
}

pub(crate) fn make_remote_update_log_store(
    remote: Arc<dyn RemoteDatabase>,
    updates_table: String,
    snapshot_table: String,
    identity: Arc<IdentityCache>,
) -> Arc<dyn UpdateLogStore> {
    Arc::new(RemoteUpdateLogStore::new(
        remote,
        updates_table,
        snapshot_table,
        identity,
    ))
}

fn envelope_to_row_fields(envelope: &Envelope) -> Vec<(String, FieldValue)> {
    vec![
        (
            "version".to_string(),
            FieldValue::Number(serde_json::Number::from(envelope.version)),
        ),
        (
            "algorithm".to_string(),
            FieldValue::String(envelope.algorithm.clone()),
        ),
        (
            "key_id".to_string(),
            FieldValue::String(envelope.key_id.clone()),
        ),
        ("nonce".to_string(), FieldValue::String(envelope.nonce.clone())),
        (
            "ciphertext".to_string(),
            FieldValue::String(envelope.ciphertext.clone()),
        ),
    ]
}

fn envelope_from_row(row: &Row) -> Result<Envelope, AdapterError> {
    let str_field = |name: &str| -> Result<String, AdapterError> {
        match row.get(name) {
            Some(FieldValue::String(s)) => Ok(s.clone()),
            _ => Err(AdapterError::Crypto(format!(
                "row missing envelope field {name}"
            ))),
        }
    };
    let version = match row.get("version") {
        Some(FieldValue::Number(n)) => n
            .as_u64()
            .ok_or_else(|| AdapterError::Crypto("envelope version is not an integer".into()))?
            as u32,
        _ => return Err(AdapterError::Crypto("row missing envelope field version".into())),
    };
    Ok(Envelope {
        version,
        algorithm: str_field("algorithm")?,
        key_id: str_field("key_id")?,
        nonce: str_field("nonce")?,
        ciphertext: str_field("ciphertext")?,
    })
}

/// Everything [`SyncEngine::new`] needs. Assembled by the Adapter Facade
/// from [`crate::adapter::AdapterConfig`].
pub struct SyncEngineConfig {
    pub table: Arc<TableAccess>,
    /// `Some` only in CRDT mode: a `TableAccess` pointed at the updates
    /// table, used solely to open its LIVE subscription.
    pub crdt_table: Option<Arc<TableAccess>>,
    pub crdt: Option<Arc<ReplicationLayer>>,
    pub persist_materialized: bool,
    /// E2EE on base rows. Only set when CRDT is disabled — in CRDT mode,
    /// encryption applies to the update log instead, already wired into
    /// `crdt`'s `CrdtReplicationConfig`.
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    pub aad_override: Option<Arc<AadOverride>>,
    pub base_table: String,
    pub identity: Arc<IdentityCache>,
    pub subset_cache: Arc<SubsetCache>,
    pub sync_mode: SyncMode,
    pub sync_field_mode: bool,
    pub error_sink: Arc<dyn ErrorSink>,
}

pub struct SyncEngine {
    table: Arc<TableAccess>,
    crdt_table: Option<Arc<TableAccess>>,
    crdt: Option<Arc<ReplicationLayer>>,
    persist_materialized: bool,
    crypto: Option<Arc<dyn CryptoProvider>>,
    aad_override: Option<Arc<AadOverride>>,
    base_table: String,
    identity: Arc<IdentityCache>,
    subset_cache: Arc<SubsetCache>,
    sync_mode: SyncMode,
    sync_field_mode: bool,
    error_sink: Arc<dyn ErrorSink>,
    state: SyncMutex<SyncState>,
    prev: SyncMutex<HashMap<RecordId, Row>>,
    killed: Arc<AtomicBool>,
    marked_ready: Arc<AtomicBool>,
    queue_tx: SyncMutex<Option<mpsc::Sender<WorkItem>>>,
    live_handle: SyncMutex<Option<Arc<dyn LiveHandle>>>,
}

impl SyncEngine {
    pub fn new(config: SyncEngineConfig) -> Arc<Self> {
        Arc::new(Self {
            table: config.table,
            crdt_table: config.crdt_table,
            crdt: config.crdt,
            persist_materialized: config.persist_materialized,
            crypto: config.crypto,
            aad_override: config.aad_override,
            base_table: config.base_table,
            identity: config.identity,
            subset_cache: config.subset_cache,
            sync_mode: config.sync_mode,
            sync_field_mode: config.sync_field_mode,
            error_sink: config.error_sink,
            state: SyncMutex::new(SyncState::Idle),
            prev: SyncMutex::new(HashMap::new()),
            killed: Arc::new(AtomicBool::new(false)),
            marked_ready: Arc::new(AtomicBool::new(false)),
            queue_tx: SyncMutex::new(None),
            live_handle: SyncMutex::new(None),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    fn enqueue(self: &Arc<Self>, fut: impl Future<Output = ()> + Send + 'static) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        let tx = self.queue_tx.lock().clone();
        if let Some(tx) = tx {
            if tx.try_send(Box::pin(fut)).is_err() {
                self.error_sink.on_error(&AdapterError::Remote(anyhow::anyhow!(
                    "sync work queue is full or closed; event dropped"
                )));
            }
        }
    }

    fn mark_ready_once(&self, ctx: &Arc<dyn SyncContext>) {
        if !self.marked_ready.swap(true, Ordering::SeqCst) {
            ctx.mark_ready();
        }
    }

    /// Normalizes every field in `row` (record-id-shaped leaves become
    /// interned [`RecordId`]s) and returns the row's own id, if it has
    /// one that canonicalizes.
    fn normalize_and_key(&self, mut row: Row) -> Option<(RecordId, Row)> {
        let id = row.get("id").cloned().and_then(|v| self.identity.intern(&v))?;
        for (_, v) in row.iter_mut() {
            self.identity.normalize_deep(v);
        }
        row.insert("id".to_string(), FieldValue::RecordId(id.clone()));
        Some((id, row))
    }

    /// Decrypts a base row's envelope fields when E2EE-without-CRDT is
    /// active; otherwise a passthrough (`spec.md` §4.2, §6).
    fn decode_plain_row(&self, row: Row) -> Result<Row, AdapterError> {
        let Some(crypto) = &self.crypto else {
            return Ok(row);
        };
        let id_value = row
            .get("id")
            .cloned()
            .ok_or_else(|| AdapterError::Contract("encrypted row missing id".into()))?;
        let id = self
            .identity
            .intern(&id_value)
            .ok_or_else(|| AdapterError::Translation(format!("{id_value:?} is not a record id")))?;
        let envelope = envelope_from_row(&row)?;
        let payload = crate::envelope::decode_base_row(
            crypto.as_ref(),
            &envelope,
            &self.base_table,
            id.key(),
            self.aad_override.as_deref(),
        )?;
        let mut decoded: Row = match payload {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| (k, FieldValue::from_json(&v)))
                .collect(),
            _ => Row::new(),
        };
        decoded.insert("id".to_string(), FieldValue::RecordId(id));
        Ok(decoded)
    }

    /// `spec.md` §4.6's diff-and-emit contract: `curr \ prev` inserts,
    /// changed-in-both updates, `prev \ curr` deletes, bracketed by one
    /// `begin`/`commit` pair. A no-op batch still updates `prev` but
    /// never opens one.
    ///
    /// `rows` must be the complete current contents of whatever `prev`
    /// represents (a full table listing, or every known CRDT doc) —
    /// anything `prev` holds that isn't in `rows` is emitted as a
    /// delete. Call [`Self::merge_and_emit`] instead for a partial slice
    /// (a single live event, one hydration page, one loaded subset).
    fn diff_and_emit(&self, ctx: &Arc<dyn SyncContext>, rows: Vec<Row>) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        let mut curr: HashMap<RecordId, Row> = HashMap::new();
        for row in rows {
            if let Some((id, row)) = self.normalize_and_key(row) {
                curr.insert(id, row);
            }
        }
        let mut prev = self.prev.lock();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for (id, row) in &curr {
            match prev.get(id) {
                None => inserts.push(row.clone()),
                Some(old) => {
                    if !value::rows_equivalent(old, row, self.sync_field_mode) {
                        updates.push(row.clone());
                    }
                }
            }
        }
        for id in prev.keys() {
            if !curr.contains_key(id) {
                deletes.push(id.clone());
            }
        }
        if inserts.is_empty() && updates.is_empty() && deletes.is_empty() {
            *prev = curr;
            return;
        }
        ctx.begin();
        for row in inserts {
            ctx.write(Change::Insert(row));
        }
        for row in updates {
            ctx.write(Change::Update(row));
        }
        for id in deletes {
            ctx.write(Change::Delete(id));
        }
        ctx.commit();
        *prev = curr;
    }

    /// Merges `rows` into `prev` incrementally: an `Insert` for each id
    /// not already in `prev`, an `Update` for each id whose content
    /// changed, and no other id touched. Unlike [`Self::diff_and_emit`],
    /// absence from `rows` never implies a delete — right whenever
    /// `rows` is known to be a slice of the world rather than the whole
    /// of it: one live event, one progressive-hydration page, or one
    /// loaded subset. Using the full-snapshot diff there would flag
    /// every id outside the slice as `prev \ curr` and wrongly delete it.
    fn merge_and_emit(&self, ctx: &Arc<dyn SyncContext>, rows: Vec<Row>) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        let mut keyed: HashMap<RecordId, Row> = HashMap::new();
        for row in rows {
            if let Some((id, row)) = self.normalize_and_key(row) {
                keyed.insert(id, row);
            }
        }
        let mut prev = self.prev.lock();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        for (id, row) in keyed {
            match prev.get(&id) {
                None => inserts.push(row.clone()),
                Some(old) if !value::rows_equivalent(old, &row, self.sync_field_mode) => {
                    updates.push(row.clone());
                }
                Some(_) => continue,
            }
            prev.insert(id, row);
        }
        if inserts.is_empty() && updates.is_empty() {
            return;
        }
        ctx.begin();
        for row in inserts {
            ctx.write(Change::Insert(row));
        }
        for row in updates {
            ctx.write(Change::Update(row));
        }
        ctx.commit();
    }

    async fn persist_materialized_view(&self, row: &Row) -> Result<(), AdapterError> {
        let id = row
            .get("id")
            .and_then(FieldValue::as_record_id)
            .cloned()
            .ok_or_else(|| AdapterError::Contract("materialized view missing id".into()))?;
        let mut partial = row.clone();
        partial.remove("id");
        self.table.update(&id, partial).await?;
        Ok(())
    }

    /// Discovers and hydrates every known row (CRDT: via the updates-log
    /// index; plain: `listAll`), decoding E2EE base rows as needed
    /// (`spec.md` §4.6).
    async fn hydrate_all(&self) -> Result<Vec<Row>, AdapterError> {
        if let Some(crdt) = &self.crdt {
            let docs = crdt.known_docs().await?;
            let mut rows = Vec::with_capacity(docs.len());
            for doc in docs {
                crdt.hydrate(&doc).await?;
                let view = crdt.materialized_view(&doc);
                if self.persist_materialized {
                    self.persist_materialized_view(&view).await?;
                }
                rows.push(view);
            }
            Ok(rows)
        } else {
            let rows = self.table.list_all().await?;
            rows.into_iter().map(|r| self.decode_plain_row(r)).collect()
        }
    }

    async fn run_eager_hydration(self: Arc<Self>, ctx: Arc<dyn SyncContext>) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        match self.hydrate_all().await {
            Ok(rows) => self.diff_and_emit(&ctx, rows),
            Err(err) => {
                self.error_sink.on_error(&err);
                return;
            }
        }
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SyncState::ReadyEager;
        self.mark_ready_once(&ctx);
        self.open_live(ctx).await;
    }

    async fn run_progressive_hydration(self: Arc<Self>, ctx: Arc<dyn SyncContext>) {
        const PAGE_SIZE: u64 = 200;
        let mut offset = 0u64;
        loop {
            if self.killed.load(Ordering::SeqCst) {
                return;
            }
            let subset = Subset {
                limit: Some(PAGE_SIZE),
                offset: Some(offset),
                ..Default::default()
            };
            let rows = match self.table.load_subset(&subset).await {
                Ok(rows) => rows,
                Err(err) => {
                    self.error_sink.on_error(&err);
                    return;
                }
            };
            let page_len = rows.len() as u64;
            let decoded: Result<Vec<Row>, AdapterError> =
                rows.into_iter().map(|r| self.decode_plain_row(r)).collect();
            match decoded {
                Ok(rows) => self.merge_and_emit(&ctx, rows),
                Err(err) => {
                    self.error_sink.on_error(&err);
                    return;
                }
            }
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        self.open_live(ctx).await;
    }

    /// `loadSubset(subset)` as driven by the host in on-demand mode.
    async fn load_subset(
        self: Arc<Self>,
        ctx: Arc<dyn SyncContext>,
        subset: Subset,
    ) -> Result<Vec<Row>, AdapterError> {
        if self.killed.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let key = subset.canonical_key();
        let rows = self.table.load_subset(&subset).await?;
        let mut decoded = Vec::with_capacity(rows.len());
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let row = self.decode_plain_row(row)?;
            if let Some(id) = row.get("id").cloned().and_then(|v| self.identity.intern(&v)) {
                ids.push(id);
            }
            decoded.push(row);
        }
        self.subset_cache.load(key, ids);
        self.merge_and_emit(&ctx, decoded.clone());
        self.clone().open_live(ctx).await;
        Ok(decoded)
    }

    /// `unloadSubset(subset)`. Closes LIVE once no subset remains loaded.
    fn unload_subset(self: Arc<Self>, subset: Subset) {
        let key = subset.canonical_key();
        if self.subset_cache.unload(&key) {
            self.close_live();
        }
    }

    /// Opens LIVE once, idempotently. CRDT mode subscribes to the
    /// updates table (the authoritative log); otherwise the base table.
    async fn open_live(self: Arc<Self>, ctx: Arc<dyn SyncContext>) {
        if self.killed.load(Ordering::SeqCst) || self.live_handle.lock().is_some() {
            return;
        }
        let target = self.crdt_table.clone().unwrap_or_else(|| self.table.clone());
        if !target.supports_live_queries() {
            self.error_sink
                .on_error(&AdapterError::Protocol("remote does not support LIVE queries".into()));
            self.mark_ready_once(&ctx);
            return;
        }
        let is_crdt = self.crdt.is_some();
        let engine = self.clone();
        let ctx_for_cb = ctx.clone();
        let callback: Arc<dyn Fn(LiveEvent) + Send + Sync> = Arc::new(move |event| {
            let engine = engine.clone();
            let ctx = ctx_for_cb.clone();
            if is_crdt {
                engine.clone().enqueue(async move {
                    engine.handle_crdt_live_event(ctx, event).await;
                });
            } else {
                engine.clone().enqueue(async move {
                    engine.handle_live_event(ctx, event).await;
                });
            }
        });
        match target.subscribe(callback).await {
            Ok(handle) => *self.live_handle.lock() = Some(handle),
            Err(err) => self.error_sink.on_error(&err),
        }
    }

    fn close_live(&self) {
        if let Some(handle) = self.live_handle.lock().take() {
            tokio::spawn(async move {
                handle.kill().await;
            });
        }
    }

    /// LIVE event handling for the plain (non-CRDT) base table
    /// (`spec.md` §4.5, §4.6).
    async fn handle_live_event(self: Arc<Self>, ctx: Arc<dyn SyncContext>, event: LiveEvent) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        match event {
            LiveEvent::Insert(row) | LiveEvent::Update(row) => {
                let row = match self.decode_plain_row(row) {
                    Ok(row) => row,
                    Err(err) => {
                        self.error_sink.on_error(&err);
                        return;
                    }
                };
                let id = match row.get("id").cloned().and_then(|v| self.identity.intern(&v)) {
                    Some(id) => id,
                    None => return,
                };
                if self.sync_mode == SyncMode::OnDemand && !self.subset_cache.is_active(&id) {
                    return;
                }
                self.merge_and_emit(&ctx, vec![row]);
            }
            LiveEvent::Delete(id_value) => {
                let Some(id) = self.identity.intern(&id_value) else {
                    tracing::warn!("DELETE live event with unrecognized id");
                    return;
                };
                if self.sync_mode == SyncMode::OnDemand {
                    self.subset_cache.remove_everywhere(&id);
                }
                // Deletes are forwarded unconditionally, even for ids
                // never in any loaded subset (`spec.md` §9's open
                // question: "the code forwards unconditionally").
                self.prev.lock().remove(&id);
                ctx.begin();
                ctx.write(Change::Delete(id));
                ctx.commit();
            }
        }
    }

    /// LIVE event handling for the CRDT updates table: decode, check
    /// loop prevention, import, re-materialize, emit (`spec.md` §4.3,
    /// §4.6).
    async fn handle_crdt_live_event(self: Arc<Self>, ctx: Arc<dyn SyncContext>, event: LiveEvent) {
        if self.killed.load(Ordering::SeqCst) {
            return;
        }
        let Some(crdt) = &self.crdt else { return };
        let row = match event {
            LiveEvent::Insert(row) | LiveEvent::Update(row) => row,
            // The updates table is append-only; a DELETE here is outside
            // this crate's contract and is logged rather than acted on.
            LiveEvent::Delete(_) => {
                tracing::warn!("unexpected DELETE live event on the CRDT updates table");
                return;
            }
        };
        let entry = match json_entry_from_value(&row_to_json_value(&row), "update_bytes", &self.identity)
        {
            Ok(entry) => entry,
            Err(err) => {
                self.error_sink.on_error(&err);
                return;
            }
        };
        if crdt.is_own_actor(&entry.doc, entry.actor.as_deref()) {
            return;
        }
        let bytes = match crdt.decode_incoming_update(&entry) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.error_sink.on_error(&err);
                return;
            }
        };
        if let Err(err) = crdt.import_remote_update(&entry.doc, &bytes) {
            self.error_sink.on_error(&err);
            return;
        }
        let materialized = crdt.materialized_view(&entry.doc);
        if self.persist_materialized {
            if let Err(err) = self.persist_materialized_view(&materialized).await {
                self.error_sink.on_error(&err);
            }
        }
        self.merge_and_emit(&ctx, vec![materialized]);
    }

    /// `spec.md` §5's cleanup: idempotent, silences all further events.
    pub fn teardown(&self) {
        self.killed.store(true, Ordering::SeqCst);
        *self.state.lock() = SyncState::TornDown;
        self.queue_tx.lock().take();
        self.close_live();
    }

    fn start(self: Arc<Self>, ctx: Arc<dyn SyncContext>) -> SyncHandle {
        let (tx, mut rx) = mpsc::channel::<WorkItem>(1024);
        *self.queue_tx.lock() = Some(tx);
        let killed = self.killed.clone();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if killed.load(Ordering::SeqCst) {
                    continue;
                }
                item.await;
            }
        });

        match self.sync_mode {
            SyncMode::Eager => {
                *self.state.lock() = SyncState::Hydrating;
                let engine = self.clone();
                let ctx = ctx.clone();
                self.clone().enqueue(async move { engine.run_eager_hydration(ctx).await });
            }
            SyncMode::OnDemand => {
                *self.state.lock() = SyncState::ReadyOnDemand;
                self.mark_ready_once(&ctx);
            }
            SyncMode::Progressive => {
                *self.state.lock() = SyncState::ReadyProgressive;
                self.mark_ready_once(&ctx);
                let engine = self.clone();
                let ctx = ctx.clone();
                self.clone()
                    .enqueue(async move { engine.run_progressive_hydration(ctx).await });
            }
        }

        let cleanup_engine = self.clone();
        let cleanup: Arc<dyn Fn() + Send + Sync> = Arc::new(move || cleanup_engine.teardown());

        let on_demand = (self.sync_mode == SyncMode::OnDemand).then(|| {
            let load_engine = self.clone();
            let load_ctx = ctx.clone();
            let unload_engine = self.clone();
            OnDemandHandle {
                load_subset: Arc::new(move |subset: Subset| {
                    let engine = load_engine.clone();
                    let ctx = load_ctx.clone();
                    Box::pin(async move { engine.load_subset(ctx, subset).await })
                        as BoxFuture<'static, Result<Vec<Row>, AdapterError>>
                }),
                unload_subset: Arc::new(move |subset: Subset| {
                    unload_engine.clone().unload_subset(subset);
                }),
            }
        });

        SyncHandle { cleanup, on_demand }
    }

    fn base_table(&self) -> &str {
        &self.base_table
    }

    async fn encode_and_create(&self, row: Row) -> Result<Row, AdapterError> {
        let crypto = self
            .crypto
            .as_ref()
            .expect("called only when crypto is configured");
        let id = row
            .get("id")
            .cloned()
            .and_then(|v| self.identity.intern(&v))
            .ok_or_else(|| AdapterError::Config("E2EE requires a record id before encrypting".into()))?;
        let mut payload = serde_json::Map::new();
        for (k, v) in &row {
            if k == "id" {
                continue;
            }
            payload.insert(k.clone(), v.to_json());
        }
        let envelope = crate::envelope::encode_base_row(
            crypto.as_ref(),
            &serde_json::Value::Object(payload),
            self.base_table(),
            id.key(),
            self.aad_override.as_deref(),
        )?;
        let mut to_create = Row::new();
        to_create.insert("id".to_string(), FieldValue::RecordId(id));
        for (k, v) in envelope_to_row_fields(&envelope) {
            to_create.insert(k, v);
        }
        let persisted = self.table.create(to_create).await?;
        self.decode_plain_row(persisted)
    }

    async fn read_modify_write_encrypted(&self, key: &RecordId, partial: &Row) -> Result<Row, AdapterError> {
        let crypto = self
            .crypto
            .as_ref()
            .expect("called only when crypto is configured");
        let lookup = Subset {
            where_expr: Some(WhereExpr::Cmp {
                field: "id".to_string(),
                op: Op::Eq,
                value: Rhs::Literal(FieldValue::RecordId(key.clone())),
            }),
            limit: Some(1),
            ..Default::default()
        };
        let current = self
            .table
            .load_subset(&lookup)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::Remote(anyhow::anyhow!("row {key} not found for update")))?;
        let envelope = envelope_from_row(&current)?;
        let decoded = crate::envelope::decode_base_row(
            crypto.as_ref(),
            &envelope,
            self.base_table(),
            key.key(),
            self.aad_override.as_deref(),
        )?;
        let mut merged = match decoded {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        for (k, v) in partial {
            if k == "id" {
                continue;
            }
            merged.insert(k.clone(), v.to_json());
        }
        let new_envelope = crate::envelope::encode_base_row(
            crypto.as_ref(),
            &serde_json::Value::Object(merged),
            self.base_table(),
            key.key(),
            self.aad_override.as_deref(),
        )?;
        let mut update_row = Row::new();
        for (k, v) in envelope_to_row_fields(&new_envelope) {
            update_row.insert(k, v);
        }
        let persisted = self.table.update(key, update_row).await?;
        self.decode_plain_row(persisted)
    }
}


impl SyncEntryPoint for Arc<SyncEngine> {
    fn sync(&self, ctx: Arc<dyn SyncContext>) -> SyncHandle {
        self.clone().start(ctx)
    }
}

#[async_trait]
impl MutationCallbacks for SyncEngine {
    /// `spec.md` §4.6's insert callback.
    async fn on_insert(&self, mut row: Row, utils: Arc<dyn WriteUtils>) -> Result<(), AdapterError> {
        let id = match row.get("id").cloned().and_then(|v| self.identity.intern(&v)) {
            Some(id) => id,
            None => {
                let canonical = identifier::temporary_id(self.base_table());
                let id = self
                    .identity
                    .intern(&FieldValue::String(canonical))
                    .expect("a generated temporary id always canonicalizes");
                row.insert("id".to_string(), FieldValue::RecordId(id.clone()));
                id
            }
        };
        utils.upsert(row.clone());

        if let Some(crdt) = &self.crdt {
            let change = Change::Insert(row);
            let before = crdt.apply_local_change(&id, &change)?;
            let delta = crdt.export_since(&id, before);
            crdt.persist_update(&id, &delta, &change).await?;
            let materialized = crdt.materialized_view(&id);
            if self.persist_materialized {
                self.persist_materialized_view(&materialized).await?;
            }
            utils.upsert(materialized);
        } else if self.crypto.is_some() {
            let persisted = self.encode_and_create(row).await?;
            utils.upsert(persisted);
        } else {
            let persisted = self.table.create(row).await?;
            utils.upsert(persisted);
        }
        Ok(())
    }

    /// `spec.md` §4.6's update callback.
    async fn on_update(
        &self,
        key: RecordId,
        modified: Row,
        utils: Arc<dyn WriteUtils>,
    ) -> Result<(), AdapterError> {
        let mut optimistic = modified.clone();
        optimistic.insert("id".to_string(), FieldValue::RecordId(key.clone()));
        utils.upsert(optimistic);

        if let Some(crdt) = &self.crdt {
            let change = Change::Update(modified);
            let before = crdt.apply_local_change(&key, &change)?;
            let delta = crdt.export_since(&key, before);
            crdt.persist_update(&key, &delta, &change).await?;
            let materialized = crdt.materialized_view(&key);
            if self.persist_materialized {
                self.persist_materialized_view(&materialized).await?;
            }
            utils.upsert(materialized);
        } else if self.crypto.is_some() {
            let persisted = self.read_modify_write_encrypted(&key, &modified).await?;
            utils.upsert(persisted);
        } else {
            let persisted = self.table.update(&key, modified).await?;
            utils.upsert(persisted);
        }
        Ok(())
    }

    /// `spec.md` §4.6's delete callback.
    async fn on_delete(&self, key: RecordId, utils: Arc<dyn WriteUtils>) -> Result<(), AdapterError> {
        utils.delete(key.clone());
        if let Some(crdt) = &self.crdt {
            let change = Change::Delete(key.clone());
            let before = crdt.apply_local_change(&key, &change)?;
            let delta = crdt.export_since(&key, before);
            crdt.persist_update(&key, &delta, &change).await?;
        } else {
            self.table.soft_delete(&key).await?;
        }
        Ok(())
    }
}
