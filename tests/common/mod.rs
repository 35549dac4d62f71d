//! Shared test doubles for the end-to-end scenarios in `spec.md` §8
//! (S1-S6): a fake remote database with LIVE subscriptions a test can
//! drive by hand, and a fake host [`SyncContext`]/[`WriteUtils`] pair
//! that records the `begin`/`write`/`commit`/`markReady` sequence the
//! Sync Engine emits.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use surreal_collection_adapter::change::Change;
use surreal_collection_adapter::error::AdapterError;
use surreal_collection_adapter::host::{SyncContext, WriteUtils};
use surreal_collection_adapter::identifier::RecordId;
use surreal_collection_adapter::table::remote::{LiveHandle, RawLiveEvent, RemoteDatabase};

/// A single table's storage plus a lazily-opened LIVE handle the test
/// can push raw events through.
#[derive(Default)]
struct TableState {
    rows: Vec<serde_json::Value>,
    live: Option<Arc<FakeLiveHandle>>,
}

#[derive(Default)]
pub struct FakeDb {
    tables: Mutex<HashMap<String, TableState>>,
    supports_live: AtomicBool,
}

impl FakeDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(HashMap::new()),
            supports_live: AtomicBool::new(true),
        })
    }

    pub fn without_live_queries() -> Arc<Self> {
        let db = Self::new();
        db.supports_live.store(false, Ordering::SeqCst);
        db
    }

    /// Seeds `table` with a row before sync starts.
    pub fn seed(&self, table: &str, row: serde_json::Value) {
        self.tables.lock().entry(table.to_string()).or_default().rows.push(row);
    }

    /// The LIVE handle opened for `table`, once the engine has
    /// subscribed — used to push events as if the remote sent them.
    pub fn live_handle(&self, table: &str) -> Arc<FakeLiveHandle> {
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .live
            .clone()
            .expect("no LIVE subscription opened for this table yet")
    }

    pub fn rows(&self, table: &str) -> Vec<serde_json::Value> {
        self.tables.lock().get(table).map(|t| t.rows.clone()).unwrap_or_default()
    }
}

fn field_str<'a>(row: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    row.get(field).and_then(|v| v.as_str())
}

/// Extracts `(field, op, param)` triples from the `WHERE` clause of a
/// query built by [`surreal_collection_adapter::table::query::Subset::to_surql`].
/// Good enough for the handful of shapes this crate's own engine emits
/// (`doc = $pN`, `(doc = $pN) AND (ts > $pN)`, `id = $pN`,
/// `sync_deleted = $pN`) — not a general SurrealQL parser.
fn parse_where(sql: &str) -> Vec<(String, String, String)> {
    let Some(where_idx) = sql.find(" WHERE ") else {
        return Vec::new();
    };
    let after = &sql[where_idx + 7..];
    let end = ["ORDER BY", "LIMIT", "START"]
        .iter()
        .filter_map(|kw| after.find(kw))
        .min()
        .unwrap_or(after.len());
    let clause_str = after[..end].trim();
    let mut clauses = Vec::new();
    for part in clause_str.split(" AND ") {
        let part = part.trim().trim_start_matches('(').trim_end_matches(')');
        for op in ["!=", ">=", "<=", "=", ">", "<"] {
            if let Some(pos) = part.find(op) {
                let field = part[..pos].trim().to_string();
                let param = part[pos + op.len()..].trim().trim_start_matches('$').to_string();
                clauses.push((field, op.to_string(), param));
                break;
            }
        }
    }
    clauses
}

fn matches_clause(
    row: &serde_json::Value,
    field: &str,
    op: &str,
    bound: &serde_json::Value,
) -> bool {
    let actual = row.get(field);
    match op {
        "=" => actual == Some(bound),
        "!=" => actual != Some(bound),
        ">" => match (actual.and_then(|v| v.as_str()), bound.as_str()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        },
        _ => true,
    }
}

#[async_trait]
impl RemoteDatabase for FakeDb {
    async fn select(&self, table: &str) -> Result<Vec<serde_json::Value>, AdapterError> {
        Ok(self.rows(table))
    }

    async fn query(
        &self,
        sql: &str,
        bindings: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Vec<Option<Vec<serde_json::Value>>>, AdapterError> {
        let from_idx = sql.find("FROM ").expect("query must target a table");
        let rest = &sql[from_idx + 5..];
        let table = rest.split_whitespace().next().unwrap_or_default();
        let mut rows = self.rows(table);

        for (field, op, param) in parse_where(sql) {
            let Some(bound) = bindings.get(&param) else {
                continue;
            };
            rows.retain(|row| matches_clause(row, &field, &op, bound));
        }
        if sql.contains("ORDER BY ts DESC") {
            rows.sort_by(|a, b| field_str(b, "ts").cmp(&field_str(a, "ts")));
        }
        if let Some(limit_idx) = sql.find("LIMIT ") {
            let n: usize = sql[limit_idx + 6..]
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(rows.len());
            rows.truncate(n);
        }
        Ok(vec![Some(rows)])
    }

    async fn create(
        &self,
        table: &str,
        obj: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        self.tables.lock().entry(table.to_string()).or_default().rows.push(obj.clone());
        Ok(obj)
    }

    async fn insert(
        &self,
        table: &str,
        obj: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        self.tables.lock().entry(table.to_string()).or_default().rows.push(obj.clone());
        Ok(obj)
    }

    async fn update(
        &self,
        id: &RecordId,
        partial: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        let mut tables = self.tables.lock();
        let state = tables.entry(id.table().to_string()).or_default();
        let target = id.to_string();
        for row in state.rows.iter_mut() {
            if field_str(row, "id") == Some(target.as_str()) {
                if let (serde_json::Value::Object(existing), serde_json::Value::Object(patch)) =
                    (row, &partial)
                {
                    for (k, v) in patch {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                return Ok(partial);
            }
        }
        Err(AdapterError::Remote(anyhow::anyhow!(
            "no row {target} to update"
        )))
    }

    async fn upsert(
        &self,
        id: &RecordId,
        partial: serde_json::Value,
    ) -> Result<serde_json::Value, AdapterError> {
        if self.update(id, partial.clone()).await.is_ok() {
            return Ok(partial);
        }
        let mut merged = match partial.clone() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        merged.insert("id".to_string(), serde_json::Value::String(id.to_string()));
        self.create(id.table(), serde_json::Value::Object(merged)).await
    }

    async fn delete(&self, id: &RecordId) -> Result<(), AdapterError> {
        let mut tables = self.tables.lock();
        let target = id.to_string();
        if let Some(state) = tables.get_mut(id.table()) {
            state.rows.retain(|row| field_str(row, "id") != Some(target.as_str()));
        }
        Ok(())
    }

    async fn live(&self, table: &str) -> Result<Arc<dyn LiveHandle>, AdapterError> {
        let mut tables = self.tables.lock();
        let state = tables.entry(table.to_string()).or_default();
        let handle = state.live.get_or_insert_with(|| Arc::new(FakeLiveHandle::default())).clone();
        Ok(handle)
    }

    fn supports_live_queries(&self) -> bool {
        self.supports_live.load(Ordering::SeqCst)
    }
}

/// A LIVE subscription handle a test drives directly, without a real
/// push channel.
#[derive(Default)]
pub struct FakeLiveHandle {
    callback: Mutex<Option<Arc<dyn Fn(RawLiveEvent) + Send + Sync>>>,
    killed: AtomicBool,
}

impl FakeLiveHandle {
    pub fn push(&self, action: &str, value: serde_json::Value) {
        let cb = self.callback.lock().clone();
        if let Some(cb) = cb {
            cb(RawLiveEvent {
                action: action.to_string(),
                value,
            });
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LiveHandle for FakeLiveHandle {
    fn subscribe(&self, callback: Arc<dyn Fn(RawLiveEvent) + Send + Sync>) {
        *self.callback.lock() = Some(callback);
    }

    async fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

/// What the Sync Engine did to one fake host collection, in order.
#[derive(Debug)]
pub enum Event {
    Begin,
    Write(Change),
    Commit,
    MarkReady,
    Truncate,
}

#[derive(Default)]
pub struct FakeSyncContext {
    events: Mutex<Vec<Event>>,
}

impl FakeSyncContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn mark_ready_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::MarkReady))
            .count()
    }

    pub fn begin_count(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, Event::Begin)).count()
    }

    pub fn commit_count(&self) -> usize {
        self.events.lock().iter().filter(|e| matches!(e, Event::Commit)).count()
    }

    /// All `Change::Insert` rows emitted so far, across every batch.
    pub fn inserted_titles(&self) -> Vec<Option<String>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Write(Change::Insert(row)) => Some(
                    row.get("title")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                ),
                _ => None,
            })
            .collect()
    }

    pub fn updated_titles(&self) -> Vec<Option<String>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Write(Change::Update(row)) => Some(
                    row.get("title")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                ),
                _ => None,
            })
            .collect()
    }

    pub fn insert_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Write(Change::Insert(_))))
            .count()
    }

    pub fn update_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Write(Change::Update(_))))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Write(Change::Delete(_))))
            .count()
    }

    /// Waits (by spin-polling) until at least `n` batches have been
    /// committed, since LIVE events are delivered through the engine's
    /// async work queue rather than synchronously.
    pub async fn wait_for_commits(&self, n: usize) {
        for _ in 0..200 {
            if self.commit_count() >= n {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} commit(s); saw {}", self.commit_count());
    }
}

impl SyncContext for FakeSyncContext {
    fn begin(&self) {
        self.events.lock().push(Event::Begin);
    }

    fn write(&self, change: Change) {
        self.events.lock().push(Event::Write(change));
    }

    fn commit(&self) {
        self.events.lock().push(Event::Commit);
    }

    fn mark_ready(&self) {
        self.events.lock().push(Event::MarkReady);
    }

    fn truncate(&self) {
        self.events.lock().push(Event::Truncate);
    }
}

#[derive(Default)]
pub struct FakeWriteUtils {
    pub upserts: Mutex<Vec<surreal_collection_adapter::Row>>,
    pub deletes: Mutex<Vec<RecordId>>,
}

impl FakeWriteUtils {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl WriteUtils for FakeWriteUtils {
    fn upsert(&self, row: surreal_collection_adapter::Row) {
        self.upserts.lock().push(row);
    }

    fn delete(&self, id: RecordId) {
        self.deletes.lock().push(id);
    }
}
