//! Replication plumbing around an external CRDT engine: lazy per-id
//! documents, the update-log append/hydrate cycle, and actor-based loop
//! prevention (`spec.md` §4.3).
//!
//! Persisting an update row is "append a record to a table" — the same
//! capability Table Access exposes for base rows — so this layer talks
//! to the log through its own narrow [`UpdateLogStore`] trait rather than
//! depending on the table module directly; the Sync Engine wires a real
//! implementation (backed by `RemoteDatabase`) in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::{ActorResolver, CrdtDoc, DocFactory, ExportMode, Profile, Version};
use crate::change::Change;
use crate::envelope::{decode_update, encode_update, AadOverride, CryptoProvider, Envelope};
use crate::error::AdapterError;
use crate::identifier::RecordId;
use crate::value::Row;

/// Either plain update/snapshot bytes or an E2EE envelope, matching
/// `spec.md` §3's "`(update_bytes | snapshot_bytes) OR envelope fields`".
#[derive(Clone, Debug)]
pub enum LogPayload {
    Plain(Vec<u8>),
    Encrypted(Envelope),
}

/// One row of the updates or snapshots table.
#[derive(Clone, Debug)]
pub struct UpdateLogEntry {
    pub doc: RecordId,
    pub ts: DateTime<Utc>,
    pub actor: Option<String>,
    pub payload: LogPayload,
}

/// The update-log persistence capability. A real embedding backs this
/// with `RemoteDatabase` queries against the configured updates/snapshots
/// tables; this crate ships no default implementation since there is no
/// remote database to talk to in isolation.
#[async_trait]
pub trait UpdateLogStore: Send + Sync {
    async fn append_update(&self, entry: UpdateLogEntry) -> Result<(), AdapterError>;
    async fn append_snapshot(&self, entry: UpdateLogEntry) -> Result<(), AdapterError>;
    async fn latest_snapshot(&self, doc: &RecordId) -> Result<Option<UpdateLogEntry>, AdapterError>;
    /// All update rows for `doc` with `ts > since` (or all of them when
    /// `since` is `None`), in any order — `hydrate` sorts.
    async fn updates_since(
        &self,
        doc: &RecordId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<UpdateLogEntry>, AdapterError>;

    /// Distinct `doc` ids with at least one row in the log — the "index
    /// query on the updates table" `spec.md` §4.6 calls for to discover
    /// which documents exist during eager CRDT hydration.
    async fn known_docs(&self) -> Result<Vec<RecordId>, AdapterError>;
}

enum LogKind {
    Update,
    Snapshot,
}

/// The static configuration a replication layer needs: table names for
/// AAD derivation, and the optional crypto capability.
pub struct CrdtReplicationConfig {
    pub base_table: String,
    pub updates_table: String,
    pub snapshot_table: Option<String>,
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    pub aad_override: Option<Arc<AadOverride>>,
}

impl CrdtReplicationConfig {
    fn log_table(&self, kind: &LogKind) -> &str {
        match kind {
            LogKind::Update => &self.updates_table,
            LogKind::Snapshot => self.snapshot_table.as_deref().unwrap_or(&self.updates_table),
        }
    }
}

pub struct ReplicationLayer {
    factory: Arc<dyn DocFactory>,
    profile: Arc<dyn Profile>,
    actor: ActorResolver,
    store: Arc<dyn UpdateLogStore>,
    config: CrdtReplicationConfig,
    docs: Mutex<HashMap<RecordId, Arc<dyn CrdtDoc>>>,
}

impl ReplicationLayer {
    pub fn new(
        factory: Arc<dyn DocFactory>,
        profile: Arc<dyn Profile>,
        actor: ActorResolver,
        store: Arc<dyn UpdateLogStore>,
        config: CrdtReplicationConfig,
    ) -> Self {
        Self {
            factory,
            profile,
            actor,
            store,
            config,
            docs: Mutex::new(HashMap::new()),
        }
    }

    /// `getDoc(id)`: lazy creation, one document per id for this
    /// layer's lifetime.
    pub fn get_doc(&self, id: &RecordId) -> Arc<dyn CrdtDoc> {
        let mut docs = self.docs.lock();
        docs.entry(id.clone())
            .or_insert_with(|| self.factory.create())
            .clone()
    }

    fn decode_entry(&self, entry: &UpdateLogEntry, kind: LogKind) -> Result<Vec<u8>, AdapterError> {
        match &entry.payload {
            LogPayload::Plain(bytes) => Ok(bytes.clone()),
            LogPayload::Encrypted(envelope) => {
                let crypto = self.config.crypto.as_ref().ok_or_else(|| {
                    AdapterError::Crypto(
                        "encrypted update row but no crypto provider configured".into(),
                    )
                })?;
                decode_update(
                    crypto.as_ref(),
                    envelope,
                    self.config.log_table(&kind),
                    &self.config.base_table,
                    entry.doc.key(),
                    self.config.aad_override.as_deref(),
                )
            }
        }
    }

    /// `hydrate(id)`: newest snapshot first (if any), then every update
    /// with `ts` after it in ascending order, imported in sequence.
    pub async fn hydrate(&self, id: &RecordId) -> Result<(), AdapterError> {
        let doc = self.get_doc(id);
        let since = match self.store.latest_snapshot(id).await? {
            Some(snapshot) => {
                let bytes = self.decode_entry(&snapshot, LogKind::Snapshot)?;
                doc.import(&bytes)?;
                Some(snapshot.ts)
            }
            None => None,
        };
        let mut updates = self.store.updates_since(id, since).await?;
        updates.sort_by_key(|e| e.ts);
        for update in &updates {
            let bytes = self.decode_entry(update, LogKind::Update)?;
            doc.import(&bytes)?;
        }
        Ok(())
    }

    /// `applyLocalChange(doc, change)`: returns the version captured
    /// *before* the change, so the caller can `exportSinceVersion` the
    /// delta that resulted from just this change.
    pub fn apply_local_change(&self, id: &RecordId, change: &Change) -> Result<Version, AdapterError> {
        let doc = self.get_doc(id);
        let before = doc.oplog_version();
        self.profile.apply_local_change(&*doc, change)?;
        Ok(before)
    }

    /// `exportSinceVersion(doc, vv)`.
    pub fn export_since(&self, id: &RecordId, from: Version) -> Vec<u8> {
        self.get_doc(id).export(ExportMode::Update { from })
    }

    /// `persistUpdate(id, bytes, change)`. Resolves the actor, encrypts
    /// when a crypto provider is configured, and appends the row with
    /// the current wall-clock timestamp.
    pub async fn persist_update(
        &self,
        id: &RecordId,
        bytes: &[u8],
        change: &Change,
    ) -> Result<(), AdapterError> {
        let actor = self.actor.resolve(id, change);
        let payload = match &self.config.crypto {
            Some(crypto) => {
                let envelope = encode_update(
                    crypto.as_ref(),
                    bytes,
                    &self.config.updates_table,
                    &self.config.base_table,
                    id.key(),
                    self.config.aad_override.as_deref(),
                )?;
                LogPayload::Encrypted(envelope)
            }
            None => LogPayload::Plain(bytes.to_vec()),
        };
        self.store
            .append_update(UpdateLogEntry {
                doc: id.clone(),
                ts: Utc::now(),
                actor: Some(actor),
                payload,
            })
            .await
    }

    /// `materializedView(id)`.
    pub fn materialized_view(&self, id: &RecordId) -> Row {
        self.profile.materialize(&*self.get_doc(id), id)
    }

    /// Distinct known document ids, for eager hydration's discovery pass.
    pub async fn known_docs(&self) -> Result<Vec<RecordId>, AdapterError> {
        self.store.known_docs().await
    }

    /// Decodes an incoming update-log row's payload (plain bytes, or
    /// decrypts an E2EE envelope) without importing it, so a caller can
    /// check `is_own_actor` first (`spec.md` §4.3's loop prevention).
    pub fn decode_incoming_update(&self, entry: &UpdateLogEntry) -> Result<Vec<u8>, AdapterError> {
        self.decode_entry(entry, LogKind::Update)
    }

    /// Imports already-decoded update bytes into `id`'s document.
    pub fn import_remote_update(&self, id: &RecordId, bytes: &[u8]) -> Result<(), AdapterError> {
        self.get_doc(id).import(bytes)
    }

    /// Whether an incoming update row's `actor` matches the local actor
    /// this layer would resolve for `id` — the loop-prevention check.
    /// The resolver's `Change` parameter exists for writes this layer
    /// itself produces; an incoming row carries no such change, so a
    /// neutral placeholder is used. Dynamic resolvers that branch on
    /// change content rather than id should not be used with the
    /// non-static `ActorResolver` variant for ids under CRDT sync.
    pub fn is_own_actor(&self, id: &RecordId, incoming_actor: Option<&str>) -> bool {
        let local = self
            .actor
            .resolve(id, &Change::Update(Row::new()));
        incoming_actor == Some(local.as_str())
    }
}
