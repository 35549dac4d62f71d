//! Adapter Facade (`spec.md` §4.7): the crate's public entry point.
//!
//! Composes the Identifier Module, Envelope Codec, CRDT Replication
//! Layer, Table Access, Subset Cache, and Sync Engine from one
//! [`AdapterConfig`], validates the configuration up front (fail fast,
//! before any I/O, the same posture `spec.md` §7 specifies for
//! translation errors), and hands back a [`host::CollectionConfig`]
//! shaped exactly like the host runtime's collection-config contract.

use std::sync::Arc;

use crate::crdt::{
    ActorResolver, CrdtReplicationConfig, DocFactory, JsonProfile, Profile, ReplicationLayer,
    RichTextProfile,
};
use crate::engine::{self, SyncEngine, SyncEngineConfig};
use crate::envelope::{AadOverride, CryptoProvider};
use crate::error::{AdapterError, ErrorSink, SilentErrorSink};
use crate::host::{CollectionConfig, RowSchema, SyncMode};
use crate::identifier::{self, IdentityCache};
use crate::subset_cache::SubsetCache;
use crate::table::access::{TableAccess, TableRef};
use crate::table::remote::RemoteDatabase;
use crate::value::{FieldValue, Row};

/// End-to-end encryption configuration (`spec.md` §4.7, §6's table).
pub struct E2eeConfig {
    pub enabled: bool,
    /// Required when `enabled` is `true`; validated at [`Adapter::new`].
    pub crypto: Option<Arc<dyn CryptoProvider>>,
    /// Overrides the default AAD derivation (`spec.md` §4.2).
    pub aad: Option<Arc<AadOverride>>,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            crypto: None,
            aad: None,
        }
    }
}

/// Selects which materialize/applyLocalChange pair a CRDT document uses
/// (`spec.md` §3's two profiles).
pub enum CrdtProfileKind {
    Json,
    RichText { text_field: Option<String> },
}

impl CrdtProfileKind {
    fn build(&self) -> Arc<dyn Profile> {
        match self {
            CrdtProfileKind::Json => Arc::new(JsonProfile),
            CrdtProfileKind::RichText { text_field } => Arc::new(match text_field {
                Some(field) => RichTextProfile {
                    text_field: field.clone(),
                },
                None => RichTextProfile::default(),
            }),
        }
    }
}

/// CRDT replication configuration (`spec.md` §4.7, §6's table).
pub struct CrdtConfig {
    pub enabled: bool,
    pub profile: CrdtProfileKind,
    /// Required when `enabled` is `true`.
    pub updates_table: String,
    pub snapshot_table: Option<String>,
    /// Required when `enabled` is `true`: constructs the per-id document
    /// instances (`spec.md` §4.3's `getDoc`). An embedder supplies one
    /// backed by a real CRDT engine; [`crate::crdt::InMemoryDocFactory`]
    /// is a usable default for tests.
    pub doc_factory: Option<Arc<dyn DocFactory>>,
    pub persist_materialized_view: bool,
    /// Required when `enabled` is `true`: resolves the local actor
    /// identity for loop prevention (`spec.md` §4.3).
    pub actor: Option<ActorResolver>,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            profile: CrdtProfileKind::Json,
            updates_table: String::new(),
            snapshot_table: None,
            doc_factory: None,
            persist_materialized_view: false,
            actor: None,
        }
    }
}

/// The full configuration surface (`spec.md` §6's table, §4.7).
pub struct AdapterConfig {
    pub db: Arc<dyn RemoteDatabase>,
    pub table: TableRef,
    /// An opaque cache-key scope passed through to the host runtime
    /// (`spec.md` §4.7). This crate does not interpret it.
    pub query_key: Vec<serde_json::Value>,
    pub sync_mode: SyncMode,
    pub e2ee: Option<E2eeConfig>,
    pub crdt: Option<CrdtConfig>,
    pub on_error: Option<Arc<dyn ErrorSink>>,
}

impl AdapterConfig {
    /// A minimal config: no E2EE, no CRDT, eager sync.
    pub fn new(db: Arc<dyn RemoteDatabase>, table: impl Into<String>) -> Self {
        Self {
            db,
            table: TableRef::new(table),
            query_key: Vec::new(),
            sync_mode: SyncMode::Eager,
            e2ee: None,
            crdt: None,
            on_error: None,
        }
    }
}

/// Validates insert inputs (`spec.md` §4.7): rejects non-objects,
/// generates a sentinel temporary id when absent, and deep-normalizes
/// record-id-shaped fields so they intern through the same pool the
/// Sync Engine uses.
struct DefaultRowSchema {
    table: String,
    identity: Arc<IdentityCache>,
}

impl RowSchema for DefaultRowSchema {
    fn validate_insert(&self, value: serde_json::Value) -> Result<Row, AdapterError> {
        let map = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(AdapterError::Contract(format!(
                    "insert payload must be an object, got {other:?}"
                )))
            }
        };
        let mut row: Row = map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::from_json(&v)))
            .collect();
        if !row.contains_key("id") {
            let temp = identifier::temporary_id(&self.table);
            row.insert("id".to_string(), FieldValue::String(temp));
        }
        for (_, v) in row.iter_mut() {
            self.identity.normalize_deep(v);
        }
        Ok(row)
    }
}

/// The composed adapter for one collection instance. Holds the
/// [`IdentityCache`] and [`SyncEngine`] this collection's sync, schema,
/// and mutation callbacks all share.
pub struct Adapter {
    engine: Arc<SyncEngine>,
    collection_config: CollectionConfig,
}

impl Adapter {
    /// Validates `config` and composes the components. Returns
    /// `AdapterError::Config` before any I/O if the configuration is
    /// internally inconsistent (`spec.md` §4.7).
    pub fn new(config: AdapterConfig) -> Result<Self, AdapterError> {
        let e2ee = config.e2ee.unwrap_or_default();
        if e2ee.enabled && e2ee.crypto.is_none() {
            return Err(AdapterError::Config(
                "e2ee.enabled is true but no crypto provider was supplied".into(),
            ));
        }

        let crdt_cfg = config.crdt.unwrap_or_default();
        if crdt_cfg.enabled {
            if crdt_cfg.updates_table.is_empty() {
                return Err(AdapterError::Config(
                    "crdt.enabled is true but crdt.updates_table is empty".into(),
                ));
            }
            if crdt_cfg.doc_factory.is_none() {
                return Err(AdapterError::Config(
                    "crdt.enabled is true but no doc_factory was supplied".into(),
                ));
            }
            if crdt_cfg.actor.is_none() {
                return Err(AdapterError::Config(
                    "crdt.enabled is true but no actor resolver was supplied".into(),
                ));
            }
        }

        let identity = Arc::new(IdentityCache::new());
        let subset_cache = Arc::new(SubsetCache::new());
        let error_sink = config.on_error.unwrap_or_else(|| Arc::new(SilentErrorSink));

        let sync_field_mode = crdt_cfg.enabled;
        let table = Arc::new(TableAccess::new(
            config.db.clone(),
            config.table.clone(),
            sync_field_mode,
        ));

        let (crdt_table, crdt) = if crdt_cfg.enabled {
            let snapshot_table = crdt_cfg
                .snapshot_table
                .clone()
                .unwrap_or_else(|| crdt_cfg.updates_table.clone());
            let crdt_table = Arc::new(TableAccess::new(
                config.db.clone(),
                TableRef::new(crdt_cfg.updates_table.clone()),
                false,
            ));
            let log_store = engine::make_remote_update_log_store(
                config.db.clone(),
                crdt_cfg.updates_table.clone(),
                snapshot_table.clone(),
                identity.clone(),
            );
            let replication_config = CrdtReplicationConfig {
                base_table: config.table.name.clone(),
                updates_table: crdt_cfg.updates_table.clone(),
                snapshot_table: Some(snapshot_table),
                crypto: e2ee.enabled.then(|| e2ee.crypto.clone().unwrap()),
                aad_override: e2ee.aad.clone(),
            };
            let replication = Arc::new(ReplicationLayer::new(
                crdt_cfg.doc_factory.clone().unwrap(),
                crdt_cfg.profile.build(),
                crdt_cfg.actor.clone().unwrap(),
                log_store,
                replication_config,
            ));
            (Some(crdt_table), Some(replication))
        } else {
            (None, None)
        };

        let base_crypto = (e2ee.enabled && !crdt_cfg.enabled).then(|| e2ee.crypto.clone().unwrap());

        let engine_config = SyncEngineConfig {
            table: table.clone(),
            crdt_table,
            crdt,
            persist_materialized: crdt_cfg.persist_materialized_view,
            crypto: base_crypto,
            aad_override: e2ee.aad.clone(),
            base_table: config.table.name.clone(),
            identity: identity.clone(),
            subset_cache,
            sync_mode: config.sync_mode,
            sync_field_mode,
            error_sink,
        };
        let engine = SyncEngine::new(engine_config);

        let get_key_identity = identity.clone();
        let get_key = Arc::new(move |row: &Row| {
            row.get("id")
                .cloned()
                .and_then(|v| get_key_identity.intern(&v))
        });

        let schema = Arc::new(DefaultRowSchema {
            table: config.table.name.clone(),
            identity: identity.clone(),
        });

        let sync_entry: Arc<dyn crate::host::SyncEntryPoint> = Arc::new(engine.clone());
        let callbacks: Arc<dyn crate::host::MutationCallbacks> = engine.clone();

        let collection_config = CollectionConfig {
            id: None,
            get_key,
            schema,
            sync: sync_entry,
            callbacks,
            query_key: config.query_key,
            sync_mode: config.sync_mode,
        };

        Ok(Self {
            engine,
            collection_config,
        })
    }

    /// Consumes the adapter, returning the host-runtime collection
    /// config (`spec.md` §6's `{id?, getKey, schema, sync, onInsert,
    /// onUpdate, onDelete, queryKey, queryClient, syncMode}`).
    pub fn into_collection_config(self) -> CollectionConfig {
        self.collection_config
    }

    /// The underlying sync engine, exposed for embedders that want to
    /// observe [`crate::engine::SyncState`] directly (e.g. in tests).
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}
