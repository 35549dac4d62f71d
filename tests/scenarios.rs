//! End-to-end scenarios, one test per entry in `spec.md` §8's table of
//! testable properties (S1-S6), exercised through the public
//! [`Adapter`]/[`AdapterConfig`] surface plus the fakes in
//! `tests/common`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use surreal_collection_adapter::crdt::{ActorResolver, CrdtDoc, ExportMode, InMemoryDocFactory};
use surreal_collection_adapter::envelope::{encode_base_row, AesGcmProvider, CryptoProvider};
use surreal_collection_adapter::identifier::IdentityCache;
use surreal_collection_adapter::table::query::Subset;
use surreal_collection_adapter::value::Row;
use surreal_collection_adapter::{
    Adapter, AdapterConfig, CrdtConfig, CrdtProfileKind, E2eeConfig, FieldValue, SyncMode,
};

use common::{FakeDb, FakeSyncContext, FakeWriteUtils};

/// S1 - record-id normalization: every documented variant of
/// `products:1` interns to the same reference.
#[test]
fn s1_record_id_normalization() {
    let cache = IdentityCache::new();
    let variants = vec![
        FieldValue::String("products:1".to_string()),
        FieldValue::String("'products:1'".to_string()),
        FieldValue::String("products:⟨1⟩".to_string()),
        FieldValue::Object(
            [
                ("table".to_string(), FieldValue::String("products".to_string())),
                ("id".to_string(), FieldValue::String("1".to_string())),
            ]
            .into_iter()
            .collect(),
        ),
        FieldValue::Object(
            [(
                "id".to_string(),
                FieldValue::Object(
                    [
                        ("table".to_string(), FieldValue::String("products".to_string())),
                        ("id".to_string(), FieldValue::String("1".to_string())),
                    ]
                    .into_iter()
                    .collect(),
                ),
            )]
            .into_iter()
            .collect(),
        ),
    ];
    let interned: Vec<_> = variants.iter().map(|v| cache.intern(v).unwrap()).collect();
    for other in &interned[1..] {
        assert_eq!(&interned[0], other);
    }
    assert_eq!(cache.len(), 1);
}

/// S2 - eager hydration + live update.
#[tokio::test]
async fn s2_eager_hydration_and_live_update() {
    let db = FakeDb::new();
    db.seed("note", json!({"id": "note:seed-1", "title": "Seed"}));

    let config = AdapterConfig::new(db.clone(), "note");
    assert_eq!(config.sync_mode, SyncMode::Eager);
    let adapter = Adapter::new(config).unwrap();
    let cc = adapter.into_collection_config();

    let ctx = FakeSyncContext::new();
    let handle = cc.sync.sync(ctx.clone());

    ctx.wait_for_commits(1).await;
    assert_eq!(ctx.mark_ready_count(), 1);
    assert_eq!(ctx.insert_count(), 1);
    assert_eq!(ctx.inserted_titles(), vec![Some("Seed".to_string())]);

    let live = db.live_handle("note");
    live.push("CREATE", json!({"id": "note:seed-2", "title": "From Live"}));
    ctx.wait_for_commits(2).await;
    assert_eq!(ctx.insert_count(), 2);

    live.push("UPDATE", json!({"id": "note:seed-1", "title": "Seed Updated"}));
    ctx.wait_for_commits(3).await;
    assert_eq!(ctx.update_count(), 1);
    assert_eq!(ctx.updated_titles(), vec![Some("Seed Updated".to_string())]);

    (handle.cleanup)();
}

/// S3 - on-demand gating: a live event for an id outside every loaded
/// subset produces no emission; one for an id inside an active subset does.
#[tokio::test]
async fn s3_on_demand_gating() {
    let db = FakeDb::new();
    db.seed("task", json!({"id": "task:1", "title": "One"}));

    let config = AdapterConfig {
        sync_mode: SyncMode::OnDemand,
        ..AdapterConfig::new(db.clone(), "task")
    };
    let adapter = Adapter::new(config).unwrap();
    let cc = adapter.into_collection_config();

    let ctx = FakeSyncContext::new();
    let handle = cc.sync.sync(ctx.clone());
    assert_eq!(ctx.mark_ready_count(), 1);
    let on_demand = handle.on_demand.expect("on-demand mode must return loadSubset/unloadSubset");

    let loaded = (on_demand.load_subset)(Subset::default()).await.unwrap();
    assert_eq!(loaded.len(), 1);
    ctx.wait_for_commits(1).await;
    assert_eq!(ctx.insert_count(), 1);

    let live = db.live_handle("task");
    live.push("CREATE", json!({"id": "task:2", "title": "Two"}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.commit_count(), 1, "id outside every loaded subset must not be forwarded");

    live.push("UPDATE", json!({"id": "task:1", "title": "One Updated"}));
    ctx.wait_for_commits(2).await;
    assert_eq!(ctx.update_count(), 1);
    assert_eq!(ctx.updated_titles(), vec![Some("One Updated".to_string())]);

    (on_demand.unload_subset)(Subset::default());
    (handle.cleanup)();
}

/// S4 - CRDT write with AAD: `onUpdate` appends one row to the updates
/// table carrying the resolved actor and an envelope whose AAD is
/// `"<updates_table>:<doc>"`.
#[tokio::test]
async fn s4_crdt_write_with_aad() {
    let db = FakeDb::new();
    let crypto: Arc<AesGcmProvider> = Arc::new(AesGcmProvider::new("k2", &[9u8; 32]).unwrap());

    let config = AdapterConfig {
        e2ee: Some(E2eeConfig {
            enabled: true,
            crypto: Some(crypto.clone()),
            aad: None,
        }),
        crdt: Some(CrdtConfig {
            enabled: true,
            profile: CrdtProfileKind::Json,
            updates_table: "crdt_update".to_string(),
            doc_factory: Some(Arc::new(InMemoryDocFactory::new())),
            actor: Some(ActorResolver::from("device-a")),
            ..CrdtConfig::default()
        }),
        ..AdapterConfig::new(db.clone(), "doc")
    };
    let adapter = Adapter::new(config).unwrap();
    let cc = adapter.into_collection_config();

    let mut key_row = Row::new();
    key_row.insert("id".to_string(), FieldValue::String("doc:abc".to_string()));
    let key = (cc.get_key)(&key_row).expect("doc:abc canonicalizes");

    let mut modified = Row::new();
    modified.insert("title".to_string(), FieldValue::String("hello".to_string()));

    let utils = FakeWriteUtils::new();
    cc.callbacks.on_update(key, modified, utils.clone()).await.unwrap();

    let rows = db.rows("crdt_update");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["doc"], json!("doc:abc"));
    assert_eq!(rows[0]["actor"], json!("device-a"));

    let envelope: surreal_collection_adapter::envelope::Envelope =
        serde_json::from_value(rows[0].clone()).expect("row carries full envelope fields");
    crypto
        .decrypt(&envelope, b"crdt_update:doc:abc")
        .expect("the AAD used to encrypt the delta must be \"crdt_update:doc:abc\"");
}

/// S5 - CRDT live loop prevention: an incoming update row tagged with the
/// local actor is dropped; one tagged with a different actor merges and
/// emits.
#[tokio::test]
async fn s5_crdt_live_loop_prevention() {
    let db = FakeDb::new();
    let config = AdapterConfig {
        crdt: Some(CrdtConfig {
            enabled: true,
            profile: CrdtProfileKind::Json,
            updates_table: "crdt_update".to_string(),
            doc_factory: Some(Arc::new(InMemoryDocFactory::new())),
            actor: Some(ActorResolver::from("device-a")),
            ..CrdtConfig::default()
        }),
        ..AdapterConfig::new(db.clone(), "doc")
    };
    let adapter = Adapter::new(config).unwrap();
    let cc = adapter.into_collection_config();

    // The local write from S4, performed through the same engine so its
    // CRDT document and its persisted log row both exist before sync starts.
    let mut key_row = Row::new();
    key_row.insert("id".to_string(), FieldValue::String("doc:abc".to_string()));
    let key = (cc.get_key)(&key_row).expect("doc:abc canonicalizes");
    let mut modified = Row::new();
    modified.insert("title".to_string(), FieldValue::String("hello".to_string()));
    let utils = FakeWriteUtils::new();
    cc.callbacks.on_update(key, modified, utils.clone()).await.unwrap();

    let ctx = FakeSyncContext::new();
    let handle = cc.sync.sync(ctx.clone());
    // Eager hydration discovers doc:abc via the updates-log index and
    // emits its current materialized view as an insert.
    ctx.wait_for_commits(1).await;
    assert_eq!(ctx.insert_count(), 1);

    let live = db.live_handle("crdt_update");
    let now = chrono::Utc::now();

    live.push(
        "CREATE",
        json!({
            "doc": "doc:abc",
            "ts": now.to_rfc3339(),
            "actor": "device-a",
            "update_bytes": BASE64.encode(b"self-originated, never decoded"),
        }),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ctx.commit_count(), 1, "an update tagged with the local actor must be dropped");

    let remote_doc = InMemoryDocFactory::new().create();
    remote_doc.root_map().set("title", json!("hello-from-b"));
    let remote_bytes = remote_doc.export(ExportMode::Snapshot);
    live.push(
        "CREATE",
        json!({
            "doc": "doc:abc",
            "ts": (now + chrono::Duration::seconds(1)).to_rfc3339(),
            "actor": "device-b",
            "update_bytes": BASE64.encode(&remote_bytes),
        }),
    );
    ctx.wait_for_commits(2).await;
    assert_eq!(ctx.update_count(), 1);
    assert_eq!(
        ctx.updated_titles(),
        vec![Some("hello-from-b".to_string())],
        "a different actor's update must be imported and merged into the materialized view"
    );

    (handle.cleanup)();
}

/// S6 - encrypted base hydration: an AES-256-GCM envelope on a base row
/// decrypts during hydration, and a live update with a new envelope
/// decrypts the same way.
#[tokio::test]
async fn s6_encrypted_base_hydration() {
    let db = FakeDb::new();
    let crypto = AesGcmProvider::new("k-secret", &[5u8; 32]).unwrap();

    let envelope = encode_base_row(
        &crypto,
        &json!({"title": "Top Secret"}),
        "secret_note",
        "1",
        None,
    )
    .unwrap();
    db.seed(
        "secret_note",
        json!({
            "id": "secret_note:1",
            "version": envelope.version,
            "algorithm": envelope.algorithm,
            "key_id": envelope.key_id,
            "nonce": envelope.nonce,
            "ciphertext": envelope.ciphertext,
        }),
    );

    let crypto: Arc<AesGcmProvider> = Arc::new(crypto);
    let config = AdapterConfig {
        e2ee: Some(E2eeConfig {
            enabled: true,
            crypto: Some(crypto.clone()),
            aad: None,
        }),
        ..AdapterConfig::new(db.clone(), "secret_note")
    };
    let adapter = Adapter::new(config).unwrap();
    let cc = adapter.into_collection_config();

    let ctx = FakeSyncContext::new();
    let handle = cc.sync.sync(ctx.clone());
    ctx.wait_for_commits(1).await;
    assert_eq!(ctx.inserted_titles(), vec![Some("Top Secret".to_string())]);

    let updated_envelope = encode_base_row(
        crypto.as_ref(),
        &json!({"title": "Updated Secret"}),
        "secret_note",
        "1",
        None,
    )
    .unwrap();
    let live = db.live_handle("secret_note");
    live.push(
        "UPDATE",
        json!({
            "id": "secret_note:1",
            "version": updated_envelope.version,
            "algorithm": updated_envelope.algorithm,
            "key_id": updated_envelope.key_id,
            "nonce": updated_envelope.nonce,
            "ciphertext": updated_envelope.ciphertext,
        }),
    );
    ctx.wait_for_commits(2).await;
    assert_eq!(ctx.updated_titles(), vec![Some("Updated Secret".to_string())]);

    (handle.cleanup)();
}
