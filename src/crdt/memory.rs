//! A reference [`CrdtDoc`] implementation good enough to drive this
//! crate's own test suite and to serve as an embedding template. Real
//! deployments plug in an actual CRDT engine; this one tracks an
//! append-only op log per document and applies later-write-wins
//! locally, which is sufficient for the single-writer property tests in
//! this crate but is not itself a merge algorithm — that is the
//! external engine's responsibility per `spec.md` §1.

use super::{CrdtDoc, CrdtMap, CrdtText, DocFactory, ExportMode, Version};
use crate::error::AdapterError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Serialize, Deserialize)]
enum Op {
    MapSet {
        key: String,
        value: serde_json::Value,
    },
    TextUpdate {
        name: String,
        text: String,
    },
}

#[derive(Serialize, Deserialize)]
enum ExportedPayload {
    Ops(Vec<Op>),
    FullState {
        map: serde_json::Map<String, serde_json::Value>,
        texts: HashMap<String, String>,
    },
}

struct Inner {
    map: serde_json::Map<String, serde_json::Value>,
    texts: HashMap<String, String>,
    ops: Vec<Op>,
}

/// A single in-process document instance.
pub struct InMemoryCrdtDoc {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryCrdtDoc {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                map: serde_json::Map::new(),
                texts: HashMap::new(),
                ops: Vec::new(),
            })),
        }
    }
}

fn version_offset(v: &Version) -> usize {
    if v.0.len() >= 8 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&v.0[..8]);
        usize::from_le_bytes(buf)
    } else {
        0
    }
}

struct MapHandle(Arc<Mutex<Inner>>);

impl CrdtMap for MapHandle {
    fn set(&self, key: &str, value: serde_json::Value) {
        let mut inner = self.0.lock();
        inner.map.insert(key.to_string(), value.clone());
        inner.ops.push(Op::MapSet {
            key: key.to_string(),
            value,
        });
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.0.lock().map.get(key).cloned()
    }

    fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.0.lock().map.clone()
    }
}

struct TextHandle {
    inner: Arc<Mutex<Inner>>,
    name: String,
}

impl CrdtText for TextHandle {
    fn update(&self, text: &str) {
        let mut inner = self.inner.lock();
        inner.texts.insert(self.name.clone(), text.to_string());
        inner.ops.push(Op::TextUpdate {
            name: self.name.clone(),
            text: text.to_string(),
        });
    }

    fn get(&self) -> String {
        self.inner
            .lock()
            .texts
            .get(&self.name)
            .cloned()
            .unwrap_or_default()
    }
}

impl CrdtDoc for InMemoryCrdtDoc {
    fn root_map(&self) -> Arc<dyn CrdtMap> {
        Arc::new(MapHandle(self.inner.clone()))
    }

    fn text(&self, name: &str) -> Arc<dyn CrdtText> {
        Arc::new(TextHandle {
            inner: self.inner.clone(),
            name: name.to_string(),
        })
    }

    fn oplog_version(&self) -> Version {
        Version(self.inner.lock().ops.len().to_le_bytes().to_vec())
    }

    fn export(&self, mode: ExportMode) -> Vec<u8> {
        let inner = self.inner.lock();
        let payload = match mode {
            ExportMode::Snapshot => ExportedPayload::FullState {
                map: inner.map.clone(),
                texts: inner.texts.clone(),
            },
            ExportMode::Update { from } => {
                let offset = version_offset(&from).min(inner.ops.len());
                ExportedPayload::Ops(inner.ops[offset..].to_vec())
            }
        };
        serde_json::to_vec(&payload).unwrap_or_default()
    }

    fn import(&self, bytes: &[u8]) -> Result<(), AdapterError> {
        let payload: ExportedPayload = serde_json::from_slice(bytes)
            .map_err(|e| AdapterError::Crypto(format!("malformed crdt payload: {e}")))?;
        let mut inner = self.inner.lock();
        match payload {
            ExportedPayload::FullState { map, texts } => {
                inner.map = map;
                inner.texts = texts;
                inner.ops.clear();
            }
            ExportedPayload::Ops(ops) => {
                for op in ops {
                    match &op {
                        Op::MapSet { key, value } => {
                            inner.map.insert(key.clone(), value.clone());
                        }
                        Op::TextUpdate { name, text } => {
                            inner.texts.insert(name.clone(), text.clone());
                        }
                    }
                    inner.ops.push(op);
                }
            }
        }
        Ok(())
    }
}

/// Creates fresh [`InMemoryCrdtDoc`]s.
#[derive(Default)]
pub struct InMemoryDocFactory;

impl InMemoryDocFactory {
    pub fn new() -> Self {
        Self
    }
}

impl DocFactory for InMemoryDocFactory {
    fn create(&self) -> Arc<dyn CrdtDoc> {
        Arc::new(InMemoryCrdtDoc::new())
    }
}
