//! Authenticated-encryption envelopes for base rows and CRDT log entries
//! (`spec.md` §4.2).
//!
//! The cryptographic primitive itself is an injected capability
//! (`CryptoProvider`) — the crate is not a key-management system
//! (`spec.md` §1) — but the envelope *shape* and the default AAD
//! derivation are this component's job. The default provider uses
//! AES-256-GCM, grounded in the AEAD usage the broader corpus reaches
//! for when it needs real interoperable ciphertexts rather than the
//! teacher crate's bespoke ChaCha8Poly1305-over-rkyv scheme, which is
//! tied to that crate's zero-copy wire format and not to this one's
//! plain-JSON rows.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::AdapterError;

/// `kind` selects the update-log field name and AAD derivation for
/// log-row envelopes (`spec.md` §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogKind {
    Update,
    Snapshot,
}

impl LogKind {
    pub fn field_name(self) -> &'static str {
        match self {
            LogKind::Update => "update_bytes",
            LogKind::Snapshot => "snapshot_bytes",
        }
    }
}

/// The stored-record form: full field names, all compact-encoded as
/// text so every field round-trips through a remote database column of
/// string type.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    pub version: u32,
    pub algorithm: String,
    pub key_id: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// The compact in-memory label set used while an envelope is being
/// assembled or just decoded, before it's written to / read from a row.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct CompactEnvelope {
    v: u32,
    alg: String,
    kid: String,
    n: String,
    ct: String,
}

impl From<CompactEnvelope> for Envelope {
    fn from(c: CompactEnvelope) -> Self {
        Envelope {
            version: c.v,
            algorithm: c.alg,
            key_id: c.kid,
            nonce: c.n,
            ciphertext: c.ct,
        }
    }
}

impl From<Envelope> for CompactEnvelope {
    fn from(e: Envelope) -> Self {
        CompactEnvelope {
            v: e.version,
            alg: e.algorithm,
            kid: e.key_id,
            n: e.nonce,
            ct: e.ciphertext,
        }
    }
}

impl Envelope {
    /// The compact `{v, alg, kid, n, ct}` shape used when an envelope is
    /// passed around in memory (e.g. between the replication layer and
    /// the table access layer) before it's spread into a row's full
    /// field names.
    pub fn to_compact_json(&self) -> serde_json::Value {
        serde_json::to_value(CompactEnvelope::from(self.clone()))
            .expect("envelope fields are always representable as JSON")
    }

    pub fn from_compact_json(value: serde_json::Value) -> Result<Self, AdapterError> {
        serde_json::from_value::<CompactEnvelope>(value)
            .map(Envelope::from)
            .map_err(|e| AdapterError::Crypto(format!("bad compact envelope: {e}")))
    }
}

/// The injected cryptographic capability. `spec.md` §1 treats the actual
/// primitive as an external collaborator; this crate only defines the
/// contract and a usable default.
pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Envelope, AdapterError>;
    fn decrypt(&self, envelope: &Envelope, aad: &[u8]) -> Result<Vec<u8>, AdapterError>;
}

/// AES-256-GCM with a random 12-byte nonce, `version = 1`. Unknown
/// `algorithm` on decrypt fails loudly rather than silently falling back.
pub struct AesGcmProvider {
    key_id: String,
    key: Vec<u8>,
}

impl AesGcmProvider {
    pub const ALGORITHM: &'static str = "AES-256-GCM";

    /// `key` must be exactly 32 bytes.
    pub fn new(key_id: impl Into<String>, key: &[u8]) -> Result<Self, AdapterError> {
        if key.len() != 32 {
            return Err(AdapterError::Config(format!(
                "AES-256-GCM key must be 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            key_id: key_id.into(),
            key: key.to_vec(),
        })
    }

    fn nonce() -> Result<[u8; 12], AdapterError> {
        let mut n = [0u8; 12];
        getrandom::getrandom(&mut n)
            .map_err(|e| AdapterError::Crypto(format!("nonce generation failed: {e}")))?;
        Ok(n)
    }
}

impl CryptoProvider for AesGcmProvider {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Envelope, AdapterError> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AdapterError::Crypto(format!("bad key: {e}")))?;
        let nonce_bytes = Self::nonce()?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = cipher
            .encrypt(nonce, payload)
            .map_err(|e| AdapterError::Crypto(format!("encrypt failed: {e}")))?;
        Ok(Envelope {
            version: 1,
            algorithm: Self::ALGORITHM.to_string(),
            key_id: self.key_id.clone(),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn decrypt(&self, envelope: &Envelope, aad: &[u8]) -> Result<Vec<u8>, AdapterError> {
        if envelope.algorithm != Self::ALGORITHM {
            return Err(AdapterError::Crypto(format!(
                "unsupported algorithm {:?}",
                envelope.algorithm
            )));
        }
        let nonce_bytes = BASE64
            .decode(&envelope.nonce)
            .map_err(|e| AdapterError::Crypto(format!("bad nonce encoding: {e}")))?;
        if nonce_bytes.len() != 12 {
            return Err(AdapterError::Crypto("nonce must be 12 bytes".into()));
        }
        let ciphertext = BASE64
            .decode(&envelope.ciphertext)
            .map_err(|e| AdapterError::Crypto(format!("bad ciphertext encoding: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| AdapterError::Crypto(format!("bad key: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: &ciphertext,
            aad,
        };
        cipher
            .decrypt(nonce, payload)
            .map_err(|e| AdapterError::Crypto(format!("decrypt failed: {e}")))
    }
}

/// Default AAD for a base-table record: `"<base_table>:<record_key>"`.
pub fn base_aad(base_table: &str, record_key: &str) -> Vec<u8> {
    format!("{base_table}:{record_key}").into_bytes()
}

/// Default AAD for an update/snapshot log row:
/// `"<log_table>:<base_table>:<doc_key>"`.
pub fn log_aad(log_table: &str, base_table: &str, doc_key: &str) -> Vec<u8> {
    format!("{log_table}:{base_table}:{doc_key}").into_bytes()
}

/// A caller-supplied override for AAD derivation. Losing agreement on
/// AAD between encrypt and decrypt is, by AEAD construction, a
/// decryption failure — there is no separate "wrong AAD" error kind.
pub type AadOverride = dyn Fn(&str, &str) -> Vec<u8> + Send + Sync;

/// Encrypts a JSON payload and returns it merged with `{id}` stripped —
/// i.e. the envelope fields alone, ready to be merged into a base-table
/// row alongside the plain `id` column.
pub fn encode_base_row(
    crypto: &dyn CryptoProvider,
    payload: &serde_json::Value,
    base_table: &str,
    record_key: &str,
    aad_override: Option<&AadOverride>,
) -> Result<Envelope, AdapterError> {
    let aad = match aad_override {
        Some(f) => f(base_table, record_key),
        None => base_aad(base_table, record_key),
    };
    let plaintext = serde_json::to_vec(payload)
        .map_err(|e| AdapterError::Crypto(format!("payload serialization failed: {e}")))?;
    crypto.encrypt(&plaintext, &aad)
}

/// Decrypts a base-table row's envelope fields back into a JSON payload,
/// to be merged with `{id}` taken from the record itself (per
/// `spec.md` §4.2, the envelope never carries `id`).
pub fn decode_base_row(
    crypto: &dyn CryptoProvider,
    envelope: &Envelope,
    base_table: &str,
    record_key: &str,
    aad_override: Option<&AadOverride>,
) -> Result<serde_json::Value, AdapterError> {
    let aad = match aad_override {
        Some(f) => f(base_table, record_key),
        None => base_aad(base_table, record_key),
    };
    let plaintext = crypto.decrypt(envelope, &aad)?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| AdapterError::Crypto(format!("payload deserialization failed: {e}")))
}

/// Encrypts update/snapshot bytes for an update-log row.
pub fn encode_update(
    crypto: &dyn CryptoProvider,
    bytes: &[u8],
    log_table: &str,
    base_table: &str,
    doc_key: &str,
    aad_override: Option<&AadOverride>,
) -> Result<Envelope, AdapterError> {
    let aad = match aad_override {
        Some(f) => f(base_table, doc_key),
        None => log_aad(log_table, base_table, doc_key),
    };
    crypto.encrypt(bytes, &aad)
}

/// Decrypts an update/snapshot log row back into raw update bytes.
pub fn decode_update(
    crypto: &dyn CryptoProvider,
    envelope: &Envelope,
    log_table: &str,
    base_table: &str,
    doc_key: &str,
    aad_override: Option<&AadOverride>,
) -> Result<Vec<u8>, AdapterError> {
    let aad = match aad_override {
        Some(f) => f(base_table, doc_key),
        None => log_aad(log_table, base_table, doc_key),
    };
    crypto.decrypt(envelope, &aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AesGcmProvider {
        AesGcmProvider::new("k2", &[7u8; 32]).unwrap()
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips() {
        let p = provider();
        let aad = base_aad("secret_note", "1");
        let envelope = p.encrypt(b"hello world", &aad).unwrap();
        let out = p.decrypt(&envelope, &aad).unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn aad_mismatch_fails_decrypt() {
        let p = provider();
        let envelope = p.encrypt(b"hello", &base_aad("a", "1")).unwrap();
        assert!(p.decrypt(&envelope, &base_aad("a", "2")).is_err());
    }

    #[test]
    fn key_mismatch_fails_decrypt() {
        let p1 = AesGcmProvider::new("k1", &[1u8; 32]).unwrap();
        let p2 = AesGcmProvider::new("k1", &[2u8; 32]).unwrap();
        let aad = base_aad("a", "1");
        let envelope = p1.encrypt(b"hello", &aad).unwrap();
        assert!(p2.decrypt(&envelope, &aad).is_err());
    }

    #[test]
    fn unknown_algorithm_fails_loudly() {
        let p = provider();
        let mut envelope = p.encrypt(b"hello", &base_aad("a", "1")).unwrap();
        envelope.algorithm = "ROT13".to_string();
        assert!(p.decrypt(&envelope, &base_aad("a", "1")).is_err());
    }

    #[test]
    fn base_and_log_aad_derivation_matches_spec() {
        assert_eq!(base_aad("secret_note", "1"), b"secret_note:1".to_vec());
        assert_eq!(
            log_aad("crdt_update", "doc", "abc"),
            b"crdt_update:doc:abc".to_vec()
        );
    }

    #[test]
    fn base_row_roundtrip() {
        let p = provider();
        let payload = serde_json::json!({"title": "Top Secret"});
        let envelope = encode_base_row(&p, &payload, "secret_note", "1", None).unwrap();
        let decoded = decode_base_row(&p, &envelope, "secret_note", "1", None).unwrap();
        assert_eq!(decoded, payload);
    }
}
