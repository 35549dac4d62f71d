//! Crate-wide error type.
//!
//! `spec.md` §7 names five error kinds with distinct propagation rules:
//! translation errors are fatal before any query is issued, remote and
//! crypto errors are reported through `onError` without tearing sync down,
//! protocol errors just mean no live stream, and contract errors are
//! logged and close the offending LIVE handle. `Config` is this crate's
//! own addition for facade construction-time validation (SPEC_FULL.md §4.7).

use std::fmt;

/// Everything that can go wrong in this crate, tagged by the kind of
/// failure so callers (and `onError` sinks) can decide how to react.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// A subset's where-expression used an unsupported operator or shape,
    /// or a right-hand side referenced a reactive field. Raised before any
    /// query is sent.
    #[error("query translation failed: {0}")]
    Translation(String),

    /// The remote database rejected a query or the connection failed.
    /// Non-fatal: sync continues, and the live stream keeps running where
    /// possible.
    #[error("remote database error: {0}")]
    Remote(#[source] anyhow::Error),

    /// AEAD encryption or decryption failed: algorithm mismatch, AAD
    /// mismatch, or tampered ciphertext. The affected row is skipped, not
    /// substituted with plaintext.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The remote database does not support LIVE queries. `markReady` is
    /// still called; mutation callbacks keep working without a live
    /// stream.
    #[error("live queries unsupported: {0}")]
    Protocol(String),

    /// A LIVE event arrived in an unrecognized shape (unknown action,
    /// missing fields). Logged and ignored; the handle itself is only
    /// closed on an explicit `KILLED` action.
    #[error("malformed live event: {0}")]
    Contract(String),

    /// The adapter configuration is internally inconsistent (e.g. CRDT
    /// mode enabled without an updates table, or E2EE enabled without a
    /// crypto provider). Raised from `Adapter::new`, before any I/O.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AdapterError {
    /// Short, stable tag for the error kind, useful for metrics/log fields
    /// without matching on the full enum.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Translation(_) => "translation",
            AdapterError::Remote(_) => "remote",
            AdapterError::Crypto(_) => "crypto",
            AdapterError::Protocol(_) => "protocol",
            AdapterError::Contract(_) => "contract",
            AdapterError::Config(_) => "config",
        }
    }
}

/// A sink the host can install to observe errors that do not abort sync.
/// Modeled as a trait object rather than a bare closure so it can be
/// cloned across the sync engine's work queue tasks.
pub trait ErrorSink: Send + Sync {
    /// Called once per surfaced error. Must not panic or block for long;
    /// the engine calls this inline on its work queue.
    fn on_error(&self, err: &AdapterError);
}

impl<F> ErrorSink for F
where
    F: Fn(&AdapterError) + Send + Sync,
{
    fn on_error(&self, err: &AdapterError) {
        (self)(err)
    }
}

/// No-op sink used when the host does not configure `onError`. Errors are
/// still logged via `tracing`.
pub struct SilentErrorSink;

impl ErrorSink for SilentErrorSink {
    fn on_error(&self, err: &AdapterError) {
        tracing::warn!(kind = err.kind(), error = %err, "unhandled adapter error");
    }
}

impl fmt::Debug for dyn ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ErrorSink")
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
