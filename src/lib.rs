//! A local-first synchronization adapter bridging a document-graph
//! database's LIVE-query channel to an in-process reactive collection
//! runtime.
//!
//! The crate hydrates a remote table into a host-owned collection, keeps
//! it current via a push subscription, mirrors local mutations back to
//! the remote, and optionally layers CRDT document replication and
//! end-to-end encryption on top. The host runtime, the remote database
//! client, the CRDT engine, and the cryptographic primitive are all
//! external collaborators, modeled here as traits ([`host::SyncContext`],
//! [`table::RemoteDatabase`], [`crdt::CrdtDoc`], [`envelope::CryptoProvider`]).
//!
//! Module layout mirrors the component list: leaves first ([`identifier`],
//! [`envelope`]), then the replication and access layers ([`crdt`],
//! [`table`], [`subset_cache`]), then the orchestrator ([`engine`]) and
//! the public entry point ([`adapter`]).

pub mod adapter;
pub mod change;
pub mod crdt;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod host;
pub mod identifier;
pub mod subset_cache;
pub mod table;
pub mod value;

pub use adapter::{Adapter, AdapterConfig, CrdtConfig, CrdtProfileKind, E2eeConfig};
pub use change::Change;
pub use error::{AdapterError, ErrorSink};
pub use host::SyncMode;
pub use identifier::RecordId;
pub use value::{FieldValue, Row};
