// src/lib.rs

//! revtree
//!
//! An embedded, document-oriented datastore with MVCC revision trees,
//! content-addressed attachments, secondary indexing, and
//! CouchDB-protocol-v3-compatible peer replication.
//!
//! # Architecture
//!
//! - `kvp`: single-file SQLite persistence behind a serialized mutex.
//! - `revision`: the document/revision forest: insert, update, delete,
//!   conflict detection, grafting, compaction.
//! - `blob`: content-addressed attachment storage with optional
//!   AES-256-GCM at-rest encryption.
//! - `attachments`: bridges `_attachments` JSON to the blob store.
//! - `changes`: the append-only change feed.
//! - `query`: secondary indexes and selector-based query planning.
//! - `conflict`: conflict discovery and atomic resolution.
//! - `replication`: Pull/Push state machines over an HTTP peer protocol.
//! - `store`: the `Datastore` facade wiring all of the above together.

pub mod attachments;
pub mod blob;
pub mod changes;
pub mod config;
mod conflict;
mod error;
pub mod kvp;
pub mod query;
pub mod replication;
pub mod revision;
pub mod store;

pub use conflict::ConflictResolver;
pub use error::{Error, Result};
pub use store::Datastore;
