// src/error.rs

use thiserror::Error;

/// Core error taxonomy for revtree.
///
/// `NotFound` and `Conflict` are non-fatal MVCC
/// outcomes callers are expected to handle; `Corruption` and `Schema` are
/// fatal; `Transient` is retried internally before ever reaching a caller;
/// `Configuration` is surfaced without retry; `Cancelled` is never
/// retried.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying SQLite error from the key-value persistence layer.
    #[error("kvp error: {0}")]
    Kvp(#[from] rusqlite::Error),

    /// I/O error from the blob store or schema migration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error on a document body or wire payload.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Requested document, revision, or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// MVCC precondition violated: the parent revision is not a current
    /// leaf, or a root was created over an existing non-deleted document.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Fatal on-disk inconsistency: a checksum mismatch, a broken blob
    /// reference, or an unreadable schema.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Fatal migration failure. The migration's write transaction was
    /// rolled back; the database was not modified.
    #[error("schema error: {0}")]
    Schema(String),

    /// A referenced blob is missing from the blob store.
    #[error("blob missing: {0}")]
    BlobMissing(String),

    /// Network or I/O condition expected to clear on retry. Only ever
    /// surfaced once the replicator's backoff budget is exhausted.
    #[error("transient error: {0}")]
    Transient(String),

    /// Bad URL, bad header, bad selector, or other caller-supplied
    /// configuration mistake. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An index query selector could not be parsed or normalized.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// An index field path is invalid (contains `$`).
    #[error("invalid field: {0}")]
    InvalidField(String),

    /// A requested sort could not be satisfied by an index-covered scan.
    #[error("unsupported sort: {0}")]
    UnsupportedSort(String),

    /// Fatal, non-retryable replication failure (4xx other than 429,
    /// malformed JSON, or a cancelled-before-durable condition).
    #[error("fatal replication error: {0}")]
    FatalReplication(String),

    /// The operation was cancelled via a `CancellationToken`.
    #[error("cancelled")]
    Cancelled,
}

/// Result type alias using revtree's `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the classes of error the replicator's retry loop should
    /// retry rather than abort on.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
