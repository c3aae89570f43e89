// src/config.rs

//! Configuration surface for a [`crate::store::Datastore`].
//!
//! Options are a plain struct constructed in code, not loaded from an
//! external file format.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default bound on ancestor depth preserved below live leaves during
/// compaction.
pub const DEFAULT_REVISION_LIMIT: u32 = 1000;

/// Default per-request HTTP timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout applied to attachment streaming requests, which may run long.
pub const DEFAULT_ATTACHMENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of in-flight requests a replication direction may have
/// outstanding at once.
pub const DEFAULT_REPLICATION_PARALLELISM: usize = 4;

/// Default batch size for `_changes` polling.
pub const DEFAULT_CHANGES_BATCH: u32 = 200;

/// Maximum retry attempts for a single transient HTTP failure.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Opaque, host-defined file-protection hint passed through to the
/// platform unexamined: advisory vs. mandatory semantics are left to
/// the caller's platform, not interpreted here.
#[derive(Debug, Clone, Default)]
pub struct FileProtection(pub Option<String>);

/// Capability for supplying a per-store blob encryption key.
///
/// A small trait rather than an inheritance hierarchy, matching the
/// capability-trait seams used elsewhere (blob I/O, HTTP interception).
pub trait EncryptionKeyProvider: Send + Sync {
    /// Returns the 32-byte AES-256 key for this store, or `None`/empty to
    /// leave blobs unencrypted.
    fn key(&self) -> Option<[u8; 32]>;
}

/// An `EncryptionKeyProvider` that never supplies a key.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl EncryptionKeyProvider for NoEncryption {
    fn key(&self) -> Option<[u8; 32]> {
        None
    }
}

/// A provider backed by a fixed, caller-supplied key (e.g. loaded from the
/// host's keychain before the store is opened).
#[derive(Clone)]
pub struct StaticKey(pub [u8; 32]);

impl EncryptionKeyProvider for StaticKey {
    fn key(&self) -> Option<[u8; 32]> {
        Some(self.0)
    }
}

/// Options controlling how a [`crate::store::Datastore`] is opened.
#[derive(Clone)]
pub struct StoreOptions {
    /// Root directory holding `db.sqlite`, `attachments/`, `extensions/`.
    pub root: PathBuf,
    /// Blob-at-rest encryption key provider.
    pub encryption: Arc<dyn EncryptionKeyProvider>,
    /// Ancestor-depth bound enforced by `compact()`.
    pub revision_limit: u32,
    /// Host file-protection hint, passed through opaquely.
    pub file_protection: FileProtection,
}

impl StoreOptions {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            encryption: Arc::new(NoEncryption),
            revision_limit: DEFAULT_REVISION_LIMIT,
            file_protection: FileProtection::default(),
        }
    }

    pub fn with_encryption(mut self, provider: Arc<dyn EncryptionKeyProvider>) -> Self {
        self.encryption = provider;
        self
    }

    pub fn with_revision_limit(mut self, limit: u32) -> Self {
        self.revision_limit = limit;
        self
    }
}

/// Options controlling a single replication run.
#[derive(Clone)]
pub struct ReplicatorOptions {
    /// Base URL of the remote `{db}` endpoint.
    pub remote_url: String,
    /// Extra headers merged into every outbound request. Rejected at
    /// construction time if any reserved header name is present.
    pub headers: Vec<(String, String)>,
    /// `User-Agent` override; defaults to the library version string.
    pub user_agent: Option<String>,
    /// Per-request timeout (not applied to attachment streaming).
    pub request_timeout: Duration,
    /// Timeout applied to attachment streaming requests.
    pub attachment_timeout: Duration,
    /// Bounded concurrent-request budget, shared by revision and
    /// attachment transfers.
    pub parallelism: usize,
    /// `_changes` batch size.
    pub changes_batch: u32,
    /// Optional named filter applied to the change feed.
    pub filter_name: Option<String>,
    /// Parameters for `filter_name`.
    pub filter_params: Vec<(String, String)>,
    /// Restrict replication to this set of document ids, if non-empty.
    pub doc_ids: Vec<String>,
}

/// Reserved header names that may never appear in caller-supplied
/// `headers`. Checked at construction time.
pub const RESERVED_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "host",
    "www-authenticate",
    "content-type",
    "accept",
    "content-length",
];

impl ReplicatorOptions {
    pub fn new(remote_url: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            headers: Vec::new(),
            user_agent: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            attachment_timeout: DEFAULT_ATTACHMENT_TIMEOUT,
            parallelism: DEFAULT_REPLICATION_PARALLELISM,
            changes_batch: DEFAULT_CHANGES_BATCH,
            filter_name: None,
            filter_params: Vec::new(),
            doc_ids: Vec::new(),
        }
    }

    /// Adds a caller header, rejecting reserved (protocol-owned) names.
    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> crate::Result<Self> {
        let name = name.into();
        if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            return Err(crate::Error::Configuration(format!(
                "header '{name}' is reserved and cannot be overridden"
            )));
        }
        self.headers.push((name, value.into()));
        Ok(self)
    }
}

/// Cooperative cancellation signal, checked between batches, before each
/// network request, and between per-document inserts inside a bulk
/// operation.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` if the token has been tripped.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
