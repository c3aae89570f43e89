// src/revision/model.rs

//! Core revision-tree types: document and revision identifiers, the
//! attachment descriptor, and the deterministic revision-id hash.

use crate::error::{Error, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// An opaque, non-empty document identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::Configuration("doc_id must not be empty".to_string()));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for DocId {
    type Error = Error;
    fn try_from(value: &str) -> Result<Self> {
        DocId::new(value)
    }
}

impl TryFrom<String> for DocId {
    type Error = Error;
    fn try_from(value: String) -> Result<Self> {
        DocId::new(value)
    }
}

/// A revision identifier: `(generation, hash)`, rendered as
/// `"generation-hexhash"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevId {
    pub generation: u64,
    pub hash: String,
}

impl RevId {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }

    pub fn root(hash: impl Into<String>) -> Self {
        Self::new(1, hash)
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for RevId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (gen_str, hash) = s
            .split_once('-')
            .ok_or_else(|| Error::Configuration(format!("invalid rev id: {s}")))?;
        let generation: u64 = gen_str
            .parse()
            .map_err(|_| Error::Configuration(format!("invalid rev id: {s}")))?;
        if hash.is_empty() {
            return Err(Error::Configuration(format!("invalid rev id: {s}")));
        }
        Ok(RevId {
            generation,
            hash: hash.to_string(),
        })
    }
}

impl Ord for RevId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl PartialOrd for RevId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Attachment metadata carried by a revision. `stub: true` means the body
/// is elided and only the digest/length/revpos are present (the
/// stubbing rule for stored-but-not-yet-fetched attachments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub name: String,
    pub content_type: String,
    pub length: u64,
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default)]
    pub encoded_length: Option<u64>,
    /// SHA-1 hex digest identifying the blob in the blob store.
    pub digest: String,
    /// Generation at which this attachment body was introduced.
    pub revpos: u64,
    #[serde(default)]
    pub follows: bool,
    #[serde(default)]
    pub stub: bool,
}

/// One committed revision. Immutable once constructed; `body` may be
/// `None` if this revision's body has been dropped by compaction.
#[derive(Debug, Clone)]
pub struct Revision {
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub parent_rev_id: Option<RevId>,
    pub deleted: bool,
    pub body: Option<serde_json::Value>,
    pub sequence: i64,
    pub attachments: BTreeMap<String, AttachmentDescriptor>,
    pub local_only: bool,
}

/// Canonicalizes `body` and computes the deterministic revision hash
/// MD5 of canonical-body bytes, parent rev-id bytes
/// (empty for roots), the deleted flag, and the sorted list of
/// attachment digests.
///
/// `serde_json::Value`'s object representation is a `BTreeMap` unless
/// the `preserve_order` feature is enabled (it is not, in this crate's
/// dependency graph), so serializing `body` already yields keys in
/// sorted order, so no extra canonicalization pass is needed.
pub fn compute_rev_hash(
    parent: Option<&RevId>,
    deleted: bool,
    body: &serde_json::Value,
    attachment_digests: &[String],
) -> Result<String> {
    let mut hasher = Md5::new();

    let canonical_body = serde_json::to_vec(body)?;
    hasher.update(&canonical_body);

    if let Some(parent) = parent {
        hasher.update(parent.to_string().as_bytes());
    }

    hasher.update([deleted as u8]);

    let mut digests = attachment_digests.to_vec();
    digests.sort();
    for digest in &digests {
        hasher.update(digest.as_bytes());
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Computes the full `RevId` (generation = parent generation + 1, or 1
/// for a root) for an edit described by `parent`, `deleted`, `body`, and
/// `attachment_digests`.
pub fn compute_rev_id(
    parent: Option<&RevId>,
    deleted: bool,
    body: &serde_json::Value,
    attachment_digests: &[String],
) -> Result<RevId> {
    let generation = parent.map(|p| p.generation + 1).unwrap_or(1);
    let hash = compute_rev_hash(parent, deleted, body, attachment_digests)?;
    Ok(RevId::new(generation, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rev_id_display_and_parse() {
        let rev = RevId::new(3, "abc123");
        assert_eq!(rev.to_string(), "3-abc123");
        let parsed: RevId = "3-abc123".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn rev_id_ordering() {
        let r1 = RevId::new(1, "aaa");
        let r2 = RevId::new(2, "aaa");
        let r3 = RevId::new(2, "bbb");
        assert!(r1 < r2);
        assert!(r2 < r3);
    }

    #[test]
    fn invalid_rev_id_rejected() {
        assert!("nope".parse::<RevId>().is_err());
        assert!("abc-123".parse::<RevId>().is_err());
    }

    #[test]
    fn doc_id_rejects_empty() {
        assert!(DocId::new("").is_err());
        assert!(DocId::new("a").is_ok());
    }

    #[test]
    fn rev_hash_is_deterministic() {
        let body = serde_json::json!({"n": 1});
        let a = compute_rev_id(None, false, &body, &[]).unwrap();
        let b = compute_rev_id(None, false, &body, &[]).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.generation, 1);
    }

    #[test]
    fn rev_hash_differs_by_parent() {
        let body = serde_json::json!({"n": 1});
        let root = compute_rev_id(None, false, &body, &[]).unwrap();
        let child_a = compute_rev_id(Some(&root), false, &body, &[]).unwrap();
        let child_b = compute_rev_id(Some(&RevId::new(1, "other")), false, &body, &[]).unwrap();
        assert_ne!(child_a.hash, child_b.hash);
        assert_eq!(child_a.generation, 2);
    }

    #[test]
    fn rev_hash_ignores_attachment_digest_order() {
        let body = serde_json::json!({"n": 1});
        let a = compute_rev_id(None, false, &body, &["d2".into(), "d1".into()]).unwrap();
        let b = compute_rev_id(None, false, &body, &["d1".into(), "d2".into()]).unwrap();
        assert_eq!(a, b);
    }
}
