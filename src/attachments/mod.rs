// src/attachments/mod.rs

//! Bridges incoming/outgoing `_attachments` JSON to the blob store and
//! the revision engine's [`AttachmentDescriptor`] rows.
//!
//! This module owns no storage of its own; it reads and writes through
//! [`crate::blob::BlobStore`] and hands the revision engine a resolved
//! `BTreeMap<String, AttachmentDescriptor>` to persist alongside a
//! revision row.

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::revision::model::AttachmentDescriptor;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

pub struct AttachmentManager {
    blob: Arc<BlobStore>,
}

impl AttachmentManager {
    pub fn new(blob: Arc<BlobStore>) -> Self {
        Self { blob }
    }

    /// Resolves the `_attachments` field of an incoming document body
    /// into attachment descriptors, writing any inline bodies to the
    /// blob store.
    ///
    /// - `incoming: None` carries the parent's attachments forward
    ///   unchanged (the body didn't mention `_attachments` at all).
    /// - `incoming: Some(Value::Object(_))` replaces the attachment set:
    ///   each entry must either be a stub (`"stub": true`) referring to
    ///   an attachment already present on `parent`, or carry inline
    ///   base64 `"data"`. Parent attachments not mentioned are dropped,
    ///   matching the stub-to-carry-forward convention of the protocol
    ///   this store replicates with.
    pub fn prepare(
        &self,
        parent: &BTreeMap<String, AttachmentDescriptor>,
        incoming: Option<&serde_json::Value>,
        generation: u64,
    ) -> Result<BTreeMap<String, AttachmentDescriptor>> {
        let Some(incoming) = incoming else {
            return Ok(parent.clone());
        };

        let map = incoming
            .as_object()
            .ok_or_else(|| Error::InvalidField("_attachments must be an object".to_string()))?;

        let mut result = BTreeMap::new();
        for (name, entry) in map {
            let entry = entry
                .as_object()
                .ok_or_else(|| Error::InvalidField(format!("attachment '{name}' must be an object")))?;

            let is_stub = entry.get("stub").and_then(|v| v.as_bool()).unwrap_or(false);

            if is_stub {
                let existing = parent.get(name).cloned().ok_or_else(|| {
                    Error::NotFound(format!("no prior attachment '{name}' to stub"))
                })?;
                result.insert(name.clone(), existing);
                continue;
            }

            let data_b64 = entry
                .get("data")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidField(format!(
                        "attachment '{name}' has neither a stub nor inline data"
                    ))
                })?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data_b64)
                .map_err(|e| Error::InvalidField(format!("attachment '{name}' data is not valid base64: {e}")))?;

            let content_type = entry
                .get("content_type")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream")
                .to_string();

            let wants_gzip = entry.get("encoding").and_then(|v| v.as_str()) == Some("gzip");
            let plaintext_length = bytes.len() as u64;
            let (stored, encoding, encoded_length) = if wants_gzip {
                let compressed = gzip_compress(&bytes)?;
                let encoded_length = compressed.len() as u64;
                (compressed, Some("gzip".to_string()), Some(encoded_length))
            } else {
                (bytes, None, None)
            };

            let blob_ref = self.blob.put(&stored)?;
            result.insert(
                name.clone(),
                AttachmentDescriptor {
                    name: name.clone(),
                    content_type,
                    length: plaintext_length,
                    encoding,
                    encoded_length,
                    digest: blob_ref.digest,
                    revpos: generation,
                    follows: false,
                    stub: false,
                },
            );
        }
        Ok(result)
    }

    /// Builds the `_attachments` JSON object for a read path. When
    /// `include_bodies` is false, entries are stubs (digest/length/revpos
    /// only); otherwise each entry's bytes are fetched from the blob
    /// store and base64-inlined.
    pub fn materialize(
        &self,
        attachments: &BTreeMap<String, AttachmentDescriptor>,
        include_bodies: bool,
    ) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut out = serde_json::Map::new();
        for (name, descriptor) in attachments {
            let mut entry = serde_json::Map::new();
            entry.insert("content_type".into(), descriptor.content_type.clone().into());
            entry.insert("length".into(), descriptor.length.into());
            entry.insert("digest".into(), descriptor.digest.clone().into());
            entry.insert("revpos".into(), descriptor.revpos.into());
            if let Some(encoding) = &descriptor.encoding {
                entry.insert("encoding".into(), encoding.clone().into());
            }

            if include_bodies {
                let bytes = self.fetch(descriptor)?;
                entry.insert(
                    "data".into(),
                    base64::engine::general_purpose::STANDARD.encode(bytes).into(),
                );
            } else {
                entry.insert("stub".into(), true.into());
            }
            out.insert(name.clone(), entry.into());
        }
        Ok(out)
    }

    /// Fetches one attachment's bytes, transparently decoding it if it
    /// was stored gzip-encoded. Callers always get the original
    /// plaintext back, matching the "pass no encoding, get decoded data"
    /// convention this is grounded on.
    pub fn fetch(&self, descriptor: &AttachmentDescriptor) -> Result<Vec<u8>> {
        let stored = self.blob.get(&descriptor.digest)?;
        match descriptor.encoding.as_deref() {
            Some("gzip") => gzip_decompress(&stored),
            _ => Ok(stored),
        }
    }

    /// Gives the replicator direct blob-store access for the cases it
    /// can't express through `prepare`/`materialize`: storing a foreign
    /// attachment body whose digest and revpos are already assigned by
    /// the remote peer, or checking whether a stubbed foreign attachment
    /// is already present locally.
    pub fn blob(&self) -> &BlobStore {
        &self.blob
    }

    /// Stores a foreign attachment body (from a pulled revision),
    /// verifying the locally computed digest matches what the remote
    /// peer claimed, if given.
    pub fn store_foreign(
        &self,
        name: &str,
        content_type: &str,
        data: &[u8],
        revpos: u64,
        expected_digest: Option<&str>,
    ) -> Result<AttachmentDescriptor> {
        let blob_ref = self.blob.put(data)?;
        if let Some(expected) = expected_digest {
            if expected != blob_ref.digest {
                return Err(Error::Corruption(format!(
                    "attachment '{name}': remote digest {expected} does not match recomputed {}",
                    blob_ref.digest
                )));
            }
        }
        Ok(AttachmentDescriptor {
            name: name.to_string(),
            content_type: content_type.to_string(),
            length: blob_ref.length,
            encoding: None,
            encoded_length: None,
            digest: blob_ref.digest,
            revpos,
            follows: false,
            stub: false,
        })
    }
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gzip_decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
