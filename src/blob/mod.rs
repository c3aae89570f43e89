// src/blob/mod.rs

//! Content-addressed blob storage for attachment bodies.
//!
//! Blobs live under `<root>/attachments/`. With no encryption key
//! configured, a blob's filename is its SHA-1 digest. The file itself
//! is the source of truth and `blob_index` is unused. With a key
//! configured, filenames are opaque random tokens (so the digest can't
//! be recovered from directory listings) and `blob_index` maps
//! digest -> filename.

pub mod crypto;
pub mod digest;

use crate::error::{Error, Result};
use crate::kvp::Kvp;
use digest::DigestWriter;
use rusqlite::{params, OptionalExtension};
use sha2::Digest as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The identity of a stored blob: its content-addressing digest, its
/// plaintext length, and the SHA-256 integrity digest.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobRef {
    pub digest: String,
    pub sha256: String,
    pub length: u64,
}

pub struct BlobStore {
    root: PathBuf,
    kvp: Arc<Kvp>,
    encryption: Arc<dyn crate::config::EncryptionKeyProvider>,
}

impl BlobStore {
    pub fn open(
        root: impl Into<PathBuf>,
        kvp: Arc<Kvp>,
        encryption: Arc<dyn crate::config::EncryptionKeyProvider>,
    ) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            kvp,
            encryption,
        })
    }

    /// Writes `data`, returning its digest. Idempotent: writing the same
    /// bytes twice is a no-op the second time.
    pub fn put(&self, data: &[u8]) -> Result<BlobRef> {
        let mut hasher = DigestWriter::new();
        hasher.write_all(data)?;
        let (digest, sha256, length) = hasher.finish();

        if self.exists(&digest)? {
            return Ok(BlobRef { digest, sha256, length });
        }

        match self.encryption.key() {
            Some(key) => {
                let nonce = crypto::generate_nonce();
                let ciphertext = crypto::encrypt(&key, &nonce, data)?;
                let filename = hex::encode(crypto::generate_random::<16>());

                let mut payload = Vec::with_capacity(nonce.len() + ciphertext.len());
                payload.extend_from_slice(&nonce);
                payload.extend_from_slice(&ciphertext);
                self.write_atomic(&filename, &payload)?;

                self.kvp.run_write(|tx| {
                    tx.execute(
                        "INSERT OR REPLACE INTO blob_index (digest, filename, sha256, length)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![digest, filename, sha256, length as i64],
                    )?;
                    Ok(())
                })?;
            }
            None => {
                self.write_atomic(&digest, data)?;
            }
        }

        debug!("stored blob {digest} ({length} bytes)");
        Ok(BlobRef { digest, sha256, length })
    }

    /// Reads back a blob's plaintext bytes.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>> {
        match self.encryption.key() {
            Some(key) => {
                let filename = self.lookup_filename(digest)?;
                let path = self.root.join(&filename);
                let payload = fs::read(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::BlobMissing(digest.to_string())
                    } else {
                        Error::Io(e)
                    }
                })?;
                if payload.len() < crypto::NONCE_LEN {
                    return Err(Error::Corruption(format!(
                        "blob {digest} is shorter than a nonce"
                    )));
                }
                let (nonce_bytes, ciphertext) = payload.split_at(crypto::NONCE_LEN);
                let nonce: [u8; crypto::NONCE_LEN] = nonce_bytes
                    .try_into()
                    .map_err(|_| Error::Corruption(format!("blob {digest} has a malformed nonce")))?;
                crypto::decrypt(&key, &nonce, ciphertext)
            }
            None => {
                let path = self.root.join(digest);
                fs::read(&path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        Error::BlobMissing(digest.to_string())
                    } else {
                        Error::Io(e)
                    }
                })
            }
        }
    }

    pub fn exists(&self, digest: &str) -> Result<bool> {
        match self.encryption.key() {
            Some(_) => Ok(self.lookup_filename(digest).is_ok()),
            None => Ok(self.root.join(digest).exists()),
        }
    }

    /// Removes a blob, for garbage collection of attachments no longer
    /// referenced by any revision.
    pub fn delete(&self, digest: &str) -> Result<()> {
        match self.encryption.key() {
            Some(_) => {
                if let Ok(filename) = self.lookup_filename(digest) {
                    let _ = fs::remove_file(self.root.join(filename));
                }
                self.kvp.run_write(|tx| {
                    tx.execute("DELETE FROM blob_index WHERE digest = ?1", params![digest])?;
                    Ok(())
                })
            }
            None => {
                let _ = fs::remove_file(self.root.join(digest));
                Ok(())
            }
        }
    }

    fn lookup_filename(&self, digest: &str) -> Result<String> {
        self.kvp
            .run_read(|conn| {
                conn.query_row(
                    "SELECT filename FROM blob_index WHERE digest = ?1",
                    params![digest],
                    |row| row.get(0),
                )
                .optional()
                .map_err(Error::from)
            })?
            .ok_or_else(|| Error::BlobMissing(digest.to_string()))
    }

    fn write_atomic(&self, filename: &str, data: &[u8]) -> Result<()> {
        let dest = self.root.join(filename);
        let temp_path = self.root.join(format!("{filename}.tmp"));
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&temp_path, &dest)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens a streaming writer: bytes are staged to a temp file and
    /// hashed incrementally, with the digest (and, for encrypted stores,
    /// encryption) only finalized on [`BlobStoreWriter::finish`]. Prefer
    /// this over [`BlobStore::put`] when the full attachment body isn't
    /// already buffered in memory (e.g. while streaming a replicated
    /// attachment off the wire).
    pub fn writer(&self) -> Result<BlobStoreWriter<'_>> {
        let temp = tempfile::NamedTempFile::new_in(&self.root)?;
        Ok(BlobStoreWriter {
            store: self,
            temp,
            sha1: sha1::Sha1::new(),
            sha256: sha2::Sha256::new(),
            md5: md5::Md5::new(),
            length: 0,
        })
    }

    /// Deletes every stored blob whose digest is not in `keep`. Callers
    /// are expected to compute `keep` from the set of attachment digests
    /// still referenced by a live revision (see
    /// `crate::store::Datastore::gc_blobs`). Works for encrypted stores
    /// too, via `blob_index`.
    pub fn gc(&self, keep: &std::collections::HashSet<String>) -> Result<u64> {
        let mut removed = 0u64;
        match self.encryption.key() {
            Some(_) => {
                let rows: Vec<(String, String)> = self.kvp.run_read(|conn| {
                    let mut stmt = conn.prepare("SELECT digest, filename FROM blob_index")?;
                    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                    rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Error::from)
                })?;
                for (digest, filename) in rows {
                    if !keep.contains(&digest) {
                        let _ = fs::remove_file(self.root.join(&filename));
                        self.kvp.run_write(|tx| {
                            tx.execute("DELETE FROM blob_index WHERE digest = ?1", params![digest])?;
                            Ok(())
                        })?;
                        removed += 1;
                    }
                }
            }
            None => {
                for entry in fs::read_dir(&self.root)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.ends_with(".tmp") {
                        continue;
                    }
                    if !keep.contains(&name) {
                        let _ = fs::remove_file(entry.path());
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Number of blobs currently stored (file count unencrypted,
    /// `blob_index` row count encrypted).
    pub fn count(&self) -> Result<u64> {
        match self.encryption.key() {
            Some(_) => self.kvp.run_read(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM blob_index", [], |r| r.get::<_, i64>(0))? as u64)
            }),
            None => {
                let mut n = 0u64;
                for entry in fs::read_dir(&self.root)? {
                    let entry = entry?;
                    if !entry.file_name().to_string_lossy().ends_with(".tmp") {
                        n += 1;
                    }
                }
                Ok(n)
            }
        }
    }
}

/// A staged, not-yet-committed blob write. Bytes written via
/// [`BlobStoreWriter::write`] are hashed incrementally and staged to a
/// temp file in the blob store's root; nothing is visible to readers
/// until [`BlobStoreWriter::finish`] commits it.
pub struct BlobStoreWriter<'a> {
    store: &'a BlobStore,
    temp: tempfile::NamedTempFile,
    sha1: sha1::Sha1,
    sha256: sha2::Sha256,
    md5: md5::Md5,
    length: u64,
}

impl<'a> BlobStoreWriter<'a> {
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.temp.write_all(buf)?;
        self.sha1.update(buf);
        self.sha256.update(buf);
        self.md5.update(buf);
        self.length += buf.len() as u64;
        Ok(())
    }

    /// Commits the staged bytes: finalizes the digest, deduplicates
    /// against an existing blob of the same digest if one exists,
    /// encrypts (if configured), and atomically places the result under
    /// the blob store's root.
    pub fn finish(mut self) -> Result<BlobRef> {
        use std::io::{Read, Seek, SeekFrom};

        self.temp.flush()?;
        let digest = hex::encode(self.sha1.clone().finalize());
        let sha256_hex = hex::encode(self.sha256.clone().finalize());
        let _md5_hex = hex::encode(self.md5.clone().finalize());
        let length = self.length;

        if self.store.exists(&digest)? {
            return Ok(BlobRef { digest, sha256: sha256_hex, length });
        }

        match self.store.encryption.key() {
            Some(key) => {
                self.temp.seek(SeekFrom::Start(0))?;
                let mut plaintext = Vec::with_capacity(length as usize);
                self.temp.read_to_end(&mut plaintext)?;

                let nonce = crypto::generate_nonce();
                let ciphertext = crypto::encrypt(&key, &nonce, &plaintext)?;
                let filename = hex::encode(crypto::generate_random::<16>());

                let mut payload = Vec::with_capacity(nonce.len() + ciphertext.len());
                payload.extend_from_slice(&nonce);
                payload.extend_from_slice(&ciphertext);
                self.store.write_atomic(&filename, &payload)?;

                self.store.kvp.run_write(|tx| {
                    tx.execute(
                        "INSERT OR REPLACE INTO blob_index (digest, filename, sha256, length)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![digest, filename, sha256_hex, length as i64],
                    )?;
                    Ok(())
                })?;
            }
            None => {
                self.temp.as_file().sync_all()?;
                let dest = self.store.root.join(&digest);
                self.temp.persist(&dest).map_err(|e| Error::Io(e.error))?;
            }
        }

        debug!("stored blob {digest} ({length} bytes) via streaming writer");
        Ok(BlobRef { digest, sha256: sha256_hex, length })
    }

    /// Discards the staged write. The temp file is removed by its own
    /// `Drop` impl.
    pub fn cancel(self) {}
}
