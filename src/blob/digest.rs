// src/blob/digest.rs

//! Incremental content hashing for blob writes.
//!
//! SHA-1 is the content-addressing key used throughout the attachment
//! descriptors (matching the wire digest format); SHA-256 is an
//! additional integrity check recorded alongside encrypted blobs, since
//! an opaque on-disk filename can no longer be cross-checked against the
//! digest by inspection.

use sha1::Sha1;
use sha2::{Digest as Sha2Digest, Sha256};
use std::io::{self, Write};

pub struct DigestWriter {
    sha1: Sha1,
    sha256: Sha256,
    length: u64,
}

impl DigestWriter {
    pub fn new() -> Self {
        Self {
            sha1: Sha1::new(),
            sha256: Sha256::new(),
            length: 0,
        }
    }

    pub fn finish(self) -> (String, String, u64) {
        (
            hex::encode(self.sha1.finalize()),
            hex::encode(self.sha256.finalize()),
            self.length,
        )
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for DigestWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sha1.update(buf);
        self.sha256.update(buf);
        self.length += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
