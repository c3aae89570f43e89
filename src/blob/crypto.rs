// src/blob/crypto.rs

//! AES-256-GCM blob-at-rest encryption.
//!
//! GCM gives authenticated encryption with a crate already pulled in
//! for this purpose elsewhere (see DESIGN.md).

use crate::error::{Error, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;

pub const NONCE_LEN: usize = 12;

pub fn generate_random<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    generate_random()
}

pub fn encrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Configuration(format!("invalid blob encryption key: {e}")))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::Corruption("blob encryption failed".to_string()))
}

pub fn decrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| Error::Configuration(format!("invalid blob encryption key: {e}")))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::Corruption("blob decryption failed: bad key or corrupt data".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let key = [7u8; 32];
        let nonce = generate_nonce();
        let plaintext = b"attachment bytes";
        let ciphertext = encrypt(&key, &nonce, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        let decrypted = decrypt(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn wrong_key_fails() {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&[1u8; 32], &nonce, b"secret").unwrap();
        let result = decrypt(&[2u8; 32], &nonce, &ciphertext);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }
}
