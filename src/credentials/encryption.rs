//! AES-256-GCM column encryption.
//!
//! Every (table, context) pair gets its own key, derived from the master key
//! with SHA-256, so a ciphertext copied into another organization's row does
//! not decrypt. Each value is encrypted with a fresh random nonce and stored as
//! `base64(nonce || ciphertext)`.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Derives the column key for a table and context (organization id, column name).
pub fn derive_key(master_key: &[u8], table: &str, context: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(master_key);
    hasher.update(table.as_bytes());
    hasher.update([0u8]);
    hasher.update(context.as_bytes());
    hasher.finalize().into()
}

/// Encrypts plaintext with a random nonce. Returns `base64(nonce || ciphertext)`.
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Never reuse a nonce
    let nonce_bytes = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext_bytes = cipher
        .encrypt(&nonce_bytes, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend_from_slice(&ciphertext_bytes);

    Ok(BASE64.encode(&sealed))
}

/// Decrypts a value produced by [`encrypt`].
///
/// Fails on a wrong key, a truncated value or tampered data.
pub fn decrypt(sealed: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let sealed_bytes = BASE64.decode(sealed).context("Failed to decode ciphertext")?;

    if sealed_bytes.len() <= NONCE_SIZE {
        return Err(anyhow!(
            "Ciphertext too short: expected more than {} bytes, got {}",
            NONCE_SIZE,
            sealed_bytes.len()
        ));
    }

    let (nonce_bytes, ciphertext_bytes) = sealed_bytes.split_at(NONCE_SIZE);

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let plaintext_bytes = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext_bytes)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}
