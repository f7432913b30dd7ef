//! Column-level encryption for secrets stored by the query service.
//!
//! Two kinds of secrets are encrypted at rest:
//!
//! - credential values referenced by encrypted data source options
//!   (table `credentials`, context `value`)
//! - organization environment variables
//!   (table `org_environment_variables`, context = organization id)
//!
//! ```text
//!   master key (base64, from env)
//!          │
//!          ▼  SHA-256(master ‖ table ‖ 0 ‖ context)
//!   column key ──► AES-256-GCM ──► base64(nonce ‖ ciphertext)
//! ```

mod encryption;

pub use encryption::validate_key;

use crate::error::{QueryError, Result};

/// Table name used for organization environment variable ciphertexts.
pub const ORG_ENV_VARIABLES_TABLE: &str = "org_environment_variables";

/// Table name used for credential ciphertexts.
pub const CREDENTIALS_TABLE: &str = "credentials";

/// Decryption service keyed by table name and context.
///
/// Holds the master key in memory only.
pub struct ColumnCipher {
    master_key: Vec<u8>,
}

impl ColumnCipher {
    /// Creates a cipher from a base64-encoded 32-byte master key.
    pub fn new(master_key_base64: &str) -> anyhow::Result<Self> {
        let master_key = encryption::validate_key(master_key_base64)?;
        Ok(Self { master_key })
    }

    pub fn encrypt_column_value(&self, table: &str, context: &str, plaintext: &str) -> Result<String> {
        let key = encryption::derive_key(&self.master_key, table, context);
        encryption::encrypt(plaintext, &key)
            .map_err(|e| QueryError::credential(format!("Failed to encrypt {} value: {:#}", table, e)))
    }

    pub fn decrypt_column_value(&self, table: &str, context: &str, ciphertext: &str) -> Result<String> {
        let key = encryption::derive_key(&self.master_key, table, context);
        encryption::decrypt(ciphertext, &key)
            .map_err(|e| QueryError::credential(format!("Failed to decrypt {} value: {:#}", table, e)))
    }
}
