//! Symmetric encryption of blocks and manifests
//!
//! Every block is encrypted with its own random key; that key is stored in the
//! file manifest wrapped by the workspace key. Manifests stored in the local
//! cache are encrypted directly with the workspace key.
//!
//! Ciphertext layout: `nonce (12 bytes) || ChaCha20-Poly1305 ciphertext`.

use crate::error::{Result, WorkspaceError};
use crate::models::WrappedKey;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// 256-bit symmetric key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    pub fn generate() -> Self {
        let key = ChaCha20Poly1305::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            WorkspaceError::Decryption(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| WorkspaceError::Internal(format!("Cipher creation failed: {}", e)))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| WorkspaceError::Internal(format!("Encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(WorkspaceError::Decryption(format!(
                "ciphertext too short ({} bytes)",
                data.len()
            )));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher()?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| WorkspaceError::Decryption(e.to_string()))
    }

    /// Encrypt `key` under `self` so it can be stored in a manifest.
    pub fn wrap(&self, key: &SecretKey) -> Result<WrappedKey> {
        self.encrypt(&key.0).map(WrappedKey)
    }

    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> Result<SecretKey> {
        let raw = self.decrypt(&wrapped.0)?;
        SecretKey::from_slice(&raw)
    }
}
