// Credential cipher for secrets stored at rest (git passwords, storage keys)
// AES-GCM with a fresh nonce per value, encoded as base64(nonce || ciphertext)

use crate::errors::CipherError;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes192;
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use std::fmt;
use std::sync::Arc;

type Aes192Gcm = AesGcm<Aes192, U12>;

const NONCE_LEN: usize = 12;

enum CipherKind {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// Symmetric cipher bound to a single process key
pub struct CredentialCipher {
    kind: CipherKind,
}

impl CredentialCipher {
    /// Build a cipher from raw key bytes. The key must be 16, 24 or 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let invalid = |_| CipherError::InvalidKeyLength(key.len());
        let kind = match key.len() {
            16 => CipherKind::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => CipherKind::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => CipherKind::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            other => return Err(CipherError::InvalidKeyLength(other)),
        };
        Ok(Self { kind })
    }

    /// Build a cipher from a base64 encoded key, as stored in configuration
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidEncoding(e.to_string()))?;
        Self::new(&key)
    }

    /// Key size in bits
    pub fn key_bits(&self) -> usize {
        match self.kind {
            CipherKind::Aes128(_) => 128,
            CipherKind::Aes192(_) => 192,
            CipherKind::Aes256(_) => 256,
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = match &self.kind {
            CipherKind::Aes128(c) => c.encrypt(nonce, plaintext.as_bytes()),
            CipherKind::Aes192(c) => c.encrypt(nonce, plaintext.as_bytes()),
            CipherKind::Aes256(c) => c.encrypt(nonce, plaintext.as_bytes()),
        }
        .map_err(|_| CipherError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CipherError> {
        let data = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CipherError::InvalidEncoding(e.to_string()))?;

        // nonce plus a 16 byte tag is the smallest valid payload
        if data.len() < NONCE_LEN + 16 {
            return Err(CipherError::Malformed(format!(
                "expected at least {} bytes, got {}",
                NONCE_LEN + 16,
                data.len()
            )));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = match &self.kind {
            CipherKind::Aes128(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes192(c) => c.decrypt(nonce, ciphertext),
            CipherKind::Aes256(c) => c.decrypt(nonce, ciphertext),
        }
        .map_err(|_| CipherError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CipherError::InvalidUtf8)
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key_bits", &self.key_bits())
            .finish()
    }
}

/// Generate a fresh 32 byte key, base64 encoded
pub fn generate_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Immutable security context handed to every component that reads secrets
#[derive(Clone, Debug)]
pub struct SecurityContext {
    cipher: Arc<CredentialCipher>,
}

impl SecurityContext {
    pub fn new(cipher: CredentialCipher) -> Self {
        Self {
            cipher: Arc::new(cipher),
        }
    }

    pub fn from_base64_key(encoded: &str) -> Result<Self, CipherError> {
        Ok(Self::new(CredentialCipher::from_base64(encoded)?))
    }

    pub fn cipher(&self) -> &CredentialCipher {
        &self.cipher
    }

    /// Decrypt an optional secret field. Empty values stay empty.
    pub fn decrypt_secret(&self, value: &str) -> Result<String, CipherError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        self.cipher.decrypt(value)
    }

    pub fn encrypt_secret(&self, value: &str) -> Result<String, CipherError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        self.cipher.encrypt(value)
    }
}
