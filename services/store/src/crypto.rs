//! Encryption stage.
//!
//! Every object gets a fresh 96-bit IV and 128-bit salt. The AES-256-GCM key is
//! derived from the salt and the master secret, so no two objects share a key
//! and the secret itself never touches a provider.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub const IV_LEN: usize = 12;
pub const SALT_LEN: usize = 16;
pub const MIN_SECRET_LEN: usize = 32;

const KEY_CONTEXT: &[u8] = b"strata-store/object-key/v1";

/// Errors from the encryption stage.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Master secret unavailable: {0}")]
    SecretUnavailable(String),

    #[error("Master secret too short: {0} bytes, need at least 32")]
    SecretTooShort(usize),

    #[error("Invalid crypto parameters: {0}")]
    InvalidParams(String),

    #[error("Encryption failed")]
    EncryptFailed,

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptFailed,
}

/// Supplies the key material objects are encrypted under.
pub trait MasterSecretProvider: Send + Sync {
    fn master_secret(&self) -> Result<Vec<u8>, CryptoError>;
}

/// Secret handed in by the caller, e.g. fetched from a KMS at startup.
pub struct StaticSecretProvider {
    secret: Vec<u8>,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self, CryptoError> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(CryptoError::SecretTooShort(secret.len()));
        }
        Ok(Self { secret })
    }
}

impl MasterSecretProvider for StaticSecretProvider {
    fn master_secret(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(self.secret.clone())
    }
}

/// Reads a base64 secret from an environment variable on every call, so a
/// rotated value is picked up by the next store.
pub struct EnvSecretProvider {
    var: String,
}

impl EnvSecretProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl MasterSecretProvider for EnvSecretProvider {
    fn master_secret(&self) -> Result<Vec<u8>, CryptoError> {
        let encoded = std::env::var(&self.var)
            .map_err(|_| CryptoError::SecretUnavailable(format!("{} is not set", self.var)))?;
        let secret = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::SecretUnavailable(format!("{}: {}", self.var, e)))?;
        if secret.len() < MIN_SECRET_LEN {
            return Err(CryptoError::SecretTooShort(secret.len()));
        }
        Ok(secret)
    }
}

/// Per-object IV and salt, persisted with the metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoParams {
    pub iv: [u8; IV_LEN],
    pub salt: [u8; SALT_LEN],
}

impl CryptoParams {
    /// Fresh random parameters from the OS RNG.
    pub fn generate() -> Self {
        let mut iv = [0u8; IV_LEN];
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut iv);
        OsRng.fill_bytes(&mut salt);
        Self { iv, salt }
    }

    /// Rebuild from the byte vectors stored on a record.
    pub fn from_slices(iv: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| CryptoError::InvalidParams(format!("iv is {} bytes", iv.len())))?;
        let salt: [u8; SALT_LEN] = salt
            .try_into()
            .map_err(|_| CryptoError::InvalidParams(format!("salt is {} bytes", salt.len())))?;
        Ok(Self { iv, salt })
    }
}

/// Derive the per-object key with HKDF-SHA256: the object salt as HKDF salt,
/// the master secret as input keying material, `KEY_CONTEXT` as info.
pub fn derive_object_key(secret: &[u8], salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    Hkdf::<Sha256>::new(Some(salt), secret)
        .expand(KEY_CONTEXT, &mut key)
        .map_err(|e| CryptoError::InvalidParams(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext`; output is ciphertext || 16-byte tag.
pub fn encrypt(secret: &[u8], params: &CryptoParams, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = derive_object_key(secret, &params.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::EncryptFailed)?;
    cipher
        .encrypt(Nonce::from_slice(&params.iv), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Decrypt and authenticate output of [`encrypt`].
pub fn decrypt(secret: &[u8], params: &CryptoParams, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = derive_object_key(secret, &params.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::DecryptFailed)?;
    cipher
        .decrypt(Nonce::from_slice(&params.iv), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}
