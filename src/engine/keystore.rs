//! deltaup Keystore Module
//! Password-encrypted storage for index signing keys
//!
//! A key file is JSON holding the public key in the clear and the private
//! scalar sealed with ChaCha20-Poly1305 under an Argon2id-derived key. The
//! public key is bound to the ciphertext as associated data, so swapping it
//! for another key is detected on open.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::engine::updater::signature::{KeyPoint, PrivateKey, SignatureError};

pub const KEY_STORE_FORMAT: u32 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const CIPHER_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Unsupported key store format {0}")]
    UnsupportedFormat(u32),
    #[error("Key store is corrupt: {0}")]
    Corrupt(String),
    #[error("Key derivation failed: {0}")]
    Kdf(String),
    #[error("Wrong password, or the key store was modified")]
    WrongPassword,
    #[error("Invalid key: {0}")]
    Key(#[from] SignatureError),
}

/// Argon2id cost parameters, stored with each key file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    fn derive(
        &self,
        password: &str,
        salt: &[u8],
    ) -> Result<Zeroizing<[u8; CIPHER_KEY_LEN]>, KeystoreError> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, Some(CIPHER_KEY_LEN))
            .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
        let mut key = Zeroizing::new([0u8; CIPHER_KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password.as_bytes(), salt, &mut *key)
            .map_err(|e| KeystoreError::Kdf(e.to_string()))?;
        Ok(key)
    }
}

/// An encrypted signing key as stored on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStore {
    pub format: u32,
    /// Hex SEC1 public key
    pub public_key: String,
    pub kdf: KdfParams,
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl KeyStore {
    /// Encrypt `key` under `password`
    pub fn seal(key: &PrivateKey, password: &str, kdf: KdfParams) -> Result<Self, KeystoreError> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let public_key = key.public_key().to_hex();
        let cipher_key = kdf.derive(password, &salt)?;
        let secret = Zeroizing::new(key.to_bytes());
        let ciphertext = cipher(&cipher_key)
            .encrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: secret.as_slice(),
                    aad: public_key.as_bytes(),
                },
            )
            .map_err(|_| KeystoreError::Corrupt("encryption failed".to_string()))?;

        Ok(Self {
            format: KEY_STORE_FORMAT,
            public_key,
            kdf,
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt the signing key
    pub fn open(&self, password: &str) -> Result<PrivateKey, KeystoreError> {
        if self.format != KEY_STORE_FORMAT {
            return Err(KeystoreError::UnsupportedFormat(self.format));
        }
        let salt = decode_hex("salt", &self.salt)?;
        let nonce: [u8; NONCE_LEN] = decode_hex("nonce", &self.nonce)?
            .try_into()
            .map_err(|_| KeystoreError::Corrupt("nonce has the wrong length".to_string()))?;
        let ciphertext = decode_hex("ciphertext", &self.ciphertext)?;

        let cipher_key = self.kdf.derive(password, &salt)?;
        let secret = Zeroizing::new(
            cipher(&cipher_key)
                .decrypt(
                    &Nonce::from(nonce),
                    Payload {
                        msg: &ciphertext,
                        aad: self.public_key.as_bytes(),
                    },
                )
                .map_err(|_| KeystoreError::WrongPassword)?,
        );

        let key = PrivateKey::from_bytes(&secret)?;
        if key.public_key() != self.public_key()? {
            return Err(KeystoreError::Corrupt(
                "private key does not match the stored public key".to_string(),
            ));
        }
        Ok(key)
    }

    pub fn public_key(&self) -> Result<KeyPoint, KeystoreError> {
        Ok(KeyPoint::from_hex(&self.public_key)?)
    }

    pub fn load(path: &Path) -> Result<Self, KeystoreError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write through a temp file; owner-only permissions on Unix
    pub fn save(&self, path: &Path) -> Result<(), KeystoreError> {
        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&temp_path, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

fn cipher(key: &[u8; CIPHER_KEY_LEN]) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(&Key::from(*key))
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, KeystoreError> {
    hex::decode(value).map_err(|e| KeystoreError::Corrupt(format!("{field}: {e}")))
}
