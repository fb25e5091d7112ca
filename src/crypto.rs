//! Crypto module for token encryption at rest
//!
//! Uses AES-256-GCM with HKDF key derivation for OAuth token storage.
//! - HKDF over the configured secret (never a hardcoded fallback)
//! - Installation-specific salt stored in the `settings` table
//! - Key bytes zeroized on drop

use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::hkdf;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::db::Database;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SALT_LEN: usize = 32;
const KEY_LEN: usize = 32;
const SALT_SETTING_KEY: &str = "token_encryption_salt";
const HKDF_INFO: &[u8] = b"ledger-bridge-token-encryption-v1";

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Encryption failed: {0}")]
    Encrypt(String),
    #[error("Decryption failed: {0}")]
    Decrypt(String),
    #[error("Salt storage error: {0}")]
    Storage(String),
}

/// Symmetric cipher for the access/refresh token columns
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TokenCipher {
    key_bytes: [u8; KEY_LEN],
}

impl TokenCipher {
    /// Derive the key from `secret` and an explicit salt
    pub fn from_secret(secret: &str, salt: &[u8]) -> Result<Self, CryptoError> {
        if secret.trim().is_empty() {
            return Err(CryptoError::KeyDerivation(
                "Token encryption secret must not be empty".to_string(),
            ));
        }

        let hkdf_salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt);
        let prk = hkdf_salt.extract(secret.as_bytes());

        let info: &[&[u8]] = &[HKDF_INFO];
        let okm = prk
            .expand(info, KeyLen(KEY_LEN))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expansion failed".to_string()))?;

        let mut key_bytes = [0u8; KEY_LEN];
        okm.fill(&mut key_bytes)
            .map_err(|_| CryptoError::KeyDerivation("Failed to fill key bytes".to_string()))?;

        Ok(Self { key_bytes })
    }

    /// Derive the key using the salt persisted for this installation, creating it on first use
    pub fn for_database(db: &Database, secret: &str) -> Result<Self, CryptoError> {
        let salt = get_or_create_salt(db)?;
        Self::from_secret(secret, &salt)
    }

    /// Encrypt a token. Returns base64 of nonce || ciphertext || tag.
    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let key = self.key()?;

        let rng = SystemRandom::new();
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rng.fill(&mut nonce_bytes)
            .map_err(|e| CryptoError::Encrypt(format!("RNG error: {:?}", e)))?;

        let mut in_out = plaintext.as_bytes().to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);
        key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|e| CryptoError::Encrypt(format!("{:?}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + in_out.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&in_out);

        Ok(base64::engine::general_purpose::STANDARD.encode(&result))
    }

    /// Decrypt a value produced by [`TokenCipher::seal`]
    pub fn open(&self, encrypted: &str) -> Result<String, CryptoError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(encrypted)
            .map_err(|e| CryptoError::Decrypt(format!("Base64 decode error: {}", e)))?;

        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decrypt("Encrypted data too short".to_string()));
        }

        let key = self.key()?;
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| CryptoError::Decrypt("Invalid nonce".to_string()))?;

        let mut in_out = ciphertext.to_vec();
        let plaintext = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| {
                CryptoError::Decrypt("invalid key or corrupted data".to_string())
            })?;

        let result = String::from_utf8(plaintext.to_vec())
            .map_err(|e| CryptoError::Decrypt(format!("UTF-8 decode error: {}", e)));
        in_out.zeroize();
        result
    }

    fn key(&self) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, &self.key_bytes)
            .map_err(|e| CryptoError::KeyDerivation(format!("Key error: {:?}", e)))?;
        Ok(LessSafeKey::new(unbound))
    }
}

/// Get or create the installation-specific salt (base64 in `settings`)
fn get_or_create_salt(db: &Database) -> Result<Vec<u8>, CryptoError> {
    let stored: Option<String> = db
        .get_setting(SALT_SETTING_KEY)
        .map_err(|e| CryptoError::Storage(e.to_string()))?;

    if let Some(encoded) = stored {
        let salt = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Storage(format!("Corrupt salt: {}", e)))?;
        if salt.len() == SALT_LEN {
            return Ok(salt);
        }
        return Err(CryptoError::Storage(format!(
            "Stored salt has length {}, expected {}",
            salt.len(),
            SALT_LEN
        )));
    }

    let rng = SystemRandom::new();
    let mut salt = vec![0u8; SALT_LEN];
    rng.fill(&mut salt)
        .map_err(|e| CryptoError::KeyDerivation(format!("Failed to generate salt: {:?}", e)))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&salt);
    db.set_setting(SALT_SETTING_KEY, &encoded)
        .map_err(|e| CryptoError::Storage(e.to_string()))?;

    log::info!("Generated new token encryption salt");
    Ok(salt)
}

/// Custom key type for HKDF output
struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}
