//! OpenSSL-compatible salted tokens for temporary limit overrides
//!
//! Token: base64url(`"Salted__"` ∥ salt[8] ∥ AES-256-CBC ciphertext), with
//! key and iv taken from PBKDF2-HMAC-SHA256(secret, salt, 10000) → 48 bytes.
//! This matches `openssl enc -aes-256-cbc -pbkdf2 -iter 10000 -md sha256`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

const MAGIC: &[u8; 8] = b"Salted__";
const SALT_LEN: usize = 8;
const PBKDF2_ROUNDS: u32 = 10_000;

/// Token errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Invalid token encoding")]
    Encoding,

    #[error("Token is not a salted envelope")]
    NotSalted,

    #[error("Token decryption failed")]
    Decrypt,

    #[error("Invalid token claims: {0}")]
    Claims(#[from] serde_json::Error),
}

/// Decrypted token contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideClaims {
    pub ip: String,
    /// Unix epoch milliseconds
    #[serde(alias = "ts")]
    pub timestamp: i64,
}

impl OverrideClaims {
    pub fn new(ip: impl Into<String>, timestamp: i64) -> Self {
        Self {
            ip: ip.into(),
            timestamp,
        }
    }

    pub fn decrypt(token: &str, secret: &str) -> Result<Self, TokenError> {
        let raw = decode_base64(token)?;
        if raw.len() < MAGIC.len() + SALT_LEN || &raw[..MAGIC.len()] != MAGIC {
            return Err(TokenError::NotSalted);
        }

        let salt = &raw[MAGIC.len()..MAGIC.len() + SALT_LEN];
        let ciphertext = &raw[MAGIC.len() + SALT_LEN..];
        let (key, iv) = derive_key_iv(secret, salt);

        let plaintext = Aes256CbcDec::new_from_slices(&key, &iv)
            .map_err(|_| TokenError::Decrypt)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TokenError::Decrypt)?;

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Produce a token for these claims with a fresh random salt
    pub fn encrypt(&self, secret: &str) -> Result<String, TokenError> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let (key, iv) = derive_key_iv(secret, &salt);

        let plaintext = serde_json::to_vec(self)?;
        let ciphertext = Aes256CbcEnc::new_from_slices(&key, &iv)
            .map_err(|_| TokenError::Decrypt)?
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        let mut raw = Vec::with_capacity(MAGIC.len() + SALT_LEN + ciphertext.len());
        raw.extend_from_slice(MAGIC);
        raw.extend_from_slice(&salt);
        raw.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }
}

fn derive_key_iv(secret: &str, salt: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut out = [0u8; 48];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt, PBKDF2_ROUNDS, &mut out);

    let mut key = [0u8; 32];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&out[..32]);
    iv.copy_from_slice(&out[32..]);
    (key, iv)
}

/// Accepts base64url (padded or not) and standard base64
fn decode_base64(token: &str) -> Result<Vec<u8>, TokenError> {
    let token = token.trim();
    let unpadded = token.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(unpadded)
        .or_else(|_| STANDARD.decode(token))
        .map_err(|_| TokenError::Encoding)
}
