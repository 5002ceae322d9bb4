//! Hello authentication blobs
//!
//! Layout: `[version: u8 = 21][timestamp: i64 BE unix ms][HMAC-SHA512 tag]`.
//! The tag covers `source ∥ target ∥ router ∥ header` under the stretched
//! router key, so a blob is only valid for one ordered pair of nodes.

use crate::identity::RouterIdentity;
use crate::stretch::{stretch_key, StretchParams, STRETCHED_KEY_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use meshgate_proto::PeerKey;
use sha2::Sha512;
use thiserror::Error;

type HmacSha512 = Hmac<Sha512>;

pub const AUTH_VERSION: u8 = 21;
const HEADER_LEN: usize = 1 + 8;
const TAG_LEN: usize = 64;
pub const AUTH_BLOB_LEN: usize = HEADER_LEN + TAG_LEN;
const MIN_BLOB_LEN: usize = 32;

/// Blobs older than this are rejected (15 minutes)
pub const REPLAY_WINDOW_MS: i64 = 15 * 60 * 1000;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid router secret: {0}")]
    InvalidSecret(String),

    #[error("Key stretching failed: {0}")]
    KeyStretch(String),

    #[error("Malformed auth blob: {0}")]
    Malformed(String),

    #[error("Auth blob outside replay window ({age_ms}ms)")]
    Expired { age_ms: i64 },

    #[error("Auth blob does not match")]
    Mismatch,

    #[error("Role mismatch: both peers are {0}")]
    RoleMismatch(&'static str),
}

/// Creates and verifies hello blobs for one router
///
/// Construction runs the key stretch once; the result is reused for every
/// handshake.
#[derive(Clone)]
pub struct Authenticator {
    router_key: PeerKey,
    mac: HmacSha512,
    window_ms: i64,
}

impl Authenticator {
    pub fn new(identity: &RouterIdentity, params: StretchParams) -> Result<Self, AuthError> {
        let key: [u8; STRETCHED_KEY_LEN] = stretch_key(identity.secret_key(), params)?;
        let mac = HmacSha512::new_from_slice(&key)
            .map_err(|e| AuthError::KeyStretch(e.to_string()))?;

        Ok(Self {
            router_key: identity.public_key(),
            mac,
            window_ms: REPLAY_WINDOW_MS,
        })
    }

    pub fn router_key(&self) -> PeerKey {
        self.router_key
    }

    /// Blob proving `source` may talk to `target`
    pub fn create(&self, source: &PeerKey, target: &PeerKey) -> Bytes {
        self.create_at(source, target, chrono::Utc::now().timestamp_millis())
    }

    pub fn create_at(&self, source: &PeerKey, target: &PeerKey, timestamp_ms: i64) -> Bytes {
        let mut header = [0u8; HEADER_LEN];
        header[0] = AUTH_VERSION;
        header[1..].copy_from_slice(&timestamp_ms.to_be_bytes());

        let mut blob = BytesMut::with_capacity(AUTH_BLOB_LEN);
        blob.put_slice(&header);
        blob.put_slice(&self.tag(source, target, &header).finalize().into_bytes());
        blob.freeze()
    }

    /// Verify a blob a remote `source` sent to us (`own`)
    pub fn verify(&self, source: &PeerKey, own: &PeerKey, blob: &[u8]) -> Result<(), AuthError> {
        self.verify_at(source, own, blob, chrono::Utc::now().timestamp_millis())
    }

    pub fn verify_at(
        &self,
        source: &PeerKey,
        own: &PeerKey,
        blob: &[u8],
        now_ms: i64,
    ) -> Result<(), AuthError> {
        if blob.len() < MIN_BLOB_LEN {
            return Err(AuthError::Malformed(format!("{} bytes", blob.len())));
        }
        if blob[0] != AUTH_VERSION {
            return Err(AuthError::Malformed(format!("version {}", blob[0])));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&blob[1..HEADER_LEN]);
        let timestamp_ms = i64::from_be_bytes(ts);
        let age_ms = now_ms.saturating_sub(timestamp_ms);
        if age_ms.abs() > self.window_ms {
            return Err(AuthError::Expired { age_ms });
        }

        if blob.len() != AUTH_BLOB_LEN {
            return Err(AuthError::Mismatch);
        }
        self.tag(source, own, &blob[..HEADER_LEN])
            .verify_slice(&blob[HEADER_LEN..])
            .map_err(|_| AuthError::Mismatch)
    }

    fn tag(&self, source: &PeerKey, target: &PeerKey, header: &[u8]) -> HmacSha512 {
        let mut mac = self.mac.clone();
        mac.update(source.as_bytes());
        mac.update(target.as_bytes());
        mac.update(self.router_key.as_bytes());
        mac.update(header);
        mac
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("router_key", &self.router_key)
            .finish_non_exhaustive()
    }
}
