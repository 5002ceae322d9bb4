//! Router identity derived from the shared secret

use crate::blob::AuthError;
use ed25519_dalek::SigningKey;
use meshgate_proto::PeerKey;
use rand::RngCore;

/// Keypair shared by every node of one router
///
/// The public key doubles as the discovery topic.
#[derive(Clone)]
pub struct RouterIdentity {
    public_key: PeerKey,
    secret_key: [u8; 64],
}

impl RouterIdentity {
    /// Derive the router keypair from a 32-byte hex secret
    pub fn from_secret_hex(secret: &str) -> Result<Self, AuthError> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(secret.trim(), &mut seed)
            .map_err(|e| AuthError::InvalidSecret(format!("expected 64 hex characters: {}", e)))?;

        let signing_key = SigningKey::from_bytes(&seed);
        let public_key = PeerKey::from_bytes(signing_key.verifying_key().to_bytes());

        Ok(Self {
            public_key,
            secret_key: signing_key.to_keypair_bytes(),
        })
    }

    pub fn public_key(&self) -> PeerKey {
        self.public_key
    }

    /// Seed followed by public key
    pub fn secret_key(&self) -> &[u8; 64] {
        &self.secret_key
    }
}

impl std::fmt::Debug for RouterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterIdentity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Generate a new random router secret as hex
pub fn generate_secret() -> String {
    let mut seed = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    hex::encode(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let secret = generate_secret();
        let a = RouterIdentity::from_secret_hex(&secret).unwrap();
        let b = RouterIdentity::from_secret_hex(&secret).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.secret_key(), b.secret_key());
        assert_eq!(&a.secret_key()[32..], a.public_key().as_bytes());
    }

    #[test]
    fn test_different_secrets_give_different_routers() {
        let a = RouterIdentity::from_secret_hex(&generate_secret()).unwrap();
        let b = RouterIdentity::from_secret_hex(&generate_secret()).unwrap();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_rejects_malformed_secret() {
        assert!(RouterIdentity::from_secret_hex("not-hex").is_err());
        assert!(RouterIdentity::from_secret_hex("abcd").is_err());
    }
}
