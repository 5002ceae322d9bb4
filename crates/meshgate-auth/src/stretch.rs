//! Memory-hard key stretching for the hello MAC key

use crate::blob::AuthError;
use argon2::{Algorithm, Argon2, Params, Version};
use sha2::{Digest, Sha256};

pub const STRETCHED_KEY_LEN: usize = 64;
const SALT_LEN: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StretchParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl StretchParams {
    /// Interactive cost: 64 MiB, 2 passes
    pub const fn interactive() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 2,
        }
    }

    pub const fn new(memory_kib: u32, iterations: u32) -> Self {
        Self {
            memory_kib,
            iterations,
        }
    }
}

impl Default for StretchParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Stretch `secret` with a salt derived from the secret itself
///
/// The salt is deterministic so every node holding the secret arrives at
/// the same key.
pub fn stretch_key(
    secret: &[u8],
    params: StretchParams,
) -> Result<[u8; STRETCHED_KEY_LEN], AuthError> {
    let digest = Sha256::digest(secret);
    let salt = &digest[..SALT_LEN];

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        1,
        Some(STRETCHED_KEY_LEN),
    )
    .map_err(|e| AuthError::KeyStretch(e.to_string()))?;

    let mut out = [0u8; STRETCHED_KEY_LEN];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params)
        .hash_password_into(secret, salt, &mut out)
        .map_err(|e| AuthError::KeyStretch(e.to_string()))?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIGHT: StretchParams = StretchParams::new(64, 1);

    #[test]
    fn test_same_secret_same_key() {
        let a = stretch_key(b"router-secret", LIGHT).unwrap();
        let b = stretch_key(b"router-secret", LIGHT).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, stretch_key(b"other-secret", LIGHT).unwrap());
    }

    #[test]
    fn test_invalid_params_are_reported() {
        assert!(matches!(
            stretch_key(b"x", StretchParams::new(1, 1)),
            Err(AuthError::KeyStretch(_))
        ));
    }
}
