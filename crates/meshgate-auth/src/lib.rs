//! Authentication for the meshgate overlay
//!
//! Every node sharing a router secret derives the same router keypair and
//! the same stretched MAC key. Hello blobs prove knowledge of that secret
//! bound to both connection endpoints and a timestamp.

pub mod blob;
pub mod identity;
pub mod override_token;
pub mod stretch;

pub use blob::{AuthError, Authenticator, AUTH_BLOB_LEN, AUTH_VERSION, REPLAY_WINDOW_MS};
pub use identity::{generate_secret, RouterIdentity};
pub use override_token::{OverrideClaims, TokenError};
pub use stretch::StretchParams;
