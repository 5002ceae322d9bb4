//! Optional collaborators plugged into providers

use meshgate_proto::{ChannelFingerprint, ChannelId, Protocol};
use serde_json::Value;
use std::net::SocketAddr;
use std::time::Duration;

/// A provider-side channel announced to a fingerprint resolver
#[derive(Debug, Clone)]
pub struct FingerprintRegistration {
    pub protocol: Protocol,
    /// Provider end of the backend socket, which the backend sees as remote
    pub local: SocketAddr,
    /// Backend end of the socket
    pub remote: SocketAddr,
    pub channel_id: ChannelId,
    pub gate_port: u16,
    pub fingerprint: ChannelFingerprint,
    pub idle: Duration,
}

/// Receives channel fingerprints so backends can look up the real client
pub trait FingerprintSink: Send + Sync {
    /// Store or refresh a registration and return its lookup key
    fn register(&self, registration: &FingerprintRegistration) -> String;

    fn unregister(&self, key: &str);
}

/// Live ingress policy fragments merged after a provider's own documents
pub trait PolicyOverrides: Send + Sync {
    fn overrides(&self) -> Value;
}
