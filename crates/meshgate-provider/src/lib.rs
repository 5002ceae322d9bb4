//! Egress side of the mesh
//!
//! A [`ServiceProvider`] advertises local backend services to every gateway
//! sharing its router secret, answers `open` requests by dialing the backend
//! and bridges bytes between the backend socket and the requesting gateway.

pub mod channel;
pub mod provider;
pub mod registry;

pub use channel::BackendChannel;
pub use provider::{ProviderConfig, ProviderExtensions, ServiceProvider};
pub use registry::ServiceRegistry;

use meshgate_control::PeerError;
use meshgate_proto::{PolicyError, Protocol};
use thiserror::Error;

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Invalid ingress policy: {0}")]
    Policy(#[from] PolicyError),

    #[error("Service not found for gate port {gate_port}")]
    ServiceNotFound {
        gate_port: u16,
        protocol: Option<Protocol>,
    },

    #[error("Failed to connect to {host}:{port}: {reason}")]
    BackendConnection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Open cancelled by the gateway")]
    OpenCancelled,
}
