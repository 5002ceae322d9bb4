//! Ingress side of the mesh
//!
//! A [`Gateway`] learns services from provider advertisements, opens a gate
//! (TCP listener or UDP socket) for every approved entry and bridges each
//! accepted connection to a provider over a multiplexed channel.

pub mod channel;
pub mod config;
pub mod filter;
pub mod gate;
pub mod gateway;

pub use channel::{Channel, ChannelPhase, PendingBuffer, MAX_PENDING_BYTES};
pub use config::GatewayConfig;
pub use filter::{RouteFilter, ServiceFilter, ServiceMatcher};
pub use gate::Gate;
pub use gateway::{Gateway, GatewayStats};

use meshgate_control::PeerError;
use meshgate_net::NetError;
use meshgate_proto::{ChannelId, ChannelIdError, PeerKey};
use meshgate_router::RouteError;
use thiserror::Error;

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("Route via {0} denied by provider ingress policy")]
    RouteDenied(PeerKey),

    #[error("Open request to {0} timed out")]
    OpenTimeout(PeerKey),

    #[error("Open rejected: {0}")]
    OpenRejected(String),

    #[error("Buffer limit exceeded for channel {channel_id} ({size} bytes)")]
    BufferOverflow { channel_id: ChannelId, size: usize },

    #[error("Channel closed")]
    ChannelClosed,

    #[error(transparent)]
    ChannelIds(#[from] ChannelIdError),
}
