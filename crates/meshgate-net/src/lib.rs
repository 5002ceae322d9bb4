//! Local socket plumbing for gates and backends
//!
//! Channels on both ends of the overlay terminate in ordinary sockets: an
//! accepted client on a gateway, a dialed backend on a provider. This crate
//! gives TCP streams and UDP pseudo-connections one shape.

pub mod backlog;
pub mod socket;
pub mod udp;

pub use backlog::{Backlog, SESSION_HIGH_WATER, SOCKET_HIGH_WATER};
pub use socket::{
    bind_tcp_with_retry, idle_duration, spawn_socket, ChannelSocket, NetError, SocketHandle,
    SocketReader, SocketWriter,
};
pub use udp::{UdpConnection, UdpDemux};

/// Largest UDP datagram we read
pub const MAX_DATAGRAM: usize = 64 * 1024;
