//! Connectivity abstraction for the meshgate overlay
//!
//! Peers never dial each other directly. They join a topic (the router
//! public key) on a swarm, which discovers other members and hands over
//! authenticated, ordered byte pipes tagged with the remote node key.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Peer (gateway / provider sessions)      │
//! └──────────────────────────────────────────┘
//!                     │ Swarm + Discovery
//!                     ↓
//! ┌──────────────────────────────────────────┐
//! │   TcpSwarm (this crate) or any other     │
//! │   implementation of the traits below     │
//! └──────────────────────────────────────────┘
//! ```

pub mod tcp;

use async_trait::async_trait;
use meshgate_proto::PeerKey;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

pub use tcp::{TcpSwarm, TcpSwarmConfig};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Timeout")]
    Timeout,

    #[error("Swarm destroyed")]
    Destroyed,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Byte pipe to a remote node
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> PeerStream for T {}

/// Ban list kept by a swarm
pub trait BanList: Send + Sync {
    fn ban(&self, key: &PeerKey);
    fn is_banned(&self, key: &PeerKey) -> bool;
}

/// Identity of the node at the other end of a connection
#[derive(Clone)]
pub struct PeerInfo {
    public_key: PeerKey,
    remote_addr: Option<SocketAddr>,
    bans: Arc<dyn BanList>,
}

impl PeerInfo {
    pub fn new(public_key: PeerKey, remote_addr: Option<SocketAddr>, bans: Arc<dyn BanList>) -> Self {
        Self {
            public_key,
            remote_addr,
            bans,
        }
    }

    pub fn public_key(&self) -> PeerKey {
        self.public_key
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Refuse this node on every future connection
    pub fn ban(&self) {
        self.bans.ban(&self.public_key);
    }

    pub fn is_banned(&self) -> bool {
        self.bans.is_banned(&self.public_key)
    }
}

impl Debug for PeerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerInfo")
            .field("public_key", &self.public_key)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// A connection delivered by the swarm
pub struct IncomingConnection {
    pub stream: Box<dyn PeerStream>,
    pub info: PeerInfo,
}

/// Which side of discovery a node takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    pub client: bool,
    pub server: bool,
}

impl JoinOptions {
    pub fn both() -> Self {
        Self {
            client: true,
            server: true,
        }
    }
}

/// Handle to a joined topic
#[async_trait]
pub trait Discovery: Send + Sync + Debug {
    /// Look for new peers; previously connected peers are left alone
    async fn refresh(&self) -> TransportResult<()>;
}

/// Node-level connectivity
#[async_trait]
pub trait Swarm: Send + Sync + Debug {
    /// This node's public key
    fn public_key(&self) -> PeerKey;

    async fn join(&self, topic: PeerKey, options: JoinOptions) -> TransportResult<Arc<dyn Discovery>>;

    /// Receiver of established connections; yields `Some` only once
    fn take_connections(&self) -> Option<mpsc::UnboundedReceiver<IncomingConnection>>;

    /// Stop discovery and release listeners
    async fn destroy(&self) -> TransportResult<()>;
}
