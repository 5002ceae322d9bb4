//! Plain TCP swarm
//!
//! Nodes listen on a configured address and dial a static bootstrap list.
//! Each connection starts with a 64-byte preamble in both directions:
//! the sender's node key followed by the topic. Payload confidentiality is
//! left to the network (loopback, VPN, or a tunnel in front).

use crate::{
    BanList, Discovery, IncomingConnection, JoinOptions, PeerInfo, Swarm, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use meshgate_proto::PeerKey;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PREAMBLE_LEN: usize = PeerKey::LEN * 2;

/// TCP swarm configuration
#[derive(Debug, Clone)]
pub struct TcpSwarmConfig {
    /// Address to accept peers on (server side)
    pub listen: Option<SocketAddr>,
    /// Peers to dial on every refresh (client side)
    pub bootstrap: Vec<SocketAddr>,
    pub handshake_timeout: Duration,
}

impl Default for TcpSwarmConfig {
    fn default() -> Self {
        Self {
            listen: None,
            bootstrap: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl TcpSwarmConfig {
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    pub fn with_bootstrap(mut self, addr: SocketAddr) -> Self {
        self.bootstrap.push(addr);
        self
    }
}

struct SwarmInner {
    key: PeerKey,
    config: TcpSwarmConfig,
    topic: Mutex<Option<PeerKey>>,
    banned: Mutex<HashSet<PeerKey>>,
    /// Live connections: node key -> connection id
    connected: Mutex<HashMap<PeerKey, u64>>,
    /// Bootstrap address -> node key reached there
    dialed: Mutex<HashMap<SocketAddr, PeerKey>>,
    next_conn_id: AtomicU64,
    connections_tx: mpsc::UnboundedSender<IncomingConnection>,
    connections_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingConnection>>>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Option<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl BanList for SwarmInner {
    fn ban(&self, key: &PeerKey) {
        if self.banned.lock().insert(*key) {
            warn!("Banned peer {}", key.short());
        }
    }

    fn is_banned(&self, key: &PeerKey) -> bool {
        self.banned.lock().contains(key)
    }
}

/// Swarm over plain TCP connections
#[derive(Clone)]
pub struct TcpSwarm {
    inner: Arc<SwarmInner>,
}

impl TcpSwarm {
    /// Create a swarm with a random node key, binding the listen address if any
    pub async fn bind(config: TcpSwarmConfig) -> TransportResult<Self> {
        Self::bind_with_key(PeerKey::from_bytes(rand::random()), config).await
    }

    pub async fn bind_with_key(key: PeerKey, config: TcpSwarmConfig) -> TransportResult<Self> {
        let listener = match config.listen {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let local_addr = match &listener {
            Some(listener) => Some(listener.local_addr()?),
            None => None,
        };
        if let Some(addr) = local_addr {
            info!("Swarm node {} listening on {}", key.short(), addr);
        }

        let (connections_tx, connections_rx) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(SwarmInner {
                key,
                config,
                topic: Mutex::new(None),
                banned: Mutex::new(HashSet::new()),
                connected: Mutex::new(HashMap::new()),
                dialed: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                connections_tx,
                connections_rx: Mutex::new(Some(connections_rx)),
                listener: Mutex::new(listener),
                local_addr,
                tasks: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Address peers can dial, when listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn connected_peers(&self) -> usize {
        self.inner.connected.lock().len()
    }
}

impl std::fmt::Debug for TcpSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSwarm")
            .field("key", &self.inner.key)
            .field("local_addr", &self.inner.local_addr)
            .finish()
    }
}

#[async_trait]
impl Swarm for TcpSwarm {
    fn public_key(&self) -> PeerKey {
        self.inner.key
    }

    async fn join(&self, topic: PeerKey, options: JoinOptions) -> TransportResult<Arc<dyn Discovery>> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        *self.inner.topic.lock() = Some(topic);

        if options.server {
            if let Some(listener) = self.inner.listener.lock().take() {
                let inner = self.inner.clone();
                let handle = tokio::spawn(accept_loop(inner, listener));
                self.inner.tasks.lock().push(handle);
            }
        }

        Ok(Arc::new(TcpDiscovery {
            inner: self.inner.clone(),
            topic,
            options,
        }))
    }

    fn take_connections(&self) -> Option<mpsc::UnboundedReceiver<IncomingConnection>> {
        self.inner.connections_rx.lock().take()
    }

    async fn destroy(&self) -> TransportResult<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
        self.inner.listener.lock().take();
        debug!("Swarm node {} destroyed", self.inner.key.short());
        Ok(())
    }
}

#[derive(Debug)]
struct TcpDiscovery {
    inner: Arc<SwarmInner>,
    topic: PeerKey,
    options: JoinOptions,
}

impl std::fmt::Debug for SwarmInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmInner").field("key", &self.key).finish()
    }
}

#[async_trait]
impl Discovery for TcpDiscovery {
    async fn refresh(&self) -> TransportResult<()> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        if !self.options.client {
            return Ok(());
        }

        for addr in self.inner.config.bootstrap.clone() {
            let live = {
                let dialed = self.inner.dialed.lock();
                let connected = self.inner.connected.lock();
                dialed.get(&addr).is_some_and(|key| connected.contains_key(key))
            };
            if live {
                continue;
            }

            match dial(&self.inner, addr, self.topic).await {
                Ok(key) => {
                    self.inner.dialed.lock().insert(addr, key);
                }
                Err(e) => debug!("Dial {} failed: {}", addr, e),
            }
        }
        Ok(())
    }
}

async fn accept_loop(inner: Arc<SwarmInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    let Some(topic) = *inner.topic.lock() else {
                        return;
                    };
                    if let Err(e) = establish(&inner, stream, remote, topic).await {
                        debug!("Inbound connection from {} rejected: {}", remote, e);
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept swarm connection: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn dial(inner: &Arc<SwarmInner>, addr: SocketAddr, topic: PeerKey) -> TransportResult<PeerKey> {
    let stream = tokio::time::timeout(inner.config.handshake_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)??;
    establish(inner, stream, addr, topic).await
}

/// Exchange preambles, apply bans and de-duplication, then hand the stream over
async fn establish(
    inner: &Arc<SwarmInner>,
    mut stream: TcpStream,
    remote: SocketAddr,
    topic: PeerKey,
) -> TransportResult<PeerKey> {
    stream.set_nodelay(true)?;

    let mut preamble = [0u8; PREAMBLE_LEN];
    preamble[..PeerKey::LEN].copy_from_slice(inner.key.as_bytes());
    preamble[PeerKey::LEN..].copy_from_slice(topic.as_bytes());

    let mut remote_preamble = [0u8; PREAMBLE_LEN];
    tokio::time::timeout(inner.config.handshake_timeout, async {
        stream.write_all(&preamble).await?;
        stream.read_exact(&mut remote_preamble).await?;
        Ok::<_, std::io::Error>(())
    })
    .await
    .map_err(|_| TransportError::Timeout)??;

    let remote_key = PeerKey::from_slice(&remote_preamble[..PeerKey::LEN])
        .ok_or_else(|| TransportError::HandshakeFailed("short key".to_string()))?;
    if &remote_preamble[PeerKey::LEN..] != topic.as_bytes() {
        return Err(TransportError::HandshakeFailed("topic mismatch".to_string()));
    }
    if remote_key == inner.key {
        return Err(TransportError::HandshakeFailed("connected to self".to_string()));
    }
    if inner.is_banned(&remote_key) {
        return Err(TransportError::HandshakeFailed(format!(
            "peer {} is banned",
            remote_key.short()
        )));
    }

    let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
    {
        let mut connected = inner.connected.lock();
        if connected.contains_key(&remote_key) {
            return Err(TransportError::HandshakeFailed(format!(
                "already connected to {}",
                remote_key.short()
            )));
        }
        connected.insert(remote_key, conn_id);
    }

    debug!("Swarm connection established with {} at {}", remote_key.short(), remote);

    let tracked = TrackedStream {
        stream,
        _guard: ConnectionGuard {
            swarm: Arc::downgrade(inner),
            key: remote_key,
            conn_id,
        },
    };
    let bans: Arc<dyn BanList> = inner.clone();
    let info = PeerInfo::new(remote_key, Some(remote), bans);

    inner
        .connections_tx
        .send(IncomingConnection {
            stream: Box::new(tracked),
            info,
        })
        .map_err(|_| TransportError::Destroyed)?;

    Ok(remote_key)
}

/// Frees the connected-peer slot when the stream is dropped
struct ConnectionGuard {
    swarm: Weak<SwarmInner>,
    key: PeerKey,
    conn_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.swarm.upgrade() {
            let mut connected = inner.connected.lock();
            if connected.get(&self.key) == Some(&self.conn_id) {
                connected.remove(&self.key);
            }
        }
    }
}

struct TrackedStream {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
