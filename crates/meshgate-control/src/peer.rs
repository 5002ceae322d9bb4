//! Authenticated sessions over swarm connections
//!
//! Every new connection immediately sends `hello(is_gate, blob)`. The
//! remote's hello is checked for a compatible role (only gate to provider
//! pairs are allowed) and a valid blob; failures ban the remote node and
//! drop the connection. At most one session exists per remote key.

use crate::handlers::HandlerList;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use futures::{FutureExt, SinkExt, StreamExt};
use meshgate_auth::{AuthError, Authenticator, RouterIdentity, StretchParams};
use meshgate_net::{Backlog, SESSION_HIGH_WATER};
use meshgate_proto::{ChannelId, CodecError, FrameCodec, Message, PeerKey, CLOSE_ALL};
use meshgate_transport::{IncomingConnection, JoinOptions, PeerInfo, Swarm, TransportError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Interval between discovery refreshes
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(5);

const STOP_POLL: Duration = Duration::from_millis(100);

/// Session layer errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Already connected to {0}")]
    DuplicateSession(PeerKey),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerKey),

    #[error("Session closed")]
    SessionClosed,

    #[error("Peer stopped")]
    Stopped,
}

/// Peer configuration
#[derive(Clone)]
pub struct PeerConfig {
    /// Shared router secret, hex encoded
    pub secret: String,
    pub is_gate: bool,
    pub refresh_interval: Duration,
    pub stretch: StretchParams,
}

impl PeerConfig {
    pub fn new(secret: impl Into<String>, is_gate: bool) -> Self {
        Self {
            secret: secret.into(),
            is_gate,
            refresh_interval: REFRESH_INTERVAL,
            stretch: StretchParams::interactive(),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_stretch(mut self, params: StretchParams) -> Self {
        self.stretch = params;
        self
    }
}

impl std::fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("secret", &"<redacted>")
            .field("is_gate", &self.is_gate)
            .field("refresh_interval", &self.refresh_interval)
            .field("stretch", &self.stretch)
            .finish()
    }
}

/// Behaviour layered on top of a peer by gateways and providers
#[async_trait]
pub trait PeerHooks: Send + Sync {
    /// Runs after every discovery refresh; errors are handled inside
    async fn on_refresh(&self);

    /// Sees every authorized message after the handler list has
    fn on_message(&self, _session: &Arc<Session>, _msg: &Message) {}
}

/// One authenticated connection to a remote node
///
/// Sends never wait. Frame bytes queued for the remote are counted in a
/// [`Backlog`], and producers that can wait use [`Session::writable`].
pub struct Session {
    info: PeerInfo,
    outbound: mpsc::UnboundedSender<Bytes>,
    backlog: Arc<Backlog>,
    /// Waits the read loop honours before taking the next frame
    holds: Mutex<Vec<BoxFuture<'static, ()>>>,
    closed: CancellationToken,
}

impl Session {
    pub fn public_key(&self) -> PeerKey {
        self.info.public_key()
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }

    /// Queue a message for the remote
    pub fn send(&self, msg: &Message) -> Result<(), PeerError> {
        if self.closed.is_cancelled() {
            return Err(PeerError::SessionClosed);
        }
        let payload = msg.encode()?;
        let len = payload.len();
        self.outbound
            .send(payload)
            .map_err(|_| PeerError::SessionClosed)?;
        self.backlog.push(len);
        Ok(())
    }

    /// Send stream data, split into fragments the remote reassembles
    pub fn send_stream(&self, channel_id: ChannelId, data: Bytes) -> Result<(), PeerError> {
        for fragment in Message::stream_fragments(channel_id, data) {
            self.send(&fragment)?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Frame bytes waiting to be written
    pub fn queued_bytes(&self) -> usize {
        self.backlog.len()
    }

    /// Resolves once queued frames are below the high-water mark, or the
    /// session is gone
    pub fn writable(&self) -> impl Future<Output = ()> + Send + 'static {
        let backlog = self.backlog.clone();
        async move { backlog.writable().await }
    }

    /// Read no further frames from the remote until `wait` completes
    ///
    /// Handlers use this when the frame they just handled went to a local
    /// socket that is not keeping up.
    pub fn hold_reads<F>(&self, wait: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.holds.lock().push(wait.boxed());
    }

    /// Drop the connection after flushing what is already queued
    pub fn destroy(&self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.info.public_key())
            .field("closed", &self.is_closed())
            .finish()
    }
}

struct PeerInner {
    is_gate: bool,
    node_key: PeerKey,
    router_key: PeerKey,
    authenticator: Authenticator,
    swarm: Arc<dyn Swarm>,
    sessions: Mutex<HashMap<PeerKey, Arc<Session>>>,
    handlers: HandlerList<Arc<Session>>,
    refresh_interval: Duration,
    stopped: AtomicBool,
    refreshing: AtomicBool,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Session layer of a gateway or provider
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Derive the router identity and stretch the shared key
    pub async fn new(config: PeerConfig, swarm: Arc<dyn Swarm>) -> Result<Self, PeerError> {
        let identity = RouterIdentity::from_secret_hex(&config.secret)?;
        let router_key = identity.public_key();
        let stretch = config.stretch;
        let authenticator =
            tokio::task::spawn_blocking(move || Authenticator::new(&identity, stretch))
                .await
                .map_err(|e| AuthError::KeyStretch(e.to_string()))??;

        Ok(Self {
            inner: Arc::new(PeerInner {
                is_gate: config.is_gate,
                node_key: swarm.public_key(),
                router_key,
                authenticator,
                swarm,
                sessions: Mutex::new(HashMap::new()),
                handlers: HandlerList::new(),
                refresh_interval: config.refresh_interval,
                stopped: AtomicBool::new(false),
                refreshing: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Join the router topic and start accepting connections and refreshing
    ///
    /// The first refresh runs immediately.
    pub async fn start(&self, hooks: Weak<dyn PeerHooks>) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Err(PeerError::Stopped);
        }
        let mut connections = self.inner.swarm.take_connections().ok_or_else(|| {
            TransportError::ConfigurationError("swarm connections already taken".to_string())
        })?;
        let discovery = self
            .inner
            .swarm
            .join(self.inner.router_key, JoinOptions::both())
            .await?;
        info!("Joined router: {}", self.inner.router_key);

        let inner = self.inner.clone();
        let conn_hooks = hooks.clone();
        let accept = tokio::spawn(async move {
            while let Some(conn) = connections.recv().await {
                debug!("Swarm connection {}", conn.info.public_key());
                let inner = inner.clone();
                let hooks = conn_hooks.clone();
                tokio::spawn(inner.run_connection(conn, hooks));
            }
        });

        let inner = self.inner.clone();
        let refresh = tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                inner.refreshing.store(true, Ordering::SeqCst);
                trace!("Refreshing peers");
                if let Err(e) = discovery.refresh().await {
                    warn!("Error on refresh: {}", e);
                }
                let Some(hooks) = hooks.upgrade() else {
                    inner.refreshing.store(false, Ordering::SeqCst);
                    break;
                };
                hooks.on_refresh().await;
                drop(hooks);
                inner.refreshing.store(false, Ordering::SeqCst);

                tokio::time::sleep(inner.refresh_interval).await;
            }
        });

        self.inner.tasks.lock().extend([accept, refresh]);
        Ok(())
    }

    pub fn is_gate(&self) -> bool {
        self.inner.is_gate
    }

    /// This node's swarm key
    pub fn node_key(&self) -> PeerKey {
        self.inner.node_key
    }

    /// Topic shared by every node with the same secret
    pub fn router_key(&self) -> PeerKey {
        self.inner.router_key
    }

    pub fn session(&self, key: &PeerKey) -> Option<Arc<Session>> {
        self.inner.sessions.lock().get(key).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.inner.sessions.lock().values().cloned().collect()
    }

    pub fn send(&self, key: &PeerKey, msg: &Message) -> Result<(), PeerError> {
        self.session(key)
            .ok_or(PeerError::PeerNotFound(*key))?
            .send(msg)
    }

    /// Send to every authorized session, returning how many accepted it
    pub fn broadcast(&self, msg: &Message) -> usize {
        let mut sent = 0;
        for session in self.sessions() {
            match session.send(msg) {
                Ok(()) => sent += 1,
                Err(e) => debug!("Broadcast to {} failed: {}", session.public_key(), e),
            }
        }
        sent
    }

    /// Register a handler offered every authorized message
    ///
    /// Returning `true` detaches the handler after the current message.
    /// Handlers must not call back into [`HandlerList::dispatch`].
    pub fn add_handler<F>(&self, handler: F)
    where
        F: FnMut(&Arc<Session>, &Message) -> bool + Send + 'static,
    {
        self.inner.handlers.add(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop refreshing, wait for an in-flight refresh, then release the swarm
    ///
    /// Must not be awaited from inside [`PeerHooks::on_refresh`].
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        while self.inner.refreshing.load(Ordering::SeqCst) {
            tokio::time::sleep(STOP_POLL).await;
        }
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.shutdown.cancel();

        if let Err(e) = self.inner.swarm.destroy().await {
            debug!("Error on stop: {}", e);
        }
        info!("Peer {} stopped", self.inner.node_key.short());
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("node_key", &self.inner.node_key)
            .field("is_gate", &self.inner.is_gate)
            .finish()
    }
}

impl PeerInner {
    async fn run_connection(self: Arc<Self>, conn: IncomingConnection, hooks: Weak<dyn PeerHooks>) {
        let IncomingConnection { stream, info } = conn;
        let remote = info.public_key();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::new());
        let sink = FramedWrite::new(write_half, FrameCodec::new());

        let (outbound, queue) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            info,
            outbound,
            backlog: Arc::new(Backlog::new(SESSION_HIGH_WATER)),
            holds: Mutex::new(Vec::new()),
            closed: self.shutdown.child_token(),
        });
        let writer = tokio::spawn(write_loop(
            sink,
            queue,
            session.backlog.clone(),
            session.closed.clone(),
        ));

        let hello = Message::Hello {
            is_gate: self.is_gate,
            auth: self.authenticator.create(&self.node_key, &remote),
        };
        if let Err(e) = session.send(&hello) {
            warn!("Failed to send hello to {}: {}", remote, e);
        }

        let mut authorized = false;
        loop {
            let frame = tokio::select! {
                _ = session.closed.cancelled() => break,
                frame = frames.next() => frame,
            };
            let msg = match frame.map(|f| f.and_then(Message::decode)) {
                None => break,
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!(peer = %remote.short(), "Protocol error: {}", e);
                    if !authorized {
                        session.info.ban();
                    }
                    break;
                }
            };

            match msg {
                Message::Hello { is_gate, auth } => {
                    if authorized {
                        debug!("Ignoring repeated hello from {}", remote);
                        continue;
                    }
                    debug!("Receiving handshake from {}", remote);
                    match self.admit(&session, is_gate, &auth) {
                        Ok(()) => {
                            authorized = true;
                            info!("Authorized {}", remote);
                        }
                        Err(e @ PeerError::DuplicateSession(_)) => {
                            warn!("{}", e);
                            break;
                        }
                        Err(e) => {
                            error!("Authorization failed for peer {}: {}. Ban!", remote, e);
                            session.info.ban();
                            break;
                        }
                    }
                }
                msg if authorized => self.dispatch(&hooks, &session, &msg),
                msg => warn!(
                    "Unauthorized {} message from {}",
                    msg.action(),
                    remote.short()
                ),
            }

            let holds = std::mem::take(&mut *session.holds.lock());
            if !holds.is_empty() {
                trace!(peer = %remote.short(), "Reads paused for a congested socket");
                tokio::select! {
                    _ = session.closed.cancelled() => break,
                    _ = join_all(holds) => {}
                }
            }
        }

        if authorized {
            self.remove_session(&session);
            self.dispatch(
                &hooks,
                &session,
                &Message::Close {
                    channel_id: CLOSE_ALL,
                },
            );
            info!("Session with {} closed", remote);
        }
        session.closed.cancel();
        let _ = writer.await;
    }

    fn admit(&self, session: &Arc<Session>, remote_is_gate: bool, auth: &[u8]) -> Result<(), PeerError> {
        if remote_is_gate == self.is_gate {
            let role = if self.is_gate { "gates" } else { "providers" };
            return Err(AuthError::RoleMismatch(role).into());
        }

        let key = session.public_key();
        self.authenticator.verify(&key, &self.node_key, auth)?;

        let mut sessions = self.sessions.lock();
        if sessions.contains_key(&key) {
            return Err(PeerError::DuplicateSession(key));
        }
        sessions.insert(key, session.clone());
        Ok(())
    }

    fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        let key = session.public_key();
        if sessions.get(&key).is_some_and(|s| Arc::ptr_eq(s, session)) {
            sessions.remove(&key);
        }
    }

    fn dispatch(&self, hooks: &Weak<dyn PeerHooks>, session: &Arc<Session>, msg: &Message) {
        trace!(
            peer = %session.public_key().short(),
            channel_id = msg.channel_id(),
            "Receiving {}",
            msg.action()
        );
        self.handlers.dispatch(session, msg);
        if let Some(hooks) = hooks.upgrade() {
            hooks.on_message(session, msg);
        }
    }
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    backlog: Arc<Backlog>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            payload = queue.recv() => match payload {
                Some(payload) => {
                    let len = payload.len();
                    let sent = sink.send(payload).await;
                    backlog.pop(len);
                    if let Err(e) = sent {
                        debug!("Session write failed: {}", e);
                        backlog.close();
                        closed.cancel();
                        return;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => {
                while let Ok(payload) = queue.try_recv() {
                    if sink.feed(payload).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    backlog.close();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_auth::generate_secret;
    use meshgate_proto::RouteAdvertisement;
    use meshgate_transport::{TcpSwarm, TcpSwarmConfig};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        refreshes: AtomicUsize,
        messages: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl PeerHooks for Recorder {
        async fn on_refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_message(&self, _session: &Arc<Session>, msg: &Message) {
            self.messages.lock().push(msg.clone());
        }
    }

    struct Node {
        peer: Peer,
        swarm: TcpSwarm,
        hooks: Arc<Recorder>,
    }

    async fn node(secret: &str, is_gate: bool, config: TcpSwarmConfig) -> Node {
        let swarm = TcpSwarm::bind(config).await.unwrap();
        let peer = Peer::new(
            PeerConfig::new(secret, is_gate)
                .with_refresh_interval(Duration::from_millis(100))
                .with_stretch(StretchParams::new(64, 1)),
            Arc::new(swarm.clone()),
        )
        .await
        .unwrap();
        let hooks = Arc::new(Recorder::default());
        let weak: Weak<dyn PeerHooks> = Arc::downgrade(&hooks) as Weak<dyn PeerHooks>;
        peer.start(weak).await.unwrap();
        Node { peer, swarm, hooks }
    }

    async fn pair(gate_secret: &str, provider_secret: &str, provider_is_gate: bool) -> (Node, Node) {
        let gate = node(
            gate_secret,
            true,
            TcpSwarmConfig::default().with_listen("127.0.0.1:0".parse().unwrap()),
        )
        .await;
        let addr = gate.swarm.local_addr().unwrap();
        let provider = node(
            provider_secret,
            provider_is_gate,
            TcpSwarmConfig::default().with_bootstrap(addr),
        )
        .await;
        (gate, provider)
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_gate_and_provider_authorize_each_other() {
        let secret = generate_secret();
        let (gate, provider) = pair(&secret, &secret, false).await;

        assert!(eventually(|| gate.peer.sessions().len() == 1 && provider.peer.sessions().len() == 1).await);
        assert_eq!(gate.peer.router_key(), provider.peer.router_key());
        assert!(gate.peer.session(&provider.peer.node_key()).is_some());
        assert!(gate.hooks.refreshes.load(Ordering::SeqCst) >= 1);

        let sent = provider
            .peer
            .broadcast(&Message::AdvRoutes(RouteAdvertisement::new(Vec::new())));
        assert_eq!(sent, 1);
        assert!(eventually(|| {
            gate.hooks
                .messages
                .lock()
                .iter()
                .any(|m| matches!(m, Message::AdvRoutes(_)))
        })
        .await);
    }

    #[tokio::test]
    async fn test_wrong_secret_bans_remote() {
        let (gate, provider) = pair(&generate_secret(), &generate_secret(), false).await;

        assert!(eventually(|| gate.swarm.connected_peers() == 0 && provider.swarm.connected_peers() == 0).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(gate.peer.sessions().is_empty());
        assert!(provider.peer.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_two_gates_are_rejected() {
        let secret = generate_secret();
        let (first, second) = pair(&secret, &secret, true).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(first.peer.sessions().is_empty());
        assert!(second.peer.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_dispatches_close_all() {
        let secret = generate_secret();
        let (gate, provider) = pair(&secret, &secret, false).await;
        assert!(eventually(|| gate.peer.sessions().len() == 1).await);

        let closes = Arc::new(AtomicUsize::new(0));
        let seen = closes.clone();
        gate.peer.add_handler(move |_, msg| {
            if matches!(msg, Message::Close { channel_id: CLOSE_ALL }) {
                seen.fetch_add(1, Ordering::SeqCst);
                return true;
            }
            false
        });

        provider.peer.stop().await;
        assert!(eventually(|| closes.load(Ordering::SeqCst) == 1).await);
        assert!(gate.peer.sessions().is_empty());
        assert_eq!(gate.peer.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_hold_reads_pauses_the_session() {
        let secret = generate_secret();
        let (gate, provider) = pair(&secret, &secret, false).await;
        assert!(eventually(|| gate.peer.sessions().len() == 1).await);

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let mut release = Some(release_rx);
        gate.peer.add_handler(move |session, msg| {
            if let (Message::Close { channel_id: 1 }, Some(rx)) = (msg, release.take()) {
                session.hold_reads(async move {
                    let _ = rx.await;
                });
                return true;
            }
            false
        });

        let gate_key = gate.peer.node_key();
        for channel_id in [1, 2] {
            provider
                .peer
                .send(&gate_key, &Message::Close { channel_id })
                .unwrap();
        }
        let seen = |id: ChannelId| {
            gate.hooks
                .messages
                .lock()
                .iter()
                .any(|m| matches!(m, Message::Close { channel_id } if *channel_id == id))
        };
        assert!(eventually(|| seen(1)).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!seen(2));

        release_tx.send(()).unwrap();
        assert!(eventually(|| seen(2)).await);
    }

    #[tokio::test]
    async fn test_send_counts_queued_bytes() {
        let secret = generate_secret();
        let (gate, provider) = pair(&secret, &secret, false).await;
        assert!(eventually(|| provider.peer.sessions().len() == 1).await);

        let session = provider.peer.session(&gate.peer.node_key()).unwrap();
        session.send(&Message::Close { channel_id: 3 }).unwrap();
        // Drains once the writer task has flushed it
        assert!(eventually(|| session.queued_bytes() == 0).await);
        tokio::time::timeout(Duration::from_secs(1), session.writable())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let secret = generate_secret();
        let gate = node(&secret, true, TcpSwarmConfig::default()).await;
        let stranger = PeerKey::from_bytes([9; 32]);
        assert!(matches!(
            gate.peer.send(&stranger, &Message::Close { channel_id: 1 }),
            Err(PeerError::PeerNotFound(key)) if key == stranger
        ));

        gate.peer.stop().await;
        assert!(gate.peer.is_stopped());
        gate.peer.stop().await;
    }
}
