//! ServiceProvider: advertises backends and bridges channels to them

use async_trait::async_trait;
use bytes::Bytes;
use meshgate_auth::StretchParams;
use meshgate_control::{
    FingerprintSink, Peer, PeerConfig, PeerError, PeerHooks, PolicyOverrides, Session,
};
use meshgate_net::{idle_duration, spawn_socket, ChannelSocket};
use meshgate_proto::{
    Action, ChannelFingerprint, ChannelId, IngressPolicy, Message, PeerKey, Protocol,
    RouteAdvertisement, Service, CLOSE_ALL,
};
use meshgate_transport::Swarm;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::channel::BackendChannel;
use crate::registry::ServiceRegistry;
use crate::ProviderError;

/// How long to wait for a backend to accept; matches the gateway's open timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Provider configuration
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub peer: PeerConfig,
    pub services: Vec<Service>,
    /// Ingress policy documents, merged in order
    pub policy_documents: Vec<Value>,
    pub dial_timeout: Duration,
    pub idle_check_interval: Duration,
    pub tcp_idle: Duration,
    pub udp_idle: Duration,
}

impl ProviderConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            peer: PeerConfig::new(secret, false),
            services: Vec::new(),
            policy_documents: Vec::new(),
            dial_timeout: DIAL_TIMEOUT,
            idle_check_interval: Duration::from_secs(60),
            tcp_idle: idle_duration(Protocol::Tcp),
            udp_idle: idle_duration(Protocol::Udp),
        }
    }

    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_policy_document(mut self, document: Value) -> Self {
        self.policy_documents.push(document);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.peer = self.peer.with_refresh_interval(interval);
        self
    }

    pub fn with_stretch(mut self, params: StretchParams) -> Self {
        self.peer = self.peer.with_stretch(params);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_idle_check_interval(mut self, interval: Duration) -> Self {
        self.idle_check_interval = interval;
        self
    }

    pub fn with_idle(mut self, protocol: Protocol, idle: Duration) -> Self {
        match protocol {
            Protocol::Tcp => self.tcp_idle = idle,
            Protocol::Udp => self.udp_idle = idle,
        }
        self
    }

    pub fn idle_for(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Tcp => self.tcp_idle,
            Protocol::Udp => self.udp_idle,
        }
    }
}

/// Optional collaborators of a provider
#[derive(Clone, Default)]
pub struct ProviderExtensions {
    pub fingerprints: Option<Arc<dyn FingerprintSink>>,
    pub overrides: Option<Arc<dyn PolicyOverrides>>,
}

impl ProviderExtensions {
    pub fn with_fingerprint_sink(mut self, sink: Arc<dyn FingerprintSink>) -> Self {
        self.fingerprints = Some(sink);
        self
    }

    pub fn with_policy_overrides(mut self, overrides: Arc<dyn PolicyOverrides>) -> Self {
        self.overrides = Some(overrides);
        self
    }
}

type ChannelTable = HashMap<PeerKey, HashMap<ChannelId, Arc<BackendChannel>>>;

/// Opens still dialing their backend, one token per (gateway, channel id)
type OpeningTable = HashMap<(PeerKey, ChannelId), CancellationToken>;

struct ProviderShared {
    me: Weak<ProviderShared>,
    config: ProviderConfig,
    peer: Peer,
    registry: Mutex<ServiceRegistry>,
    documents: Mutex<Vec<Value>>,
    policy: Mutex<Arc<IngressPolicy>>,
    extensions: ProviderExtensions,
    /// Locked before `channels` when both are needed
    opening: Mutex<OpeningTable>,
    channels: Mutex<ChannelTable>,
}

/// A provider node
pub struct ServiceProvider {
    shared: Arc<ProviderShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceProvider {
    /// Join the mesh as a provider and start advertising
    pub async fn start(
        config: ProviderConfig,
        swarm: Arc<dyn Swarm>,
        extensions: ProviderExtensions,
    ) -> Result<Self, ProviderError> {
        let policy = IngressPolicy::parse(&config.policy_documents)?;

        let mut peer_config = config.peer.clone();
        peer_config.is_gate = false;
        let peer = Peer::new(peer_config, swarm).await?;

        let mut registry = ServiceRegistry::new();
        registry.set(config.services.clone());

        let shared = Arc::new_cyclic(|me| ProviderShared {
            me: me.clone(),
            documents: Mutex::new(config.policy_documents.clone()),
            config,
            peer,
            registry: Mutex::new(registry),
            policy: Mutex::new(Arc::new(policy)),
            extensions,
            opening: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        });

        let hooks: Weak<dyn PeerHooks> = Arc::downgrade(&shared) as Weak<dyn PeerHooks>;
        shared.peer.start(hooks).await?;
        let monitor = tokio::spawn(idle_monitor(Arc::downgrade(&shared)));

        info!(
            "Provider {} started on router {}",
            shared.peer.node_key(),
            shared.peer.router_key()
        );

        Ok(Self {
            shared,
            tasks: Mutex::new(vec![monitor]),
        })
    }

    pub fn peer(&self) -> &Peer {
        &self.shared.peer
    }

    pub fn add_service(&self, service: Service) -> Service {
        self.shared.registry.lock().add(service)
    }

    pub fn set_services(&self, services: Vec<Service>) -> Vec<Service> {
        self.shared.registry.lock().set(services)
    }

    pub fn services(&self) -> Vec<Service> {
        self.shared.registry.lock().services().to_vec()
    }

    /// Replace the configured policy documents
    pub fn set_policy_documents(&self, documents: Vec<Value>) -> Result<(), ProviderError> {
        IngressPolicy::parse(&documents)?;
        *self.shared.documents.lock() = documents;
        self.shared.refresh_policy();
        Ok(())
    }

    /// Effective policy advertised with every service
    pub fn policy(&self) -> Arc<IngressPolicy> {
        self.shared.policy.lock().clone()
    }

    /// Rebuild the policy and broadcast the services now
    pub fn advertise(&self) -> usize {
        self.shared.refresh_policy();
        self.shared.advertise()
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().values().map(|c| c.len()).sum()
    }

    /// Opens still waiting on their backend
    pub fn opening_count(&self) -> usize {
        self.shared.opening.lock().len()
    }

    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.peer.stop().await;

        let routes: Vec<PeerKey> = {
            let opening = self.shared.opening.lock();
            let channels = self.shared.channels.lock();
            let mut routes: Vec<PeerKey> = channels.keys().copied().collect();
            routes.extend(opening.keys().map(|(route, _)| *route));
            routes.sort();
            routes.dedup();
            routes
        };
        for route in routes {
            self.shared.close_all(route);
        }
        info!("Provider stopped");
    }
}

impl Drop for ServiceProvider {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerHooks for ProviderShared {
    async fn on_refresh(&self) {
        self.refresh_policy();
        self.advertise();
    }

    fn on_message(&self, session: &Arc<Session>, msg: &Message) {
        let route = session.public_key();
        match msg {
            Message::Open {
                channel_id,
                gate_port,
                fingerprint,
            } => {
                let Some(provider) = self.me.upgrade() else {
                    return;
                };
                let cancel = CancellationToken::new();
                {
                    let mut opening = self.opening.lock();
                    if let Some(superseded) = opening.insert((route, *channel_id), cancel.clone()) {
                        debug!(channel_id, "Open reissued by {}", route.short());
                        superseded.cancel();
                    }
                }
                tokio::spawn(provider.open_channel(
                    session.clone(),
                    *channel_id,
                    *gate_port,
                    fingerprint.clone(),
                    cancel,
                ));
            }
            Message::Stream { channel_id, data } => self.write_channel(session, *channel_id, data),
            Message::Close {
                channel_id: CLOSE_ALL,
            } => self.close_all(route),
            Message::Close { channel_id } => {
                let channel = {
                    let mut opening = self.opening.lock();
                    if let Some(cancel) = opening.remove(&(route, *channel_id)) {
                        debug!(channel_id, "Open cancelled by {}", route.short());
                        cancel.cancel();
                    }
                    self.channels
                        .lock()
                        .get(&route)
                        .and_then(|c| c.get(channel_id))
                        .cloned()
                };
                if let Some(channel) = channel {
                    self.release(&channel, false);
                }
            }
            Message::Error {
                action,
                channel_id,
                error,
            } => {
                debug!(channel_id, "Error reply to {:?} from {}: {}", action, route.short(), error);
            }
            Message::Hello { .. } | Message::AdvRoutes(_) => {}
        }
    }
}

impl ProviderShared {
    fn refresh_policy(&self) {
        let mut documents = self.documents.lock().clone();
        if let Some(overrides) = &self.extensions.overrides {
            documents.push(overrides.overrides());
        }
        match IngressPolicy::parse(&documents) {
            Ok(policy) => *self.policy.lock() = Arc::new(policy),
            Err(e) => warn!("Keeping previous ingress policy: {}", e),
        }
    }

    fn advertisement(&self) -> RouteAdvertisement {
        let policy = self.policy.lock().clone();
        self.registry.lock().advertisement(&policy)
    }

    fn advertise(&self) -> usize {
        let advertisement = self.advertisement();
        let routes = advertisement.routes.len();
        let sent = self.peer.broadcast(&Message::AdvRoutes(advertisement));
        trace!("Broadcast {} routes to {} peers", routes, sent);
        sent
    }

    async fn open_channel(
        self: Arc<Self>,
        session: Arc<Session>,
        channel_id: ChannelId,
        gate_port: u16,
        fingerprint: Option<ChannelFingerprint>,
        cancel: CancellationToken,
    ) {
        let result = self
            .try_open(&session, channel_id, gate_port, fingerprint, &cancel)
            .await;
        self.forget_open(session.public_key(), channel_id, &cancel);

        if let Err(e) = result {
            if matches!(e, ProviderError::OpenCancelled) {
                debug!(channel_id, "Open on gate port {} abandoned by the gateway", gate_port);
                return;
            }
            warn!(channel_id, "Open on gate port {} failed: {}", gate_port, e);
            if let Err(e) = session.send(&Message::error(Action::Open, channel_id, &e)) {
                debug!(channel_id, "Could not report open failure: {}", e);
            }
        }
    }

    /// Drop the pending entry of a finished open
    ///
    /// Tokens are only cancelled under the `opening` lock, and whoever
    /// cancels one also removes or replaces its entry. An uncancelled token
    /// therefore still owns its entry.
    fn forget_open(&self, route: PeerKey, channel_id: ChannelId, cancel: &CancellationToken) {
        let mut opening = self.opening.lock();
        if !cancel.is_cancelled() {
            opening.remove(&(route, channel_id));
        }
    }

    async fn try_open(
        &self,
        session: &Arc<Session>,
        channel_id: ChannelId,
        gate_port: u16,
        fingerprint: Option<ChannelFingerprint>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let protocol = fingerprint.as_ref().map(|f| f.protocol);
        let service = self
            .registry
            .lock()
            .find(gate_port, protocol)
            .cloned()
            .ok_or(ProviderError::ServiceNotFound {
                gate_port,
                protocol,
            })?;

        debug!(
            channel_id,
            "Connect to {}:{} ({})", service.service_host, service.service_port, service.protocol
        );
        let backend_error = |reason: String| ProviderError::BackendConnection {
            host: service.service_host.clone(),
            port: service.service_port,
            reason,
        };
        let dial = tokio::time::timeout(
            self.config.dial_timeout,
            ChannelSocket::connect(service.protocol, &service.service_host, service.service_port),
        );
        let socket = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::OpenCancelled),
            dialed = dial => match dialed {
                Ok(Ok(socket)) => socket,
                Ok(Err(e)) => return Err(backend_error(e.to_string())),
                Err(_) => return Err(backend_error("connect timed out".to_string())),
            },
        };
        let addrs = match (socket.local_addr(), socket.peer_addr()) {
            (Ok(local), Ok(remote)) => (local, remote),
            (Err(e), _) | (_, Err(e)) => return Err(backend_error(e.to_string())),
        };

        if session.is_closed() {
            return Err(PeerError::SessionClosed.into());
        }

        let route = session.public_key();
        let idle = self.config.idle_for(service.protocol);
        let channel = Arc::new(BackendChannel::new(
            channel_id,
            route,
            gate_port,
            service,
            fingerprint,
            addrs,
            idle,
        ));

        // Registration and the cancellation check share the `opening` lock,
        // so a `close` either cancels this open or finds the channel
        let previous = {
            let _opening = self.opening.lock();
            if cancel.is_cancelled() {
                return Err(ProviderError::OpenCancelled);
            }
            self.channels
                .lock()
                .entry(route)
                .or_default()
                .insert(channel_id, channel.clone())
        };
        if let Some(previous) = previous {
            debug!(channel_id, "Replacing channel reopened by {}", route.short());
            self.release(&previous, false);
        }

        // Confirm before the backend can produce bytes for the gateway
        session.send(&Message::Open {
            channel_id,
            gate_port,
            fingerprint: None,
        })?;

        let reader = Arc::downgrade(&channel);
        let closer = Arc::downgrade(&channel);
        let provider = self.me.clone();
        let on_close = self.me.clone();
        let socket = spawn_socket(
            socket,
            move |data| {
                let gateway = match (reader.upgrade(), provider.upgrade()) {
                    (Some(channel), Some(provider)) => {
                        provider.forward(&channel, data);
                        provider.peer.session(&channel.route())
                    }
                    _ => None,
                };
                async move {
                    if let Some(session) = gateway {
                        session.writable().await;
                    }
                }
            },
            move |err| {
                if let (Some(channel), Some(provider)) = (closer.upgrade(), on_close.upgrade()) {
                    if let Some(e) = err {
                        debug!(channel_id = channel.id(), "Backend socket error: {}", e);
                    }
                    provider.release(&channel, true);
                }
            },
        );
        channel.attach_socket(socket);
        Ok(())
    }

    /// Backend bytes to the gateway
    fn forward(&self, channel: &BackendChannel, data: Bytes) {
        if !channel.is_alive() {
            return;
        }
        channel.touch();
        self.register_fingerprint(channel);

        let sent = self
            .peer
            .session(&channel.route())
            .ok_or(PeerError::PeerNotFound(channel.route()))
            .and_then(|session| session.send_stream(channel.id(), data));
        if let Err(e) = sent {
            debug!(channel_id = channel.id(), "Gateway unreachable: {}", e);
            self.release(channel, false);
        }
    }

    /// Gateway bytes to the backend
    fn write_channel(&self, session: &Session, channel_id: ChannelId, data: &Bytes) {
        let channel = self
            .channels
            .lock()
            .get(&session.public_key())
            .and_then(|c| c.get(&channel_id))
            .cloned();
        let Some(channel) = channel else {
            trace!(channel_id, "Stream for unknown channel");
            return;
        };

        self.register_fingerprint(&channel);
        if !channel.write(data.clone()) {
            self.release(&channel, true);
            return;
        }
        if let Some(drained) = channel.congestion() {
            session.hold_reads(drained);
        }
    }

    fn register_fingerprint(&self, channel: &BackendChannel) {
        let Some(sink) = &self.extensions.fingerprints else {
            return;
        };
        if !channel.is_alive() {
            return;
        }
        if let Some(registration) = channel.registration() {
            channel.set_registration(sink.register(&registration));
        }
    }

    /// Close a channel; `notify` tells the gateway
    fn release(&self, channel: &BackendChannel, notify: bool) {
        let Some(registration) = channel.shutdown() else {
            return;
        };

        {
            let mut channels = self.channels.lock();
            if let Some(table) = channels.get_mut(&channel.route()) {
                if table
                    .get(&channel.id())
                    .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
                {
                    table.remove(&channel.id());
                }
                if table.is_empty() {
                    channels.remove(&channel.route());
                }
            }
        }

        if let (Some(sink), Some(key)) = (&self.extensions.fingerprints, registration) {
            sink.unregister(&key);
        }
        if notify {
            let _ = self.peer.send(
                &channel.route(),
                &Message::Close {
                    channel_id: channel.id(),
                },
            );
        }
        debug!(channel_id = channel.id(), "Backend channel closed");
    }

    fn close_all(&self, route: PeerKey) {
        let channels = {
            let mut opening = self.opening.lock();
            opening.retain(|(owner, _), cancel| {
                if *owner == route {
                    cancel.cancel();
                }
                *owner != route
            });
            self.channels.lock().remove(&route).unwrap_or_default()
        };
        if !channels.is_empty() {
            debug!("Closing {} channels of {}", channels.len(), route.short());
        }
        for channel in channels.values() {
            self.release(channel, false);
        }
    }

    fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<Arc<BackendChannel>> = self
            .channels
            .lock()
            .values()
            .flat_map(|c| c.values())
            .filter(|c| c.is_stale(now))
            .cloned()
            .collect();
        for channel in &stale {
            debug!(channel_id = channel.id(), "Channel expired");
            self.release(channel, true);
        }
        stale.len()
    }
}

async fn idle_monitor(shared: Weak<ProviderShared>) {
    loop {
        let Some(interval) = shared.upgrade().map(|s| s.config.idle_check_interval) else {
            return;
        };
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.reap_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_auth::generate_secret;
    use meshgate_control::FingerprintRegistration;
    use meshgate_transport::{TcpSwarm, TcpSwarmConfig};
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Gateway stand-in recording what the provider sends
    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl PeerHooks for Recorder {
        async fn on_refresh(&self) {}

        fn on_message(&self, _session: &Arc<Session>, msg: &Message) {
            self.messages.lock().push(msg.clone());
        }
    }

    impl Recorder {
        fn find(&self, f: impl Fn(&Message) -> bool) -> Option<Message> {
            self.messages.lock().iter().find(|m| f(m)).cloned()
        }
    }

    struct Harness {
        gate: Peer,
        recorder: Arc<Recorder>,
        provider: ServiceProvider,
    }

    impl Harness {
        async fn start(config: ProviderConfig, extensions: ProviderExtensions) -> Self {
            let secret = config.peer.secret.clone();
            let swarm = TcpSwarm::bind(
                TcpSwarmConfig::default().with_listen("127.0.0.1:0".parse().unwrap()),
            )
            .await
            .unwrap();
            let addr = swarm.local_addr().unwrap();
            let gate = Peer::new(
                PeerConfig::new(secret, true)
                    .with_refresh_interval(Duration::from_millis(100))
                    .with_stretch(StretchParams::new(64, 1)),
                Arc::new(swarm),
            )
            .await
            .unwrap();
            let recorder = Arc::new(Recorder::default());
            gate.start(Arc::downgrade(&recorder) as Weak<dyn PeerHooks>)
                .await
                .unwrap();

            let swarm = TcpSwarm::bind(TcpSwarmConfig::default().with_bootstrap(addr))
                .await
                .unwrap();
            let provider = ServiceProvider::start(config, Arc::new(swarm), extensions)
                .await
                .unwrap();

            let harness = Self {
                gate,
                recorder,
                provider,
            };
            assert!(eventually(|| harness.gate.sessions().len() == 1).await);
            harness
        }

        fn provider_key(&self) -> PeerKey {
            self.provider.peer().node_key()
        }

        fn send(&self, msg: Message) {
            self.gate.send(&self.provider_key(), &msg).unwrap();
        }
    }

    fn config(secret: &str) -> ProviderConfig {
        ProviderConfig::new(secret)
            .with_refresh_interval(Duration::from_millis(100))
            .with_stretch(StretchParams::new(64, 1))
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

    /// Backend answering "hello" with "world" and echoing anything else
    async fn backend() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (closed_tx, closed_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let closed = closed_tx.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) if &buf[..n] == b"hello" => {
                                let _ = stream.write_all(b"world").await;
                            }
                            Ok(n) => {
                                let _ = stream.write_all(&buf[..n]).await;
                            }
                        }
                    }
                    let _ = closed.send(());
                });
            }
        });
        (addr, closed_rx)
    }

    #[tokio::test]
    async fn test_advertises_services_with_policy() {
        let secret = generate_secret();
        let harness = Harness::start(
            config(&secret)
                .with_service(Service::new(9000, "127.0.0.1", 8080))
                .with_policy_document(json!({"defaults": {"allow": true}})),
            ProviderExtensions::default(),
        )
        .await;

        assert!(eventually(|| harness
            .recorder
            .find(|m| matches!(m, Message::AdvRoutes(adv) if adv.routes.len() == 1))
            .is_some())
        .await);
        let Some(Message::AdvRoutes(adv)) = harness
            .recorder
            .find(|m| matches!(m, Message::AdvRoutes(_)))
        else {
            unreachable!()
        };
        assert_eq!(adv.routes[0].service.gate_port, 9000);
        assert!(adv.routes[0].ingress_policy.defaults.as_ref().unwrap().allow);
    }

    #[tokio::test]
    async fn test_open_for_unknown_port_is_rejected() {
        let secret = generate_secret();
        let harness = Harness::start(config(&secret), ProviderExtensions::default()).await;

        harness.send(Message::Open {
            channel_id: 5,
            gate_port: 9999,
            fingerprint: None,
        });

        assert!(eventually(|| harness
            .recorder
            .find(|m| matches!(
                m,
                Message::Error { action: Action::Open, channel_id: 5, .. }
            ))
            .is_some())
        .await);
        assert_eq!(harness.provider.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_rejected() {
        let secret = generate_secret();
        // Bind then drop so the port is closed
        let port = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", port)),
            ProviderExtensions::default(),
        )
        .await;

        harness.send(Message::Open {
            channel_id: 2,
            gate_port: 9000,
            fingerprint: None,
        });
        assert!(eventually(|| harness
            .recorder
            .find(|m| matches!(m, Message::Error { channel_id: 2, .. }))
            .is_some())
        .await);
        assert_eq!(harness.provider.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_open_bridges_backend() {
        let secret = generate_secret();
        let (addr, mut closed) = backend().await;
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", addr.port())),
            ProviderExtensions::default(),
        )
        .await;

        harness.send(Message::Open {
            channel_id: 7,
            gate_port: 9000,
            fingerprint: None,
        });
        assert!(eventually(|| harness
            .recorder
            .find(|m| matches!(m, Message::Open { channel_id: 7, .. }))
            .is_some())
        .await);
        assert_eq!(harness.provider.channel_count(), 1);

        harness.send(Message::Stream {
            channel_id: 7,
            data: Bytes::from_static(b"hello"),
        });
        assert!(eventually(|| harness
            .recorder
            .find(|m| matches!(m, Message::Stream { channel_id: 7, data } if data == "world"))
            .is_some())
        .await);

        harness.send(Message::Close { channel_id: 7 });
        assert!(closed.recv().await.is_some());
        assert!(eventually(|| harness.provider.channel_count() == 0).await);
    }

    #[tokio::test]
    async fn test_close_all_tears_down_every_channel() {
        let secret = generate_secret();
        let (addr, mut closed) = backend().await;
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", addr.port())),
            ProviderExtensions::default(),
        )
        .await;

        for channel_id in [1, 2] {
            harness.send(Message::Open {
                channel_id,
                gate_port: 9000,
                fingerprint: None,
            });
        }
        assert!(eventually(|| harness.provider.channel_count() == 2).await);

        harness.send(Message::Close {
            channel_id: CLOSE_ALL,
        });
        assert!(closed.recv().await.is_some());
        assert!(closed.recv().await.is_some());
        assert_eq!(harness.provider.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_close_during_dial_leaves_no_channel() {
        let secret = generate_secret();
        let (addr, _closed) = backend().await;
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", addr.port())),
            ProviderExtensions::default(),
        )
        .await;

        for channel_id in 1..=20 {
            harness.send(Message::Open {
                channel_id,
                gate_port: 9000,
                fingerprint: None,
            });
            harness.send(Message::Close { channel_id });
        }

        assert!(eventually(|| harness.provider.channel_count() == 0
            && harness.provider.opening_count() == 0)
        .await);
        // Dials finishing late must not register anything
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.provider.channel_count(), 0);
        assert!(harness
            .recorder
            .find(|m| matches!(m, Message::Error { .. }))
            .is_none());
    }

    #[tokio::test]
    async fn test_reissued_open_keeps_one_channel() {
        let secret = generate_secret();
        let (addr, _closed) = backend().await;
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", addr.port())),
            ProviderExtensions::default(),
        )
        .await;

        for _ in 0..2 {
            harness.send(Message::Open {
                channel_id: 4,
                gate_port: 9000,
                fingerprint: None,
            });
        }

        assert!(eventually(|| harness.provider.opening_count() == 0).await);
        assert!(eventually(|| harness.provider.channel_count() == 1).await);
        harness.send(Message::Close { channel_id: 4 });
        assert!(eventually(|| harness.provider.channel_count() == 0).await);
    }

    #[derive(Default)]
    struct SinkRecorder {
        registered: Mutex<Vec<FingerprintRegistration>>,
        unregistered: Mutex<Vec<String>>,
    }

    impl FingerprintSink for SinkRecorder {
        fn register(&self, registration: &FingerprintRegistration) -> String {
            self.registered.lock().push(registration.clone());
            format!("key-{}", registration.channel_id)
        }

        fn unregister(&self, key: &str) {
            self.unregistered.lock().push(key.to_string());
        }
    }

    #[tokio::test]
    async fn test_fingerprint_registered_against_backend_socket() {
        let secret = generate_secret();
        let (addr, _closed) = backend().await;
        let sink = Arc::new(SinkRecorder::default());
        let harness = Harness::start(
            config(&secret).with_service(Service::new(9000, "127.0.0.1", addr.port())),
            ProviderExtensions::default().with_fingerprint_sink(sink.clone()),
        )
        .await;

        let fingerprint = ChannelFingerprint::new(
            Protocol::Tcp,
            9000,
            3,
            "203.0.113.9:5555".parse().unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        );
        harness.send(Message::Open {
            channel_id: 3,
            gate_port: 9000,
            fingerprint: Some(fingerprint.clone()),
        });
        assert!(eventually(|| harness.provider.channel_count() == 1).await);
        harness.send(Message::Stream {
            channel_id: 3,
            data: Bytes::from_static(b"ping"),
        });

        assert!(eventually(|| !sink.registered.lock().is_empty()).await);
        let registration = sink.registered.lock()[0].clone();
        assert_eq!(registration.remote, addr);
        assert_eq!(registration.fingerprint, fingerprint);
        assert_eq!(registration.gate_port, 9000);

        harness.send(Message::Close { channel_id: 3 });
        assert!(eventually(|| sink.unregistered.lock().as_slice() == ["key-3"]).await);
    }

    struct StaticOverrides(Value);

    impl PolicyOverrides for StaticOverrides {
        fn overrides(&self) -> Value {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_overrides_merge_after_documents() {
        let secret = generate_secret();
        let overrides = Arc::new(StaticOverrides(json!({
            "ips": {"198.51.100.7": {"allow": true, "labels": ["gateway-unlimited"]}}
        })));
        let harness = Harness::start(
            config(&secret).with_policy_document(json!({"defaults": {"allow": false}})),
            ProviderExtensions::default().with_policy_overrides(overrides),
        )
        .await;

        harness.provider.advertise();
        let policy = harness.provider.policy();
        assert!(policy.lookup("198.51.100.7", None, None, None).unwrap().unwrap().allow);
        assert!(!policy.lookup("198.51.100.8", None, None, None).unwrap().unwrap().allow);
    }

    #[tokio::test]
    async fn test_invalid_policy_documents_are_refused() {
        let secret = generate_secret();
        let harness = Harness::start(config(&secret), ProviderExtensions::default()).await;
        let result = harness
            .provider
            .set_policy_documents(vec![json!({"defaults": {"allow": "maybe"}})]);
        assert!(matches!(result, Err(ProviderError::Policy(_))));
    }
}
