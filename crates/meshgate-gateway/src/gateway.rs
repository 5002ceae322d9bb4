//! Gateway: gates, routing and channel setup

use async_trait::async_trait;
use meshgate_control::{Peer, PeerHooks, Session};
use meshgate_net::{spawn_socket, ChannelSocket};
use meshgate_proto::{
    Action, ChannelFingerprint, ChannelIdAllocator, IngressRule, Message, PeerKey, Protocol,
    RouteAdvertisement, ServiceKey, CLOSE_ALL,
};
use meshgate_router::{RouteQuery, RoutingTable};
use meshgate_transport::Swarm;
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Channel, ChannelPhase};
use crate::config::GatewayConfig;
use crate::filter::RouteFilter;
use crate::gate::Gate;
use crate::GatewayError;

/// Channel counts across every gate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub gates: usize,
    pub active_channels: usize,
    pub closing_channels: usize,
    pub pending_channels: usize,
    pub routes: usize,
}

struct GatewayShared {
    me: Weak<GatewayShared>,
    config: GatewayConfig,
    peer: Peer,
    routes: Mutex<RoutingTable>,
    gates: Mutex<Vec<Arc<Gate>>>,
    ids: Arc<ChannelIdAllocator>,
    filter: Option<Arc<dyn RouteFilter>>,
    generation: AtomicU64,
}

/// A gateway node
pub struct Gateway {
    shared: Arc<GatewayShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Join the mesh as a gateway and start maintaining gates
    pub async fn start(
        config: GatewayConfig,
        swarm: Arc<dyn Swarm>,
        filter: Option<Arc<dyn RouteFilter>>,
    ) -> Result<Self, GatewayError> {
        let mut peer_config = config.peer.clone();
        peer_config.is_gate = true;
        let peer = Peer::new(peer_config, swarm).await?;

        let shared = Arc::new_cyclic(|me| GatewayShared {
            me: me.clone(),
            routes: Mutex::new(RoutingTable::with_ttl(config.route_ttl)),
            config,
            peer,
            gates: Mutex::new(Vec::new()),
            ids: Arc::new(ChannelIdAllocator::new()),
            filter,
            generation: AtomicU64::new(0),
        });

        let hooks: Weak<dyn PeerHooks> = Arc::downgrade(&shared) as Weak<dyn PeerHooks>;
        shared.peer.start(hooks).await?;

        let tasks = vec![
            tokio::spawn(idle_monitor(Arc::downgrade(&shared))),
            tokio::spawn(stats_reporter(Arc::downgrade(&shared))),
        ];

        info!(
            "Gateway {} started on router {}",
            shared.peer.node_key(),
            shared.peer.router_key()
        );

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn peer(&self) -> &Peer {
        &self.shared.peer
    }

    pub fn gates(&self) -> Vec<Arc<Gate>> {
        self.shared.gates.lock().clone()
    }

    /// Bound address of the gate serving `gate_port`/`protocol`
    pub fn gate_addr(&self, gate_port: u16, protocol: Protocol) -> Option<SocketAddr> {
        self.shared
            .find_gate(gate_port, protocol)
            .map(|g| g.local_addr())
    }

    pub fn stats(&self) -> GatewayStats {
        self.shared.stats()
    }

    /// Run one reconciliation pass now
    pub async fn reconcile(&self) {
        self.shared.reconcile().await;
    }

    /// Leave the mesh and close every gate
    pub async fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.peer.stop().await;

        let gates = std::mem::take(&mut *self.shared.gates.lock());
        for gate in gates {
            gate.close();
        }
        info!("Gateway stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl PeerHooks for GatewayShared {
    async fn on_refresh(&self) {
        self.reconcile().await;
    }

    fn on_message(&self, session: &Arc<Session>, msg: &Message) {
        if let Message::AdvRoutes(advertisement) = msg {
            self.merge_routes(session.public_key(), advertisement);
        }
    }
}

impl GatewayShared {
    fn merge_routes(&self, peer: PeerKey, advertisement: &RouteAdvertisement) {
        let merged = self.routes.lock().merge(peer, advertisement);
        trace!("Merged {} routes from {}", merged, peer.short());
    }

    fn find_gate(&self, gate_port: u16, protocol: Protocol) -> Option<Arc<Gate>> {
        self.gates
            .lock()
            .iter()
            .find(|g| g.gate_port() == gate_port && g.protocol() == protocol)
            .cloned()
    }

    /// Open gates for approved entries and close gates nothing refers to
    async fn reconcile(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let services: Vec<_> = {
            let mut routes = self.routes.lock();
            let expired = routes.prune_expired(Instant::now());
            if expired > 0 {
                debug!("Dropped {} expired routing entries", expired);
            }
            routes.entries().iter().map(|e| e.service().clone()).collect()
        };

        let mut rejected: Vec<ServiceKey> = Vec::new();
        for service in services {
            if let Some(filter) = &self.filter {
                if !filter.approve(&service).await {
                    trace!("Route filtered: gate port {}", service.gate_port);
                    rejected.push(service.key());
                    continue;
                }
            }

            if let Some(gate) = self.find_gate(service.gate_port, service.protocol) {
                gate.touch(generation);
                continue;
            }

            match self.open_gate(service.gate_port, service.protocol, generation).await {
                Ok(gate) => self.gates.lock().push(gate),
                Err(e) => error!(
                    "Failed to open gate {}/{}: {}",
                    service.gate_port, service.protocol, e
                ),
            }
        }

        if !rejected.is_empty() {
            self.routes
                .lock()
                .retain(|e| !rejected.contains(&e.service().key()));
        }

        let stale: Vec<Arc<Gate>> = {
            let mut gates = self.gates.lock();
            let (keep, stale): (Vec<_>, Vec<_>) =
                gates.drain(..).partition(|g| g.generation() == generation);
            *gates = keep;
            stale
        };
        for gate in stale {
            info!("Closing unused gate {} ({})", gate.local_addr(), gate.protocol());
            gate.close();
        }

        for gate in self.gates.lock().iter() {
            gate.prune_closed();
        }
    }

    async fn open_gate(
        &self,
        gate_port: u16,
        protocol: Protocol,
        generation: u64,
    ) -> Result<Arc<Gate>, GatewayError> {
        let gate = Arc::new(
            Gate::bind(self.config.listen_ip, gate_port, protocol, generation).await?,
        );

        let shared = self.me.clone();
        let weak_gate = Arc::downgrade(&gate);
        gate.start(move |socket| {
            if let (Some(shared), Some(gate)) = (shared.upgrade(), weak_gate.upgrade()) {
                shared.accept(&gate, socket);
            }
        });
        Ok(gate)
    }

    fn accept(self: Arc<Self>, gate: &Arc<Gate>, socket: ChannelSocket) {
        let (source, local) = match (socket.peer_addr(), socket.local_addr()) {
            (Ok(source), Ok(local)) => (source, local),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Dropping connection on gate {}: {}", gate.local_addr(), e);
                return;
            }
        };
        let channel_id = match self.ids.allocate() {
            Ok(id) => id,
            Err(e) => {
                error!("Dropping connection from {}: {}", source, e);
                return;
            }
        };

        let protocol = gate.protocol();
        let gate_port = gate.gate_port();
        debug!(channel_id, "Create channel on gate {}", gate_port);

        let channel = Arc::new(Channel::new(
            channel_id,
            gate_port,
            source,
            ChannelFingerprint::new(protocol, gate_port, channel_id, source, local),
            self.config.idle_for(protocol),
            self.config.max_pending_bytes,
            self.peer.clone(),
            self.ids.clone(),
        ));
        gate.add_channel(channel.clone());

        let reader = Arc::downgrade(&channel);
        let closer = Arc::downgrade(&channel);
        let socket = spawn_socket(
            socket,
            move |data| {
                let channel = reader.upgrade();
                async move {
                    if let Some(channel) = channel {
                        channel.pipe_data(Some(data));
                        channel.route_writable().await;
                    }
                }
            },
            move |err| {
                if let Some(channel) = closer.upgrade() {
                    if let Some(e) = err {
                        debug!(channel_id = channel.id(), "Client socket error: {}", e);
                    }
                    channel.close();
                }
            },
        );
        channel.attach_socket(socket);

        tokio::spawn(self.find_route(channel));
    }

    /// Find a provider willing to serve the channel
    async fn find_route(self: Arc<Self>, channel: Arc<Channel>) {
        let started = Instant::now();
        let query = RouteQuery::port(channel.gate_port()).with_protocol(channel.protocol());
        let source_ip = channel.fingerprint().source.ip.clone();

        loop {
            if !channel.is_alive() {
                return;
            }

            let selected = self.routes.lock().select(&query);
            let selection = match selected {
                Ok(selection) => selection,
                Err(e) => {
                    warn!(channel_id = channel.id(), "{}", e);
                    channel.close();
                    return;
                }
            };
            let peer = selection.route.peer;

            let rule = selection
                .route
                .ingress_policy
                .lookup(
                    &source_ip,
                    Some(channel.gate_port()),
                    Some(channel.protocol()),
                    None,
                )
                .unwrap_or_else(|e| {
                    debug!("Ingress lookup failed for {}: {}", source_ip, e);
                    None
                })
                .cloned();
            if matches!(&rule, Some(rule) if !rule.allow) {
                warn!(
                    channel_id = channel.id(),
                    "{} (source {})",
                    GatewayError::RouteDenied(peer),
                    source_ip
                );
                channel.close();
                return;
            }

            match self.request_open(&channel, peer, rule).await {
                Ok(()) => {
                    info!(
                        channel_id = channel.id(),
                        "New gate channel opened: {} -> gate {} ({}) via {}",
                        channel.source(),
                        channel.gate_port(),
                        channel.protocol(),
                        peer.short()
                    );
                    channel.pipe_data(None);
                    return;
                }
                Err(e) => {
                    debug!(channel_id = channel.id(), "Route via {} failed: {}", peer.short(), e);
                    if started.elapsed() > self.config.route_timeout {
                        warn!(channel_id = channel.id(), "Route finding timed out");
                        channel.close();
                        return;
                    }
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// Send `open` to `route` and wait for its confirmation
    ///
    /// The reply handler and the timeout race for `pending`. Whoever takes
    /// the sender decides the outcome. A provider whose answer is no longer
    /// wanted is told to `close` the channel so it releases the backend.
    async fn request_open(
        &self,
        channel: &Arc<Channel>,
        route: PeerKey,
        rule: Option<IngressRule>,
    ) -> Result<(), GatewayError> {
        let (tx, mut rx) = oneshot::channel::<Result<(), GatewayError>>();
        let pending = Arc::new(Mutex::new(Some(tx)));
        let waiting = channel.clone();
        let peer = self.peer.clone();

        let slot = pending.clone();
        self.peer.add_handler(move |session, msg| {
            let mut answer = slot.lock();
            if answer.is_none() {
                return true;
            }
            if session.public_key() != route
                || msg.action() != Action::Open
                || msg.channel_id() != waiting.id()
            {
                return false;
            }

            let outcome = match msg {
                Message::Error { error, .. } => Err(GatewayError::OpenRejected(error.to_string())),
                _ if waiting.attach_route(route, rule.as_ref()) => {
                    attach_pump(&peer, waiting.clone(), route);
                    Ok(())
                }
                _ => {
                    debug!(channel_id = waiting.id(), "Confirmed after the client left");
                    let _ = session.send(&Message::Close {
                        channel_id: waiting.id(),
                    });
                    Err(GatewayError::ChannelClosed)
                }
            };
            if let Some(tx) = answer.take() {
                let _ = tx.send(outcome);
            }
            true
        });

        trace!(channel_id = channel.id(), "Test route {}", route.short());
        if let Err(e) = self.peer.send(
            &route,
            &Message::Open {
                channel_id: channel.id(),
                gate_port: channel.gate_port(),
                fingerprint: Some(channel.fingerprint().clone()),
            },
        ) {
            pending.lock().take();
            return Err(e.into());
        }

        match tokio::time::timeout(self.config.open_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GatewayError::ChannelClosed),
            Err(_) => {
                if pending.lock().take().is_none() {
                    // Answered while the timer fired
                    return rx.try_recv().unwrap_or(Err(GatewayError::ChannelClosed));
                }
                let _ = self.peer.send(
                    &route,
                    &Message::Close {
                        channel_id: channel.id(),
                    },
                );
                Err(GatewayError::OpenTimeout(route))
            }
        }
    }

    fn stats(&self) -> GatewayStats {
        let gates = self.gates.lock().clone();
        let mut stats = GatewayStats {
            gates: gates.len(),
            routes: self.routes.lock().len(),
            ..Default::default()
        };
        for channel in gates.iter().flat_map(|g| g.channels()) {
            match channel.phase() {
                ChannelPhase::Accepted => stats.active_channels += 1,
                ChannelPhase::Closed { accepted: true } => stats.closing_channels += 1,
                ChannelPhase::Pending | ChannelPhase::Closed { accepted: false } => {
                    stats.pending_channels += 1
                }
            }
        }
        stats
    }

    fn log_stats(&self) {
        let stats = self.stats();
        info!(
            gates = stats.gates,
            active = stats.active_channels,
            closing = stats.closing_channels,
            pending = stats.pending_channels,
            routes = stats.routes,
            "Gateway stats"
        );
        let gates = self.gates.lock().clone();
        for channel in gates.iter().flat_map(|g| g.channels()) {
            if channel.is_alive() {
                info!("{}", channel.snapshot());
            }
        }
    }

    /// Close channels whose socket is gone or whose idle deadline passed
    fn reap_idle(&self) -> usize {
        let now = Instant::now();
        let gates = self.gates.lock().clone();
        let mut reaped = 0;
        for gate in gates {
            for channel in gate.channels() {
                if channel.is_alive() && channel.is_stale(now) {
                    debug!(channel_id = channel.id(), "Channel expired");
                    channel.close();
                    reaped += 1;
                }
            }
            gate.prune_closed();
        }
        reaped
    }
}

/// Route provider traffic for `channel` back to its client
fn attach_pump(peer: &Peer, channel: Arc<Channel>, route: PeerKey) {
    peer.add_handler(move |session, msg| {
        if !channel.is_alive() {
            return true;
        }
        if session.public_key() != route {
            return false;
        }
        match msg {
            Message::Stream { channel_id, data } if *channel_id == channel.id() => {
                channel.write_inbound(data.clone());
                if let Some(drained) = channel.congestion() {
                    session.hold_reads(drained);
                }
                false
            }
            Message::Close { channel_id }
                if *channel_id == channel.id() || *channel_id == CLOSE_ALL =>
            {
                debug!(channel_id = channel.id(), "Closed by provider");
                channel.close();
                true
            }
            _ => false,
        }
    });
}

async fn idle_monitor(shared: Weak<GatewayShared>) {
    loop {
        let Some(interval) = shared.upgrade().map(|s| s.config.idle_check_interval) else {
            return;
        };
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let reaped = shared.reap_idle();
        if reaped > 0 {
            debug!("Reaped {} idle channels", reaped);
        }
    }
}

async fn stats_reporter(shared: Weak<GatewayShared>) {
    loop {
        let Some(interval) = shared.upgrade().map(|s| s.config.stats_interval) else {
            return;
        };
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.log_stats();
    }
}
