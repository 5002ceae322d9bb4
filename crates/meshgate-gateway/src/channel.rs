//! Gateway side of a channel: one accepted client connection
//!
//! A channel starts `Pending` while the gateway looks for a provider. Client
//! bytes read in that phase are held in a [`PendingBuffer`] and flushed,
//! coalesced, ahead of the first chunk sent once a route is attached.

use bytes::{Bytes, BytesMut};
use meshgate_control::{Peer, PeerError, RateLimiter};
use meshgate_net::SocketHandle;
use meshgate_proto::{
    ChannelFingerprint, ChannelId, ChannelIdAllocator, IngressRule, Message, PeerKey, Protocol,
};
use parking_lot::Mutex;
use serde_json::json;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::GatewayError;

/// Bytes a channel may hold before a route is found (150 MiB)
pub const MAX_PENDING_BYTES: usize = 150 * 1024 * 1024;

/// Client bytes read before a route exists
#[derive(Debug)]
pub struct PendingBuffer {
    chunks: Vec<Bytes>,
    size: usize,
    limit: usize,
}

impl PendingBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            chunks: Vec::new(),
            size: 0,
            limit,
        }
    }

    /// Hold a chunk; on overflow everything held is discarded
    pub fn push(&mut self, channel_id: ChannelId, data: Bytes) -> Result<(), GatewayError> {
        let size = self.size + data.len();
        if size > self.limit {
            self.clear();
            return Err(GatewayError::BufferOverflow { channel_id, size });
        }
        self.size = size;
        self.chunks.push(data);
        Ok(())
    }

    /// Everything held as one chunk
    pub fn take(&mut self) -> Option<Bytes> {
        let merged = match self.chunks.len() {
            0 => return None,
            1 => self.chunks.pop(),
            _ => {
                let mut merged = BytesMut::with_capacity(self.size);
                for chunk in self.chunks.drain(..) {
                    merged.extend_from_slice(&chunk);
                }
                Some(merged.freeze())
            }
        };
        self.size = 0;
        merged
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }

    /// Bytes held
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Pending,
    Accepted,
    Closed { accepted: bool },
}

struct ChannelState {
    phase: ChannelPhase,
    buffer: PendingBuffer,
    route: Option<PeerKey>,
    limiter: Option<RateLimiter>,
    expires_at: Instant,
    bytes_in: u64,
    bytes_out: u64,
}

pub struct Channel {
    id: ChannelId,
    gate_port: u16,
    protocol: Protocol,
    source: SocketAddr,
    fingerprint: ChannelFingerprint,
    idle: Duration,
    peer: Peer,
    ids: Arc<ChannelIdAllocator>,
    socket: OnceLock<SocketHandle>,
    state: Mutex<ChannelState>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        gate_port: u16,
        source: SocketAddr,
        fingerprint: ChannelFingerprint,
        idle: Duration,
        max_pending_bytes: usize,
        peer: Peer,
        ids: Arc<ChannelIdAllocator>,
    ) -> Self {
        Self {
            id,
            gate_port,
            protocol: fingerprint.protocol,
            source,
            fingerprint,
            idle,
            peer,
            ids,
            socket: OnceLock::new(),
            state: Mutex::new(ChannelState {
                phase: ChannelPhase::Pending,
                buffer: PendingBuffer::new(max_pending_bytes),
                route: None,
                limiter: None,
                expires_at: Instant::now() + idle,
                bytes_in: 0,
                bytes_out: 0,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn gate_port(&self) -> u16 {
        self.gate_port
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn fingerprint(&self) -> &ChannelFingerprint {
        &self.fingerprint
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn phase(&self) -> ChannelPhase {
        self.state.lock().phase
    }

    pub fn route(&self) -> Option<PeerKey> {
        self.state.lock().route
    }

    pub fn is_alive(&self) -> bool {
        !matches!(self.phase(), ChannelPhase::Closed { .. })
    }

    /// Past its idle deadline, or its socket has gone away
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.socket.get().is_some_and(|s| s.is_closed()) {
            return true;
        }
        self.state.lock().expires_at <= now
    }

    pub(crate) fn attach_socket(&self, socket: SocketHandle) {
        let socket = self.socket.get_or_init(|| socket);
        if !self.is_alive() {
            socket.end();
        }
    }

    /// Bind the channel to a provider that confirmed the open
    ///
    /// False if the channel closed while the open was in flight.
    pub(crate) fn attach_route(&self, route: PeerKey, rule: Option<&IngressRule>) -> bool {
        let mut state = self.state.lock();
        if state.phase != ChannelPhase::Pending {
            return false;
        }
        state.route = Some(route);
        state.limiter = Some(RateLimiter::new(self.id, rule));
        state.phase = ChannelPhase::Accepted;
        true
    }

    /// Pass client bytes (or a flush request) through the rate limiter
    pub fn pipe_data(self: &Arc<Self>, data: Option<Bytes>) {
        let limiter = self.state.lock().limiter.clone();
        let channel = self.clone();
        let deliver = move |data: Option<Bytes>| channel.forward(data);

        let accepted = match limiter {
            Some(limiter) => limiter.handle(data, deliver),
            None => {
                deliver(data);
                true
            }
        };

        if !accepted && self.is_alive() {
            warn!("Channel {} exceeded its bandwidth burst, closing", self.id);
            self.close();
        }
    }

    fn forward(&self, data: Option<Bytes>) {
        let mut state = self.state.lock();
        if matches!(state.phase, ChannelPhase::Closed { .. }) {
            return;
        }
        state.expires_at = Instant::now() + self.idle;

        let Some(route) = state.route else {
            let Some(data) = data else { return };
            if let Err(e) = state.buffer.push(self.id, data) {
                drop(state);
                warn!("{}, closing", e);
                self.close();
            }
            return;
        };

        let outgoing = state.buffer.take().into_iter().chain(data);
        let mut failed = None;
        for chunk in outgoing {
            state.bytes_out += chunk.len() as u64;
            let sent = self
                .peer
                .session(&route)
                .ok_or(PeerError::PeerNotFound(route))
                .and_then(|session| session.send_stream(self.id, chunk));
            if let Err(e) = sent {
                failed = Some(e);
                break;
            }
        }
        drop(state);

        if let Some(e) = failed {
            debug!("Channel {} lost its route: {}", self.id, e);
            self.close();
        }
    }

    /// Resolves once the route can take more client bytes
    ///
    /// Pending channels return at once; their buffer has its own cap.
    pub(crate) fn route_writable(&self) -> impl Future<Output = ()> + Send + 'static {
        let session = self.route().and_then(|route| self.peer.session(&route));
        async move {
            if let Some(session) = session {
                session.writable().await;
            }
        }
    }

    /// A wait for the client socket to drain, if it is behind
    pub(crate) fn congestion(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        self.socket
            .get()
            .filter(|socket| socket.is_congested())
            .map(|socket| socket.writable())
    }

    /// Bytes from the provider for the client
    pub(crate) fn write_inbound(&self, data: Bytes) {
        {
            let mut state = self.state.lock();
            state.expires_at = Instant::now() + self.idle;
            state.bytes_in += data.len() as u64;
        }
        if let Some(socket) = self.socket.get() {
            if !socket.write(data) {
                self.close();
            }
        }
    }

    /// Tear the channel down; safe to call more than once
    pub fn close(&self) {
        let (route, limiter) = {
            let mut state = self.state.lock();
            let accepted = match state.phase {
                ChannelPhase::Closed { .. } => return,
                phase => phase == ChannelPhase::Accepted,
            };
            state.phase = ChannelPhase::Closed { accepted };
            state.buffer.clear();
            (state.route, state.limiter.clone())
        };

        if let Some(limiter) = limiter {
            limiter.close();
        }
        if let Some(route) = route {
            let _ = self.peer.send(&route, &Message::Close { channel_id: self.id });
        }
        if let Some(socket) = self.socket.get() {
            socket.end();
        }
        self.ids.release(self.id);
        debug!("Channel {} closed (gate port {})", self.id, self.gate_port);
    }

    /// Diagnostic record logged with the periodic stats
    pub fn snapshot(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "channelId": self.id,
            "gatePort": self.gate_port,
            "protocol": self.protocol,
            "phase": format!("{:?}", state.phase),
            "route": state.route.map(|r| r.short()),
            "pendingBytes": state.buffer.len(),
            "bytesIn": state.bytes_in,
            "bytesOut": state.bytes_out,
            "fingerprint": self.fingerprint,
            "limiter": state.limiter.as_ref().map(|l| l.stats()),
        })
    }
}
