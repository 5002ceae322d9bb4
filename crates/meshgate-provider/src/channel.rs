//! Provider side of a channel: one backend connection

use bytes::Bytes;
use meshgate_control::FingerprintRegistration;
use meshgate_net::SocketHandle;
use meshgate_proto::{ChannelFingerprint, ChannelId, PeerKey, Service};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;

struct BackendState {
    alive: bool,
    expires_at: Instant,
    registration: Option<String>,
}

pub struct BackendChannel {
    id: ChannelId,
    route: PeerKey,
    gate_port: u16,
    service: Service,
    fingerprint: Option<ChannelFingerprint>,
    local: SocketAddr,
    remote: SocketAddr,
    idle: Duration,
    socket: OnceLock<SocketHandle>,
    state: Mutex<BackendState>,
}

impl BackendChannel {
    pub(crate) fn new(
        id: ChannelId,
        route: PeerKey,
        gate_port: u16,
        service: Service,
        fingerprint: Option<ChannelFingerprint>,
        (local, remote): (SocketAddr, SocketAddr),
        idle: Duration,
    ) -> Self {
        Self {
            id,
            route,
            gate_port,
            service,
            fingerprint,
            local,
            remote,
            idle,
            socket: OnceLock::new(),
            state: Mutex::new(BackendState {
                alive: true,
                expires_at: Instant::now() + idle,
                registration: None,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Gateway this channel belongs to
    pub fn route(&self) -> PeerKey {
        self.route
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

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

    pub(crate) fn touch(&self) {
        self.state.lock().expires_at = Instant::now() + self.idle;
    }

    /// Write gateway bytes to the backend; false if the socket is gone
    pub(crate) fn write(&self, data: Bytes) -> bool {
        self.touch();
        match self.socket.get() {
            Some(socket) => socket.write(data),
            None => false,
        }
    }

    /// A wait for the backend socket to drain, if it is behind
    pub(crate) fn congestion(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        self.socket
            .get()
            .filter(|socket| socket.is_congested())
            .map(|socket| socket.writable())
    }

    /// Record for the fingerprint resolver, when the gateway sent one
    pub(crate) fn registration(&self) -> Option<FingerprintRegistration> {
        let fingerprint = self.fingerprint.clone()?;
        Some(FingerprintRegistration {
            protocol: self.service.protocol,
            local: self.local,
            remote: self.remote,
            channel_id: self.id,
            gate_port: self.gate_port,
            fingerprint,
            idle: self.idle,
        })
    }

    pub(crate) fn set_registration(&self, key: String) {
        self.state.lock().registration = Some(key);
    }

    /// Mark closed and end the backend socket
    ///
    /// Returns the fingerprint key to unregister, or `None` if the channel
    /// was already closed or never registered.
    pub(crate) fn shutdown(&self) -> Option<Option<String>> {
        let registration = {
            let mut state = self.state.lock();
            if !state.alive {
                return None;
            }
            state.alive = false;
            state.registration.take()
        };
        if let Some(socket) = self.socket.get() {
            socket.end();
        }
        Some(registration)
    }
}
