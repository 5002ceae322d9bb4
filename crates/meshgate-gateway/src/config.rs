//! Gateway configuration

use meshgate_auth::StretchParams;
use meshgate_control::PeerConfig;
use meshgate_net::idle_duration;
use meshgate_proto::Protocol;
use meshgate_router::ROUTE_TTL;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::channel::MAX_PENDING_BYTES;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub peer: PeerConfig,
    /// Address every gate listens on
    pub listen_ip: IpAddr,
    /// How long to wait for a provider to confirm an `open`
    pub open_timeout: Duration,
    /// Give up finding a route for a channel after this long
    pub route_timeout: Duration,
    pub retry_backoff: Duration,
    pub idle_check_interval: Duration,
    pub stats_interval: Duration,
    /// Bytes a channel may buffer before it has a route
    pub max_pending_bytes: usize,
    pub route_ttl: Duration,
    pub tcp_idle: Duration,
    pub udp_idle: Duration,
}

impl GatewayConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            peer: PeerConfig::new(secret, true),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            open_timeout: Duration::from_secs(5),
            route_timeout: Duration::from_secs(5 * 60),
            retry_backoff: Duration::from_millis(100),
            idle_check_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(10 * 60),
            max_pending_bytes: MAX_PENDING_BYTES,
            route_ttl: ROUTE_TTL,
            tcp_idle: idle_duration(Protocol::Tcp),
            udp_idle: idle_duration(Protocol::Udp),
        }
    }

    pub fn with_listen_ip(mut self, ip: IpAddr) -> Self {
        self.listen_ip = ip;
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

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
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

    pub fn with_max_pending_bytes(mut self, bytes: usize) -> Self {
        self.max_pending_bytes = bytes;
        self
    }

    pub fn idle_for(&self, protocol: Protocol) -> Duration {
        match protocol {
            Protocol::Tcp => self.tcp_idle,
            Protocol::Udp => self.udp_idle,
        }
    }
}
