use meshgate_proto::{IngressPolicy, PeerKey, Protocol, RouteAdvertisement, Service};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Routes not re-advertised within this window are dropped
pub const ROUTE_TTL: Duration = Duration::from_secs(60);

/// Routing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("No route for gate port {0}")]
    NotFound(u16),
}

/// One advertising peer for a routing entry
#[derive(Debug, Clone)]
pub struct Route {
    pub peer: PeerKey,
    pub expires_at: Instant,
    pub ingress_policy: Arc<IngressPolicy>,
}

impl Route {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// A service reachable through one or more peers
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    service: Service,
    routes: Vec<Route>,
    cursor: usize,
}

impl RoutingEntry {
    fn new(service: Service) -> Self {
        Self {
            service,
            routes: Vec::new(),
            cursor: 0,
        }
    }

    pub fn service(&self) -> &Service {
        &self.service
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn has_live_route(&self, now: Instant) -> bool {
        self.routes.iter().any(|r| !r.is_expired(now))
    }

    /// Round-robin over the routes, removing expired ones as they are reached
    fn next_route(&mut self, now: Instant) -> Option<&Route> {
        while !self.routes.is_empty() {
            if self.cursor >= self.routes.len() {
                self.cursor = 0;
            }
            let idx = self.cursor;
            if self.routes[idx].is_expired(now) {
                let stale = self.routes.remove(idx);
                debug!(
                    "Evicted expired route via {} for gate port {}",
                    stale.peer.short(),
                    self.service.gate_port
                );
                continue;
            }
            self.cursor = idx + 1;
            return Some(&self.routes[idx]);
        }
        None
    }
}

/// Selection filter; only the gate port is mandatory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteQuery {
    pub gate_port: u16,
    pub service_host: Option<String>,
    pub protocol: Option<Protocol>,
    pub tags: Option<String>,
}

impl RouteQuery {
    pub fn port(gate_port: u16) -> Self {
        Self {
            gate_port,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.service_host = Some(host.into());
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    fn matches(&self, service: &Service) -> bool {
        service.gate_port == self.gate_port
            && self
                .service_host
                .as_ref()
                .map_or(true, |h| *h == service.service_host)
            && self.protocol.map_or(true, |p| p == service.protocol)
            && self.tags.as_ref().map_or(true, |t| Some(t) == service.tags.as_ref())
    }
}

/// Result of a successful selection
#[derive(Debug, Clone)]
pub struct RouteSelection {
    pub route: Route,
    pub service: Service,
}

/// Table of routing entries owned by a gateway
#[derive(Debug)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
    ttl: Duration,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::with_ttl(ROUTE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            ttl,
        }
    }

    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&mut self, peer: PeerKey, advertisement: &RouteAdvertisement) -> usize {
        self.merge_at(peer, advertisement, Instant::now())
    }

    /// Merge an advertisement from `peer`, refreshing its routes
    pub fn merge_at(
        &mut self,
        peer: PeerKey,
        advertisement: &RouteAdvertisement,
        now: Instant,
    ) -> usize {
        let expires_at = now + self.ttl;

        for advertised in &advertisement.routes {
            let key = advertised.service.key();
            let idx = match self.entries.iter().position(|e| e.service.key() == key) {
                Some(idx) => idx,
                None => {
                    debug!(
                        "New routing entry: gate port {} -> {}:{} ({})",
                        advertised.service.gate_port,
                        advertised.service.service_host,
                        advertised.service.service_port,
                        advertised.service.protocol
                    );
                    self.entries.push(RoutingEntry::new(advertised.service.clone()));
                    self.entries.len() - 1
                }
            };

            let entry = &mut self.entries[idx];
            entry.service.service_port = advertised.service.service_port;

            let policy = Arc::new(advertised.ingress_policy.clone());
            match entry.routes.iter_mut().find(|r| r.peer == peer) {
                Some(route) => {
                    route.expires_at = expires_at;
                    route.ingress_policy = policy;
                }
                None => {
                    trace!("Route via {} added for gate port {}", peer.short(), key.gate_port);
                    entry.routes.push(Route {
                        peer,
                        expires_at,
                        ingress_policy: policy,
                    });
                }
            }
        }

        advertisement.routes.len()
    }

    pub fn select(&mut self, query: &RouteQuery) -> Result<RouteSelection, RouteError> {
        self.select_at(query, Instant::now())
    }

    /// First live route among matching entries, round-robin within each entry
    pub fn select_at(
        &mut self,
        query: &RouteQuery,
        now: Instant,
    ) -> Result<RouteSelection, RouteError> {
        for entry in self.entries.iter_mut().filter(|e| query.matches(&e.service)) {
            if let Some(route) = entry.next_route(now) {
                let route = route.clone();
                return Ok(RouteSelection {
                    route,
                    service: entry.service.clone(),
                });
            }
        }
        Err(RouteError::NotFound(query.gate_port))
    }

    /// Drop expired routes and entries left without any
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        for entry in &mut self.entries {
            entry.routes.retain(|r| !r.is_expired(now));
            if entry.cursor > entry.routes.len() {
                entry.cursor = 0;
            }
        }
        self.entries.retain(|e| !e.routes.is_empty());
        before - self.entries.len()
    }

    pub fn retain(&mut self, f: impl FnMut(&RoutingEntry) -> bool) {
        self.entries.retain(f);
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}
