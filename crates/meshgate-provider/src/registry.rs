//! Services a provider exposes

use meshgate_proto::{AdvertisedService, IngressPolicy, Protocol, RouteAdvertisement, Service};
use tracing::info;

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Vec<Service>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service, returning the existing one when already present
    pub fn add(&mut self, service: Service) -> Service {
        if let Some(existing) = self.services.iter().find(|s| **s == service) {
            info!("Service already registered on gate port {}", service.gate_port);
            return existing.clone();
        }
        info!(
            "Register service {} -> {}:{} ({})",
            service.gate_port, service.service_host, service.service_port, service.protocol
        );
        self.services.push(service.clone());
        service
    }

    /// Replace every service
    pub fn set(&mut self, services: Vec<Service>) -> Vec<Service> {
        self.services.clear();
        for service in services {
            self.add(service);
        }
        self.services.clone()
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// First service on `gate_port`, restricted to `protocol` when known
    pub fn find(&self, gate_port: u16, protocol: Option<Protocol>) -> Option<&Service> {
        self.services
            .iter()
            .filter(|s| s.gate_port == gate_port)
            .find(|s| protocol.map_or(true, |p| p == s.protocol))
    }

    /// One routing fragment per service, each carrying `policy`
    pub fn advertisement(&self, policy: &IngressPolicy) -> RouteAdvertisement {
        RouteAdvertisement::new(
            self.services
                .iter()
                .map(|service| AdvertisedService {
                    service: service.clone(),
                    ingress_policy: policy.clone(),
                })
                .collect(),
        )
    }
}
