//! Service and route advertisement types

use crate::ingress::IngressPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Transport protocol of a gate or backend service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("Unknown protocol: {}", other)),
        }
    }
}

/// A backend service a provider exposes under a gate port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub gate_port: u16,
    pub service_host: String,
    pub service_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
}

impl Service {
    pub fn new(gate_port: u16, service_host: impl Into<String>, service_port: u16) -> Self {
        Self {
            gate_port,
            service_host: service_host.into(),
            service_port,
            protocol: Protocol::Tcp,
            tags: None,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            gate_port: self.gate_port,
            service_host: self.service_host.clone(),
            protocol: self.protocol,
            tags: self.tags.clone(),
        }
    }

    /// Space-separated tags as a list
    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .as_deref()
            .map(|t| t.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// Identity of a routing entry on the gateway side
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub gate_port: u16,
    pub service_host: String,
    pub protocol: Protocol,
    pub tags: Option<String>,
}

/// One advertised service together with the advertiser's ingress policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvertisedService {
    #[serde(flatten)]
    pub service: Service,
    #[serde(default)]
    pub ingress_policy: IngressPolicy,
}

/// Body of an `advRoutes` message
///
/// Unknown top-level fields are preserved so newer nodes can attach
/// metadata without breaking older ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteAdvertisement {
    #[serde(default)]
    pub routes: Vec<AdvertisedService>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RouteAdvertisement {
    pub fn new(routes: Vec<AdvertisedService>) -> Self {
        Self {
            routes,
            extra: serde_json::Map::new(),
        }
    }
}
