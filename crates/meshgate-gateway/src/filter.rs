//! Which advertised services a gateway is willing to expose

use async_trait::async_trait;
use meshgate_proto::{Protocol, Service};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Consulted for every routing entry during reconciliation
#[async_trait]
pub trait RouteFilter: Send + Sync {
    async fn approve(&self, service: &Service) -> bool;
}

/// One filter object; absent fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMatcher {
    #[serde(default)]
    pub gate_port: Option<u16>,
    #[serde(default)]
    pub service_host: Option<String>,
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Space-separated; every tag must be present on the service
    #[serde(default)]
    pub tags: Option<String>,
}

impl ServiceMatcher {
    pub fn matches(&self, service: &Service) -> bool {
        if matches!(self.gate_port, Some(port) if port != service.gate_port) {
            return false;
        }
        if matches!(&self.service_host, Some(host) if *host != service.service_host) {
            return false;
        }
        if matches!(self.service_port, Some(port) if port != service.service_port) {
            return false;
        }
        if matches!(self.protocol, Some(protocol) if protocol != service.protocol) {
            return false;
        }
        if let Some(tags) = &self.tags {
            let have = service.tag_list();
            if !tags.split_whitespace().all(|tag| have.contains(&tag)) {
                return false;
            }
        }
        true
    }
}

/// Approves a service when any matcher does; no matchers approves all
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    matchers: Vec<ServiceMatcher>,
}

impl ServiceFilter {
    pub fn new(matchers: Vec<ServiceMatcher>) -> Self {
        Self { matchers }
    }

    /// Accepts `{"services": [...]}`, a bare array or a single filter object
    pub fn from_document(document: &Value) -> Result<Self, serde_json::Error> {
        let list = document.get("services").unwrap_or(document);
        let matchers = match list {
            Value::Array(_) => serde_json::from_value(list.clone())?,
            _ => vec![serde_json::from_value(list.clone())?],
        };
        Ok(Self::new(matchers))
    }

    pub fn extend(&mut self, other: ServiceFilter) {
        self.matchers.extend(other.matchers);
    }

    pub fn matchers(&self) -> &[ServiceMatcher] {
        &self.matchers
    }

    pub fn matches(&self, service: &Service) -> bool {
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.matches(service))
    }
}

#[async_trait]
impl RouteFilter for ServiceFilter {
    async fn approve(&self, service: &Service) -> bool {
        self.matches(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn web() -> Service {
        Service::new(8080, "web", 80).with_tags("prod http")
    }

    #[test]
    fn test_empty_filter_approves_everything() {
        assert!(ServiceFilter::default().matches(&web()));
    }

    #[test]
    fn test_any_matcher_approves() {
        let filter = ServiceFilter::from_document(&json!([
            {"gatePort": 9000},
            {"serviceHost": "web", "protocol": "tcp"}
        ]))
        .unwrap();
        assert!(filter.matches(&web()));
        assert!(!filter.matches(&Service::new(8081, "db", 5432)));
        assert!(filter.matches(&Service::new(9000, "db", 5432)));
    }

    #[test]
    fn test_tags_must_all_be_present() {
        let filter = ServiceFilter::from_document(&json!({"services": [{"tags": "prod http"}]}))
            .unwrap();
        assert!(filter.matches(&web()));

        let filter = ServiceFilter::from_document(&json!({"tags": "prod grpc"})).unwrap();
        assert!(!filter.matches(&web()));
    }

    #[test]
    fn test_protocol_and_port_mismatch() {
        let filter =
            ServiceFilter::from_document(&json!([{"gatePort": 8080, "protocol": "udp"}])).unwrap();
        assert!(!filter.matches(&web()));
        assert!(filter.matches(&Service::new(8080, "dns", 53).with_protocol(Protocol::Udp)));

        let filter = ServiceFilter::from_document(&json!([{"servicePort": 81}])).unwrap();
        assert!(!filter.matches(&web()));
    }

    #[test]
    fn test_invalid_document() {
        assert!(ServiceFilter::from_document(&json!([{"gatePort": "nope"}])).is_err());
    }
}
