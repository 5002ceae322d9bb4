//! Ingress policy documents and rule lookup
//!
//! A policy is `{defaults?, ips?}` where `ips` maps an address pattern
//! (exact address, CIDR range or `*`) to a rule. Pattern order is
//! significant: the first matching pattern wins. Policies are assembled by
//! deep-merging any number of partial JSON documents.

use crate::routing::Protocol;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Keys never merged from policy documents
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "prototype", "constructor"];

/// Ingress policy errors
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Policy document must be a JSON object")]
    NotAnObject,

    #[error("Invalid policy document: {0}")]
    InvalidDocument(#[from] serde_json::Error),

    #[error("Invalid policy rule: {0}")]
    InvalidRule(String),

    #[error("IP address is required for policy lookup")]
    EmptyAddress,
}

/// Bandwidth limit in megabits per second
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandwidthLimit {
    pub mbps: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_mbps: Option<f64>,
}

/// Inclusive port range, serialized as `[low, high]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange(pub u16, pub u16);

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.0 && port <= self.1
    }
}

/// A single ingress rule
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// A resolved rule without `allow: true` denies the connection
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub bandwidth_limit: Option<BandwidthLimit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_ports: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_ports: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_protocols: Option<Vec<Protocol>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_protocols: Option<Vec<Protocol>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    /// Expiry as unix epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<i64>,
}

impl IngressRule {
    pub fn allowing() -> Self {
        Self {
            allow: true,
            ..Default::default()
        }
    }

    pub fn denying() -> Self {
        Self::default()
    }

    pub fn with_bandwidth(mut self, mbps: f64, burst_mbps: Option<f64>) -> Self {
        self.bandwidth_limit = Some(BandwidthLimit { mbps, burst_mbps });
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.expire_at, Some(at) if at <= now_ms)
    }

    /// Port and protocol filters; an absent query value is never filtered
    fn admits(&self, port: Option<u16>, protocol: Option<Protocol>) -> bool {
        if let Some(port) = port {
            if matches!(self.only_ports, Some(range) if !range.contains(port)) {
                return false;
            }
            if matches!(self.exclude_ports, Some(range) if range.contains(port)) {
                return false;
            }
        }
        if let Some(protocol) = protocol {
            if matches!(&self.only_protocols, Some(list) if !list.contains(&protocol)) {
                return false;
            }
            if matches!(&self.exclude_protocols, Some(list) if list.contains(&protocol)) {
                return false;
            }
        }
        true
    }
}

/// Merged ingress policy
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressPolicy {
    pub defaults: Option<IngressRule>,
    ips: Vec<(String, IngressRule)>,
}

impl IngressPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(mut self, rule: IngressRule) -> Self {
        self.defaults = Some(rule);
        self
    }

    /// Append an IP pattern rule, replacing an existing rule for the same pattern in place
    pub fn with_ip_rule(mut self, pattern: impl Into<String>, rule: IngressRule) -> Self {
        let pattern = pattern.into();
        match self.ips.iter_mut().find(|(p, _)| *p == pattern) {
            Some(slot) => slot.1 = rule,
            None => self.ips.push((pattern, rule)),
        }
        self
    }

    pub fn ip_rules(&self) -> &[(String, IngressRule)] {
        &self.ips
    }

    pub fn is_empty(&self) -> bool {
        self.defaults.is_none() && self.ips.is_empty()
    }

    /// Deep-merge partial policy documents in order and prune expired rules
    pub fn parse(documents: &[Value]) -> Result<Self, PolicyError> {
        Self::parse_at(documents, chrono::Utc::now().timestamp_millis())
    }

    pub fn parse_at(documents: &[Value], now_ms: i64) -> Result<Self, PolicyError> {
        let mut merged = Value::Object(Map::new());
        for document in documents {
            match document {
                Value::Null => continue,
                Value::Object(_) => deep_merge(&mut merged, document),
                _ => return Err(PolicyError::NotAnObject),
            }
        }

        let raw: RawPolicy = serde_json::from_value(merged)?;
        let mut policy = raw.into_policy(true).map_err(PolicyError::InvalidRule)?;
        policy.prune_expired(now_ms);
        Ok(policy)
    }

    /// Drop every rule, including `defaults`, whose expiry has passed
    pub fn prune_expired(&mut self, now_ms: i64) {
        if matches!(&self.defaults, Some(rule) if rule.is_expired(now_ms)) {
            self.defaults = None;
        }
        self.ips.retain(|(_, rule)| !rule.is_expired(now_ms));
    }

    pub fn lookup(
        &self,
        ip: &str,
        port: Option<u16>,
        protocol: Option<Protocol>,
        label: Option<&str>,
    ) -> Result<Option<&IngressRule>, PolicyError> {
        self.lookup_at(
            ip,
            port,
            protocol,
            label,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// Resolve the rule applying to a connection
    ///
    /// `Ok(None)` means no rule applies, which is not a deny.
    pub fn lookup_at(
        &self,
        ip: &str,
        port: Option<u16>,
        protocol: Option<Protocol>,
        label: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<&IngressRule>, PolicyError> {
        if let Some(label) = label {
            let labelled = self
                .ips
                .iter()
                .map(|(_, rule)| rule)
                .chain(self.defaults.iter())
                .find(|rule| !rule.is_expired(now_ms) && rule.labels.iter().any(|l| l == label));
            if labelled.is_some() {
                return Ok(labelled);
            }
        }

        if ip.trim().is_empty() {
            return Err(PolicyError::EmptyAddress);
        }

        let normalized = normalize_ip(ip);
        let addr = IpAddr::from_str(&normalized).ok();

        for (pattern, rule) in &self.ips {
            if rule.is_expired(now_ms) || !pattern_matches(pattern, &normalized, addr) {
                continue;
            }
            if !rule.admits(port, protocol) {
                continue;
            }
            return Ok(Some(rule));
        }

        Ok(self.defaults.as_ref().filter(|rule| !rule.is_expired(now_ms)))
    }
}

/// Strip an IPv6 zone suffix and unwrap IPv4-mapped IPv6 addresses
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    let ip = ip.split('%').next().unwrap_or(ip);
    let lower = ip.to_ascii_lowercase();
    if let Some(v4) = lower.strip_prefix("::ffff:") {
        if let Ok(v4) = Ipv4Addr::from_str(v4) {
            return v4.to_string();
        }
    }
    match IpAddr::from_str(ip) {
        Ok(addr) => addr.to_canonical().to_string(),
        Err(_) => ip.to_string(),
    }
}

fn pattern_matches(pattern: &str, normalized: &str, addr: Option<IpAddr>) -> bool {
    if pattern == "*" {
        return true;
    }
    if pattern.contains('/') {
        return match (IpNetwork::parse(pattern), addr) {
            (Some(network), Some(addr)) => network.contains(&addr),
            _ => false,
        };
    }
    let pattern = normalize_ip(pattern);
    match (IpAddr::from_str(&pattern), addr) {
        (Ok(expected), Some(addr)) => expected == addr,
        _ => pattern == normalized,
    }
}

/// CIDR network used for `ips` patterns
#[derive(Debug, Clone, PartialEq)]
struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    fn parse(s: &str) -> Option<Self> {
        let (ip_str, prefix_str) = s.split_once('/')?;
        let addr = IpAddr::from_str(&normalize_ip(ip_str)).ok()?;
        let prefix_len = prefix_str.trim().parse::<u8>().ok()?;
        let max_prefix = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if prefix_len > max_prefix {
            return None;
        }
        Some(Self { addr, prefix_len })
    }

    /// Families never cross-match
    fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(test)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u32 << (32 - self.prefix_len);
                (u32::from(net) & mask) == (u32::from(*test) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(test)) => {
                if self.prefix_len == 0 {
                    return true;
                }
                let mask = !0u128 << (128 - self.prefix_len);
                (u128::from(net) & mask) == (u128::from(*test) & mask)
            }
            _ => false,
        }
    }
}

fn deep_merge(target: &mut Value, source: &Value) {
    let (target_map, source_map) = match (target, source) {
        (Value::Object(t), Value::Object(s)) => (t, s),
        (target, source) => {
            *target = source.clone();
            return;
        }
    };

    for (key, value) in source_map {
        if FORBIDDEN_KEYS.contains(&key.as_str()) {
            warn!("Ignoring forbidden key '{}' in ingress policy", key);
            continue;
        }
        match target_map.get_mut(key) {
            Some(existing) if existing.is_object() && value.is_object() => {
                deep_merge(existing, value)
            }
            _ if value.is_object() => {
                let mut fresh = Value::Object(Map::new());
                deep_merge(&mut fresh, value);
                target_map.insert(key.clone(), fresh);
            }
            _ => {
                target_map.insert(key.clone(), value.clone());
            }
        }
    }
}

#[derive(Deserialize)]
struct RawPolicy {
    #[serde(default)]
    defaults: Option<Value>,
    #[serde(default)]
    ips: Option<Value>,
}

impl RawPolicy {
    /// Build the policy; with `strict` off, unreadable rules are skipped
    fn into_policy(self, strict: bool) -> Result<IngressPolicy, String> {
        let skip = |what: String| {
            if strict {
                Err(what)
            } else {
                warn!("Skipping {}", what);
                Ok(())
            }
        };

        let defaults = match self.defaults {
            None | Some(Value::Null) => None,
            Some(value) => match serde_json::from_value::<IngressRule>(value) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    skip(format!("invalid default rule: {}", e))?;
                    None
                }
            },
        };

        let mut ips = Vec::new();
        match self.ips {
            None | Some(Value::Null) => {}
            Some(Value::Object(rules)) => {
                for (pattern, value) in rules {
                    match serde_json::from_value::<IngressRule>(value) {
                        Ok(rule) => ips.push((pattern, rule)),
                        Err(e) => skip(format!("invalid rule for '{}': {}", pattern, e))?,
                    }
                }
            }
            Some(_) => skip("'ips' that is not an object".to_string())?,
        }

        Ok(IngressPolicy { defaults, ips })
    }
}

/// Lenient: a policy received from a peer keeps every rule it can read
impl<'de> Deserialize<'de> for IngressPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawPolicy::deserialize(deserializer)?
            .into_policy(false)
            .map_err(serde::de::Error::custom)
    }
}

struct OrderedRules<'a>(&'a [(String, IngressRule)]);

impl Serialize for OrderedRules<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (pattern, rule) in self.0 {
            map.serialize_entry(pattern, rule)?;
        }
        map.end()
    }
}

impl Serialize for IngressPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(defaults) = &self.defaults {
            map.serialize_entry("defaults", defaults)?;
        }
        if !self.ips.is_empty() {
            map.serialize_entry("ips", &OrderedRules(&self.ips))?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn policy(doc: Value) -> IngressPolicy {
        IngressPolicy::parse_at(&[doc], NOW).unwrap()
    }

    #[test]
    fn test_label_outranks_ip_match() {
        let p = policy(json!({
            "ips": {
                "10.0.0.1": {"allow": false},
                "*": {"allow": true, "labels": ["vip"], "desc": "vip"}
            }
        }));

        let rule = p.lookup_at("10.0.0.1", None, None, Some("vip"), NOW).unwrap().unwrap();
        assert_eq!(rule.desc.as_deref(), Some("vip"));

        let rule = p.lookup_at("10.0.0.1", None, None, None, NOW).unwrap().unwrap();
        assert!(!rule.allow);
    }

    #[test]
    fn test_unknown_label_falls_through_to_ip() {
        let p = policy(json!({"ips": {"10.0.0.1": {"allow": true, "desc": "ip"}}}));
        let rule = p.lookup_at("10.0.0.1", None, None, Some("nope"), NOW).unwrap().unwrap();
        assert_eq!(rule.desc.as_deref(), Some("ip"));
    }

    #[test]
    fn test_cidr_respects_family() {
        let p = policy(json!({
            "ips": {
                "192.168.0.0/16": {"allow": true, "desc": "v4"},
                "fd00::/8": {"allow": true, "desc": "v6"}
            }
        }));

        let v4 = p.lookup_at("192.168.44.2", None, None, None, NOW).unwrap().unwrap();
        assert_eq!(v4.desc.as_deref(), Some("v4"));
        let v6 = p.lookup_at("fd12::1", None, None, None, NOW).unwrap().unwrap();
        assert_eq!(v6.desc.as_deref(), Some("v6"));
        assert!(p.lookup_at("10.1.1.1", None, None, None, NOW).unwrap().is_none());
        assert!(p.lookup_at("2001:db8::1", None, None, None, NOW).unwrap().is_none());
    }

    #[test]
    fn test_zone_and_mapped_addresses_normalize() {
        let p = policy(json!({
            "ips": {
                "127.0.0.1": {"allow": true, "desc": "loopback"},
                "fe80::1": {"allow": true, "desc": "link-local"}
            }
        }));

        let mapped = p.lookup_at("::ffff:127.0.0.1", None, None, None, NOW).unwrap().unwrap();
        assert_eq!(mapped.desc.as_deref(), Some("loopback"));
        let zoned = p.lookup_at("fe80::1%eth0", None, None, None, NOW).unwrap().unwrap();
        assert_eq!(zoned.desc.as_deref(), Some("link-local"));
    }

    #[test]
    fn test_filter_mismatch_continues_to_next_rule() {
        let p = policy(json!({
            "ips": {
                "10.0.0.0/8": {"allow": true, "onlyPorts": [8000, 8100], "desc": "ports"},
                "10.0.0.5": {"allow": true, "excludeProtocols": ["udp"], "desc": "tcp-only"},
                "*": {"allow": false, "desc": "rest"}
            }
        }));

        let hit = |port, proto| {
            p.lookup_at("10.0.0.5", Some(port), Some(proto), None, NOW)
                .unwrap()
                .and_then(|r| r.desc.clone())
        };
        assert_eq!(hit(8080, Protocol::Tcp).as_deref(), Some("ports"));
        assert_eq!(hit(9000, Protocol::Tcp).as_deref(), Some("tcp-only"));
        assert_eq!(hit(9000, Protocol::Udp).as_deref(), Some("rest"));
    }

    #[test]
    fn test_defaults_and_no_policy() {
        let p = policy(json!({"defaults": {"allow": true, "bandwidthLimit": {"mbps": 10}}}));
        let rule = p.lookup_at("1.2.3.4", None, None, None, NOW).unwrap().unwrap();
        assert_eq!(rule.bandwidth_limit.unwrap().mbps, 10.0);

        let empty = IngressPolicy::new();
        assert!(empty.lookup_at("1.2.3.4", None, None, None, NOW).unwrap().is_none());
        assert!(matches!(
            empty.lookup_at("", None, None, None, NOW),
            Err(PolicyError::EmptyAddress)
        ));
    }

    #[test]
    fn test_expired_rules_are_pruned_including_defaults() {
        let p = policy(json!({
            "defaults": {"allow": true, "expireAt": NOW - 1},
            "ips": {
                "1.1.1.1": {"allow": true, "expireAt": NOW - 1000},
                "2.2.2.2": {"allow": true, "expireAt": NOW + 60_000}
            }
        }));
        assert!(p.defaults.is_none());
        assert_eq!(p.ip_rules().len(), 1);
        assert!(p.lookup_at("1.1.1.1", None, None, None, NOW).unwrap().is_none());

        // A rule that expires after parsing no longer surfaces either
        let later = NOW + 120_000;
        assert!(p.lookup_at("2.2.2.2", None, None, None, later).unwrap().is_none());
    }

    #[test]
    fn test_merge_overrides_and_preserves_order() {
        let base = json!({
            "defaults": {"allow": true, "bandwidthLimit": {"mbps": 5}},
            "ips": {"10.0.0.1": {"allow": false}, "*": {"allow": true}}
        });
        let overlay = json!({
            "defaults": {"bandwidthLimit": {"burstMbps": 20}},
            "ips": {"10.0.0.1": {"allow": true, "labels": ["x"]}}
        });
        let p = IngressPolicy::parse_at(&[base, overlay], NOW).unwrap();

        let defaults = p.defaults.as_ref().unwrap();
        assert!(defaults.allow);
        assert_eq!(
            defaults.bandwidth_limit,
            Some(BandwidthLimit { mbps: 5.0, burst_mbps: Some(20.0) })
        );
        let patterns: Vec<_> = p.ip_rules().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(patterns, vec!["10.0.0.1", "*"]);
        assert!(p.ip_rules()[0].1.allow);
    }

    #[test]
    fn test_forbidden_keys_are_ignored() {
        let doc: Value = serde_json::from_str(
            r#"{"__proto__": {"allow": true}, "ips": {"constructor": {"allow": true}, "1.1.1.1": {"allow": true}}}"#,
        )
        .unwrap();
        let p = policy(doc);
        let patterns: Vec<_> = p.ip_rules().iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(patterns, vec!["1.1.1.1"]);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        assert!(matches!(
            IngressPolicy::parse_at(&[json!([1, 2])], NOW),
            Err(PolicyError::NotAnObject)
        ));
    }

    #[test]
    fn test_received_policy_skips_unreadable_rules() {
        let policy: IngressPolicy = serde_json::from_value(json!({
            "defaults": {"allow": "sometimes"},
            "ips": {
                "10.0.0.1": {"allow": true},
                "10.0.0.2": {"allow": true, "onlyPorts": "all of them"},
                "10.0.0.3": {"allow": false}
            }
        }))
        .unwrap();

        assert!(policy.defaults.is_none());
        let patterns: Vec<_> = policy.ip_rules().iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(patterns, ["10.0.0.1", "10.0.0.3"]);

        let odd: IngressPolicy = serde_json::from_value(json!({"ips": [1, 2]})).unwrap();
        assert!(odd.is_empty());
    }

    #[test]
    fn test_configured_policy_rejects_unreadable_rules() {
        let result = IngressPolicy::parse_at(
            &[json!({"ips": {"10.0.0.2": {"allow": true, "onlyPorts": "all of them"}}})],
            NOW,
        );
        assert!(matches!(result, Err(PolicyError::InvalidRule(msg)) if msg.contains("10.0.0.2")));
    }

    #[test]
    fn test_serialize_keeps_pattern_order() {
        let p = IngressPolicy::new()
            .with_ip_rule("b", IngressRule::allowing())
            .with_ip_rule("a", IngressRule::denying());
        let text = serde_json::to_string(&p).unwrap();
        assert!(text.find("\"b\"").unwrap() < text.find("\"a\"").unwrap());
        let back: IngressPolicy = serde_json::from_str(&text).unwrap();
        assert_eq!(back, p);
    }
}
