//! Channel fingerprint records sent with `open`

use crate::routing::Protocol;
use crate::ChannelId;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// One side of a channel as seen by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Normalized address (IPv4-mapped IPv6 unwrapped)
    pub ip: String,
    /// Address as reported by the socket
    pub ip_raw: String,
    pub port: u16,
}

impl Endpoint {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip().to_canonical().to_string(),
            ip_raw: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

/// Metadata identifying where a channel came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelFingerprint {
    pub id: String,
    /// Unix epoch milliseconds
    pub opened_at: i64,
    pub protocol: Protocol,
    pub gate_port: u16,
    pub channel_port: ChannelId,
    pub source: Endpoint,
    pub gateway: Endpoint,
}

impl ChannelFingerprint {
    pub fn new(
        protocol: Protocol,
        gate_port: u16,
        channel_id: ChannelId,
        source: SocketAddr,
        gateway: SocketAddr,
    ) -> Self {
        Self {
            id: hex::encode(rand::random::<[u8; 16]>()),
            opened_at: chrono::Utc::now().timestamp_millis(),
            protocol,
            gate_port,
            channel_port: channel_id,
            source: Endpoint::from_addr(source),
            gateway: Endpoint::from_addr(gateway),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_source_is_normalized() {
        let fp = ChannelFingerprint::new(
            Protocol::Udp,
            53,
            9,
            "[::ffff:10.1.2.3]:4000".parse().unwrap(),
            "[::1]:53".parse().unwrap(),
        );
        assert_eq!(fp.id.len(), 32);
        assert_eq!(fp.source.ip, "10.1.2.3");
        assert_eq!(fp.source.ip_raw, "::ffff:10.1.2.3");
        assert_eq!(fp.gateway.ip, "::1");

        let json = serde_json::to_value(&fp).unwrap();
        assert_eq!(json["channelPort"], 9);
        assert_eq!(json["source"]["ipRaw"], "::ffff:10.1.2.3");
    }
}
