//! Fingerprint resolver
//!
//! Providers register every backend connection that carries a gateway
//! fingerprint. A backend that only sees the provider's address can then
//! ask `GET /resolve` with its own view of the socket tuple and learn where
//! the client really connected from.

use axum::extract::{Query, State};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use meshgate_control::{FingerprintRegistration, FingerprintSink};
use meshgate_proto::ChannelFingerprint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, trace};

use crate::middleware::{require_basic_auth, BasicCredentials};
use crate::models::HealthResponse;
use crate::{normalize_ip, now_ms, ApiError};

/// How often expired records are dropped
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(15);

const MIN_TTL: Duration = Duration::from_secs(120);
const TTL_GRACE: Duration = Duration::from_secs(60);

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub listen: SocketAddr,
    /// `user:pass`; anything without a colon leaves the resolver open
    pub basic_auth: Option<String>,
    pub sweep_interval: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            basic_auth: None,
            sweep_interval: SWEEP_INTERVAL,
        }
    }
}

impl ResolverConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_basic_auth(mut self, credentials: impl Into<String>) -> Self {
        self.basic_auth = Some(credentials.into());
        self
    }
}

/// One registered channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FingerprintRecord {
    pub key: String,
    pub protocol: String,
    pub gate_port: u16,
    pub channel_port: u32,
    pub fingerprint: ChannelFingerprint,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Lookup key: `proto|remote_ip|remote_port|server_ip|server_port`
pub fn tuple_key(
    protocol: &str,
    remote_ip: &str,
    remote_port: u16,
    server_ip: &str,
    server_port: u16,
) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        protocol.to_ascii_lowercase(),
        normalize_ip(remote_ip),
        remote_port,
        normalize_ip(server_ip),
        server_port
    )
}

/// In-memory fingerprint store with an HTTP lookup surface
pub struct FingerprintResolver {
    records: DashMap<String, FingerprintRecord>,
    credentials: Option<Arc<BasicCredentials>>,
    sweep_interval: Duration,
}

impl FingerprintResolver {
    pub fn new(config: &ResolverConfig) -> Arc<Self> {
        Arc::new(Self {
            records: DashMap::new(),
            credentials: config
                .basic_auth
                .as_deref()
                .and_then(BasicCredentials::parse)
                .map(Arc::new),
            sweep_interval: config.sweep_interval,
        })
    }

    pub fn resolve(&self, key: &str) -> Option<FingerprintRecord> {
        self.records.get(key).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records that expired at or before `now_ms`
    pub fn sweep(&self, now_ms: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now_ms);
        before - self.records.len()
    }

    /// Periodic sweep; stops once the resolver is dropped
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let resolver: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(resolver) = resolver.upgrade() else {
                    return;
                };
                let dropped = resolver.sweep(now_ms());
                if dropped > 0 {
                    debug!("Swept {} expired fingerprints", dropped);
                }
            }
        })
    }

    /// `/health` is always open; everything else sits behind basic auth
    pub fn router(self: &Arc<Self>) -> Router {
        let protected = Router::new()
            .route("/resolve", get(resolve))
            .fallback(not_found)
            .with_state(self.clone())
            .layer(from_fn_with_state(self.credentials.clone(), require_basic_auth));

        Router::new()
            .route("/health", get(health))
            .merge(protected)
            .layer(TraceLayer::new_for_http())
    }

    fn insert(&self, registration: &FingerprintRegistration, now: i64) -> String {
        let protocol = registration.protocol.as_str();
        let key = tuple_key(
            protocol,
            &registration.local.ip().to_string(),
            registration.local.port(),
            &registration.remote.ip().to_string(),
            registration.remote.port(),
        );
        let ttl = (registration.idle + TTL_GRACE).max(MIN_TTL);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);

        let record = FingerprintRecord {
            key: key.clone(),
            protocol: protocol.to_string(),
            gate_port: registration.gate_port,
            channel_port: registration.channel_id,
            fingerprint: registration.fingerprint.clone(),
            created_at: now,
            expires_at: now.saturating_add(ttl_ms),
        };
        trace!("Registered fingerprint {}", key);
        self.records.insert(key.clone(), record);
        key
    }
}

impl FingerprintSink for FingerprintResolver {
    fn register(&self, registration: &FingerprintRegistration) -> String {
        self.insert(registration, now_ms())
    }

    fn unregister(&self, key: &str) {
        if self.records.remove(key).is_some() {
            trace!("Unregistered fingerprint {}", key);
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Accepts the snake_case names plus a few aliases
async fn resolve(
    State(resolver): State<Arc<FingerprintResolver>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<FingerprintRecord>, ApiError> {
    let param = |names: &[&str]| {
        names
            .iter()
            .find_map(|n| params.get(*n))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let port = |names: &[&str]| {
        param(names)
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|p| *p != 0)
    };

    let protocol = param(&["proto", "protocol"]).unwrap_or_else(|| "tcp".to_string());
    let remote_ip = param(&["remote_addr", "remoteAddr"]);
    let remote_port = port(&["remote_port", "remotePort"]);
    let server_ip = param(&["server_addr", "local_addr", "localAddr"]);
    let server_port = port(&["server_port", "local_port", "localPort"]);

    let (Some(remote_ip), Some(remote_port), Some(server_ip), Some(server_port)) =
        (remote_ip, remote_port, server_ip, server_port)
    else {
        return Err(ApiError::MissingParams);
    };

    let key = tuple_key(&protocol, &remote_ip, remote_port, &server_ip, server_port);
    resolver.resolve(&key).map(Json).ok_or(ApiError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use meshgate_proto::Protocol;
    use serde_json::Value;
    use tower::ServiceExt;

    fn registration(idle: Duration) -> FingerprintRegistration {
        let local: SocketAddr = "10.0.0.5:41000".parse().unwrap();
        let remote: SocketAddr = "10.0.0.9:5432".parse().unwrap();
        FingerprintRegistration {
            protocol: Protocol::Tcp,
            local,
            remote,
            channel_id: 7,
            gate_port: 5432,
            fingerprint: ChannelFingerprint::new(
                Protocol::Tcp,
                5432,
                7,
                "[::ffff:203.0.113.4]:50000".parse().unwrap(),
                "198.51.100.1:5432".parse().unwrap(),
            ),
            idle,
        }
    }

    async fn get_json(router: Router, uri: &str, auth: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(auth) = auth {
            request = request.header(header::AUTHORIZATION, auth);
        }
        let response = router
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[test]
    fn test_ttl_has_floor_and_grace() {
        let resolver = FingerprintResolver::new(&ResolverConfig::default());
        let key = resolver.insert(&registration(Duration::from_secs(10)), 1_000);
        assert_eq!(key, "tcp|10.0.0.5|41000|10.0.0.9|5432");
        assert_eq!(resolver.resolve(&key).unwrap().expires_at, 1_000 + 120_000);

        let key = resolver.insert(&registration(Duration::from_secs(3600)), 1_000);
        assert_eq!(resolver.resolve(&key).unwrap().expires_at, 1_000 + 3_660_000);
    }

    #[test]
    fn test_sweep_and_unregister() {
        let resolver = FingerprintResolver::new(&ResolverConfig::default());
        let key = resolver.insert(&registration(Duration::ZERO), 0);
        assert_eq!(resolver.sweep(119_999), 0);
        assert_eq!(resolver.sweep(120_000), 1);
        assert!(resolver.is_empty());

        let key2 = resolver.register(&registration(Duration::ZERO));
        assert_eq!(key, key2);
        resolver.unregister(&key2);
        assert!(resolver.resolve(&key2).is_none());
    }

    #[tokio::test]
    async fn test_resolve_endpoint() {
        let resolver = FingerprintResolver::new(&ResolverConfig::default());
        resolver.register(&registration(Duration::from_secs(60)));
        let router = resolver.router();

        let (status, body) = get_json(router.clone(), "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let (status, body) = get_json(
            router.clone(),
            "/resolve?remote_addr=::ffff:10.0.0.5&remote_port=41000&server_addr=10.0.0.9&server_port=5432",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["gatePort"], 5432);
        assert_eq!(body["channelPort"], 7);
        assert_eq!(body["fingerprint"]["source"]["ip"], "203.0.113.4");

        let (status, body) = get_json(router.clone(), "/resolve?remote_addr=10.0.0.5", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_params");

        let (status, body) = get_json(
            router.clone(),
            "/resolve?proto=udp&remote_addr=10.0.0.5&remote_port=41000&server_addr=10.0.0.9&server_port=5432",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");

        let (status, _) = get_json(router, "/nowhere", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_basic_auth_guards_resolve_but_not_health() {
        let resolver = FingerprintResolver::new(&ResolverConfig::default().with_basic_auth("ops:pw"));
        let router = resolver.router();

        let (status, _) = get_json(router.clone(), "/health", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = get_json(router.clone(), "/resolve", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let auth = format!("Basic {}", STANDARD.encode("ops:pw"));
        let (status, body) = get_json(router, "/resolve", Some(&auth)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_params");
    }
}
