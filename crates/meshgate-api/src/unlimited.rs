//! Limit-override service
//!
//! A caller presents a salted token (see [`OverrideClaims`]) naming its own
//! address. When the token decrypts with the shared secret, is recent, has not
//! been seen before and names the address the request actually came from,
//! that address gets an unrestricted ingress rule for a while. The provider
//! merges [`UnlimitedService::overrides`] into its policy on each refresh.

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use meshgate_auth::{OverrideClaims, TokenError};
use meshgate_control::PolicyOverrides;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{normalize_ip, now_ms, ApiError};

/// Label carried by every granted rule
pub const GRANT_LABEL: &str = "gateway-unlimited";

/// Override service configuration
#[derive(Debug, Clone)]
pub struct UnlimitedConfig {
    pub listen: SocketAddr,
    pub secret: String,
    /// Accepted clock skew for token timestamps, and replay memory
    pub window: Duration,
    /// How long a granted override lasts
    pub grant_duration: Duration,
}

impl UnlimitedConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8091)),
            secret: secret.into(),
            window: Duration::from_secs(5 * 60),
            grant_duration: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }
}

/// Successful grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub ok: bool,
    pub ip: String,
    pub expire_at: i64,
}

#[derive(Debug, Default, Deserialize)]
struct PayloadQuery {
    payload: Option<String>,
}

pub struct UnlimitedService {
    config: UnlimitedConfig,
    /// Granted rules keyed by address, in `ips` policy form
    grants: Mutex<Map<String, Value>>,
    /// sha256(payload) → replay memory expiry
    seen: Mutex<HashMap<String, i64>>,
}

impl UnlimitedService {
    pub fn new(config: UnlimitedConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            grants: Mutex::new(Map::new()),
            seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &UnlimitedConfig {
        &self.config
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/unlimited", get(unlimited).post(unlimited))
            .fallback(not_found)
            .with_state(self.clone())
            .layer(TraceLayer::new_for_http())
    }

    /// Validate `payload` for a request from `caller` and install the grant
    pub fn grant(&self, payload: &str, caller: IpAddr, now: i64) -> Result<Grant, ApiError> {
        let window_ms = millis(self.config.window);
        self.seen.lock().retain(|_, expires| *expires > now);

        let claims = OverrideClaims::decrypt(payload, &self.config.secret).map_err(|e| match e {
            TokenError::Claims(e) if e.is_data() => ApiError::InvalidPayload,
            other => ApiError::InvalidToken(other.to_string()),
        })?;

        let requested = normalize_ip(&claims.ip);
        if requested.is_empty() {
            return Err(ApiError::InvalidPayload);
        }
        let caller_ip = caller.to_canonical().to_string();
        if requested != caller_ip {
            return Err(ApiError::IpMismatch { caller_ip });
        }
        if now.abs_diff(claims.timestamp) > window_ms.unsigned_abs() {
            return Err(ApiError::TimestampOutOfWindow);
        }

        let digest = hex::encode(Sha256::digest(payload.as_bytes()));
        {
            let mut seen = self.seen.lock();
            if seen.get(&digest).is_some_and(|expires| *expires > now) {
                return Err(ApiError::ReplayDetected);
            }
            seen.insert(digest, now + window_ms);
        }

        let expire_at = now + millis(self.config.grant_duration);
        self.grants.lock().insert(
            requested.clone(),
            json!({
                "allow": true,
                "bandwidthLimit": null,
                "labels": [GRANT_LABEL],
                "desc": GRANT_LABEL,
                "expireAt": expire_at,
            }),
        );
        info!("Granted unlimited ingress to {} until {}", requested, expire_at);

        Ok(Grant {
            ok: true,
            ip: requested,
            expire_at,
        })
    }

    pub fn grant_count(&self) -> usize {
        self.grants.lock().len()
    }
}

impl PolicyOverrides for UnlimitedService {
    fn overrides(&self) -> Value {
        let now = now_ms();
        let mut grants = self.grants.lock();
        grants.retain(|_, rule| rule["expireAt"].as_i64().is_some_and(|at| at > now));
        json!({ "ips": grants.clone() })
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Pull the token out of a JSON `{payload}`, a form body or the raw body
fn payload_from_body(body: &[u8]) -> Option<String> {
    let raw = std::str::from_utf8(body).ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with('{') {
        let parsed: Value = serde_json::from_str(raw).ok()?;
        return parsed.get("payload")?.as_str().map(str::to_string);
    }
    if raw.contains('=') && !raw.contains('.') {
        let found = raw
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == "payload")
            .map(|(_, v)| v.to_string())
            .filter(|v| !v.is_empty());
        if found.is_some() {
            return found;
        }
    }
    Some(raw.to_string())
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn unlimited(
    State(service): State<Arc<UnlimitedService>>,
    ConnectInfo(caller): ConnectInfo<SocketAddr>,
    Query(query): Query<PayloadQuery>,
    body: Bytes,
) -> Result<Json<Grant>, ApiError> {
    let payload = query
        .payload
        .filter(|p| !p.is_empty())
        .or_else(|| payload_from_body(&body))
        .ok_or(ApiError::MissingPayload)?;

    service
        .grant(&payload, caller.ip(), now_ms())
        .map(Json)
        .inspect_err(|e| warn!("Override request from {} refused: {}", caller.ip(), e))
}
