//! HTTP surfaces that run beside a provider or gateway
//!
//! - [`fingerprint`]: lets backends look up the real client behind a channel
//! - [`unlimited`]: grants temporary ingress overrides from signed tokens

pub mod fingerprint;
pub mod middleware;
pub mod models;
pub mod unlimited;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub use fingerprint::{FingerprintRecord, FingerprintResolver, ResolverConfig};
pub use models::ErrorResponse;
pub use unlimited::{Grant, UnlimitedConfig, UnlimitedService};

/// Realm announced on 401 responses
pub const AUTH_REALM: &str = "meshgate";

/// Errors answered by the HTTP surfaces
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing_params")]
    MissingParams,

    #[error("not_found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("missing_payload")]
    MissingPayload,

    #[error("invalid_payload")]
    InvalidPayload,

    #[error("invalid_token")]
    InvalidToken(String),

    #[error("ip_mismatch")]
    IpMismatch { caller_ip: String },

    #[error("timestamp_out_of_window")]
    TimestampOutOfWindow,

    #[error("replay_detected")]
    ReplayDetected,

    #[error("Failed to bind HTTP listener: {0}")]
    Bind(#[from] std::io::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParams | ApiError::MissingPayload | ApiError::InvalidPayload => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidToken(_) | ApiError::IpMismatch { .. } | ApiError::TimestampOutOfWindow => {
                StatusCode::FORBIDDEN
            }
            ApiError::ReplayDetected => StatusCode::CONFLICT,
            ApiError::Bind(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::InvalidToken(detail) => ErrorResponse::with_detail("invalid_token", detail),
            ApiError::IpMismatch { caller_ip } => ErrorResponse::with_detail("ip_mismatch", caller_ip),
            ApiError::Bind(e) => ErrorResponse::with_detail("internal_error", e),
            other => ErrorResponse::new(other.to_string()),
        };

        let mut response = (status, Json(body)).into_response();
        if matches!(self, ApiError::Unauthorized) {
            let challenge = format!("Basic realm=\"{}\"", AUTH_REALM);
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

/// Bind `addr` and serve `router` in the background
///
/// Handlers see the caller address through `ConnectInfo<SocketAddr>`.
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
) -> Result<(SocketAddr, JoinHandle<()>), ApiError> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("{} listening on http://{}", name, local_addr);

    let handle = tokio::spawn(async move {
        let service = router.into_make_service_with_connect_info::<SocketAddr>();
        if let Err(e) = axum::serve(listener, service).await {
            error!("{} server error: {}", name, e);
        }
    });
    Ok((local_addr, handle))
}

/// Strip an IPv6 zone and the IPv4-mapped prefix from a textual address
pub(crate) fn normalize_ip(ip: &str) -> String {
    let ip = ip.split('%').next().unwrap_or(ip);
    ip.strip_prefix("::ffff:").unwrap_or(ip).to_string()
}

/// Milliseconds since the unix epoch
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_ip() {
        assert_eq!(normalize_ip("::ffff:10.0.0.1"), "10.0.0.1");
        assert_eq!(normalize_ip("fe80::1%eth0"), "fe80::1");
        assert_eq!(normalize_ip("192.168.1.1"), "192.168.1.1");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::MissingParams.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::ReplayDetected.status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::IpMismatch {
                caller_ip: "1.2.3.4".into()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_unauthorized_carries_challenge() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"meshgate\""
        );
    }
}
