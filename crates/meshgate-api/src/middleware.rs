//! Basic authentication for the resolver
//!
//! Checks the `Authorization: Basic <base64(user:pass)>` header against the
//! configured credentials and answers 401 with a challenge otherwise.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;

use crate::ApiError;

/// Expected `user:pass` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

impl BasicCredentials {
    /// Parse `user:pass`; values without a colon disable auth
    pub fn parse(value: &str) -> Option<Self> {
        let (username, password) = value.split_once(':')?;
        Some(Self {
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// True when an `Authorization` header value carries these credentials
    pub fn verify(&self, authorization: &str) -> bool {
        let Some(encoded) = authorization.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        match decoded.split_once(':') {
            Some((user, pass)) => user == self.username && pass == self.password,
            None => false,
        }
    }
}

pub async fn require_basic_auth(
    State(credentials): State<Option<Arc<BasicCredentials>>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(credentials) = credentials {
        let authorized = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .is_some_and(|h| credentials.verify(h));
        if !authorized {
            return Err(ApiError::Unauthorized);
        }
    }
    Ok(next.run(request).await)
}
