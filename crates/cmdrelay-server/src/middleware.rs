//! Authentication middleware for `cmdrelay`.
//!
//! When an API token is configured, requests must present it as
//! `Authorization: Bearer <token>` or `X-Relay-Token: <token>`. Both sides
//! are hashed with SHA-256 and compared in constant time.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::AppError;
use crate::state::{AppState, token_digest};

/// Alternate header for clients that cannot set `Authorization`.
pub const TOKEN_HEADER: &str = "x-relay-token";

/// Middleware that checks the API token, if one is configured.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token_digest else {
        return next.run(req).await;
    };

    let Some(presented) = presented_token(req.headers()) else {
        return AppError::Unauthorized("missing API token".to_owned()).into_response();
    };

    if bool::from(token_digest(presented).ct_eq(&expected)) {
        next.run(req).await
    } else {
        warn!(path = %req.uri().path(), "rejected request with invalid API token");
        AppError::Unauthorized("invalid API token".to_owned()).into_response()
    }
}

fn presented_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, token) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });

    bearer.or_else(|| {
        headers
            .get(TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn bearer_and_relay_header_are_both_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(presented_token(&headers), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert(TOKEN_HEADER, HeaderValue::from_static("xyz"));
        assert_eq!(presented_token(&headers), Some("xyz"));
    }

    #[test]
    fn other_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(presented_token(&headers), None);
    }
}
