//! Shared application state for the `cmdrelay` server.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use cmdrelay_core::gateway::Gateway;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Registry, runner, permits and audit sinks.
    pub gateway: Arc<Gateway>,
    /// SHA-256 of the configured API token. `None` disables auth.
    pub api_token_digest: Option<[u8; 32]>,
}

impl AppState {
    #[must_use]
    pub fn new(gateway: Gateway, api_token: Option<&str>) -> Self {
        Self {
            gateway: Arc::new(gateway),
            api_token_digest: api_token.map(token_digest),
        }
    }
}

/// Hash a presented or configured token for constant-time comparison.
pub fn token_digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gateway", &self.gateway)
            .field("auth_enabled", &self.api_token_digest.is_some())
            .finish()
    }
}
