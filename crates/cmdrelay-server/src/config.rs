//! Server configuration for `cmdrelay`.
//!
//! Loaded once from `CMDRELAY_*` environment variables at startup. Malformed
//! values are errors, never replaced by defaults.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use cmdrelay_core::gateway::{GatewayConfig, OverloadPolicy};

const DEFAULT_BIND: ([u8; 4], u16) = ([127, 0, 0, 1], 8082);
const DEFAULT_REGISTRY: &str = "./operations.toml";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 5;
const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024;

/// A configuration variable had an unusable value.
#[derive(Debug, thiserror::Error)]
#[error("{var}='{value}' is invalid: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Path to the TOML operation registry.
    pub registry_path: PathBuf,
    /// Limits handed to the gateway.
    pub gateway: GatewayConfig,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Shared secret for the operations endpoints. `None` disables auth.
    pub api_token: Option<String>,
    /// Path to the JSON-lines audit file (if file audit is enabled).
    pub audit_file_path: Option<PathBuf>,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CMDRELAY_BIND_ADDR`: full bind address (overrides `PORT`, default `127.0.0.1:8082`)
    /// - `PORT`: port to bind on `0.0.0.0` (platform convention)
    /// - `CMDRELAY_REGISTRY`: registry file (default `./operations.toml`)
    /// - `CMDRELAY_TIMEOUT_SECS`: default per-invocation timeout (default `10`)
    /// - `CMDRELAY_MAX_OUTPUT_BYTES`: capture cap per stream (default `65536`)
    /// - `CMDRELAY_MAX_CONCURRENCY`: simultaneous processes (default `4`)
    /// - `CMDRELAY_OVERLOAD`: `reject` or `queue` (default `reject`)
    /// - `CMDRELAY_QUEUE_TIMEOUT_SECS`: permit wait under `queue` (default `5`)
    /// - `CMDRELAY_MAX_BODY_BYTES`: request body limit (default `16384`)
    /// - `CMDRELAY_API_TOKEN`: enables token auth when set and non-empty
    /// - `CMDRELAY_AUDIT_FILE`: JSON-lines audit file (optional)
    /// - `CMDRELAY_LOG_LEVEL`: log filter (default `info`)
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for any value that does not parse or is zero
    /// where a positive number is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // Priority: CMDRELAY_BIND_ADDR > PORT > default.
        let bind_addr = if let Some(addr) = lookup("CMDRELAY_BIND_ADDR") {
            addr.trim()
                .parse()
                .map_err(|e| invalid("CMDRELAY_BIND_ADDR", &addr, e))?
        } else if let Some(port) = lookup("PORT") {
            let port: u16 = port.trim().parse().map_err(|e| invalid("PORT", &port, e))?;
            SocketAddr::from(([0, 0, 0, 0], port))
        } else {
            SocketAddr::from(DEFAULT_BIND)
        };

        let registry_path = lookup("CMDRELAY_REGISTRY")
            .filter(|v| !v.trim().is_empty())
            .map_or_else(|| PathBuf::from(DEFAULT_REGISTRY), PathBuf::from);

        let timeout_secs = positive(&lookup, "CMDRELAY_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;
        let max_output_bytes =
            positive(&lookup, "CMDRELAY_MAX_OUTPUT_BYTES", DEFAULT_MAX_OUTPUT_BYTES)?;
        let max_concurrency =
            positive(&lookup, "CMDRELAY_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY)?;
        let queue_secs = positive(
            &lookup,
            "CMDRELAY_QUEUE_TIMEOUT_SECS",
            DEFAULT_QUEUE_TIMEOUT_SECS,
        )?;
        let max_body_bytes = positive(&lookup, "CMDRELAY_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;

        let overload = match lookup("CMDRELAY_OVERLOAD") {
            None => OverloadPolicy::Reject,
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "reject" => OverloadPolicy::Reject,
                "queue" => OverloadPolicy::Queue {
                    wait: Duration::from_secs(queue_secs),
                },
                _ => return Err(invalid("CMDRELAY_OVERLOAD", &raw, "expected 'reject' or 'queue'")),
            },
        };

        let api_token = lookup("CMDRELAY_API_TOKEN").filter(|v| !v.is_empty());

        let audit_file_path = lookup("CMDRELAY_AUDIT_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let log_level = lookup("CMDRELAY_LOG_LEVEL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "info".to_owned());

        Ok(Self {
            bind_addr,
            registry_path,
            gateway: GatewayConfig {
                default_timeout: Duration::from_secs(timeout_secs),
                max_output_bytes,
                max_concurrency,
                overload,
            },
            max_body_bytes,
            api_token,
            audit_file_path,
            log_level,
        })
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError {
        var,
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}

/// Parse an optional numeric variable that must be greater than zero.
fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    let value: T = raw.trim().parse().map_err(|e| invalid(var, &raw, e))?;
    if value <= T::default() {
        return Err(invalid(var, &raw, "must be greater than zero"));
    }
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<ServerConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let cfg = load(&[]).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:8082".parse().unwrap());
        assert_eq!(cfg.registry_path, PathBuf::from("./operations.toml"));
        assert_eq!(cfg.gateway, GatewayConfig::default());
        assert_eq!(cfg.max_body_bytes, 16 * 1024);
        assert!(cfg.api_token.is_none());
        assert!(cfg.audit_file_path.is_none());
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn bind_addr_wins_over_port() {
        let cfg = load(&[("CMDRELAY_BIND_ADDR", "10.0.0.1:9000"), ("PORT", "7000")]).unwrap();
        assert_eq!(cfg.bind_addr, "10.0.0.1:9000".parse().unwrap());

        let cfg = load(&[("PORT", "7000")]).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:7000".parse().unwrap());
    }

    #[test]
    fn queue_policy_uses_queue_timeout() {
        let cfg = load(&[
            ("CMDRELAY_OVERLOAD", "Queue"),
            ("CMDRELAY_QUEUE_TIMEOUT_SECS", "2"),
            ("CMDRELAY_MAX_CONCURRENCY", "8"),
        ])
        .unwrap();
        assert_eq!(
            cfg.gateway.overload,
            OverloadPolicy::Queue {
                wait: Duration::from_secs(2)
            }
        );
        assert_eq!(cfg.gateway.max_concurrency, 8);
    }

    #[test]
    fn malformed_values_are_errors() {
        for (var, value) in [
            ("CMDRELAY_TIMEOUT_SECS", "ten"),
            ("CMDRELAY_TIMEOUT_SECS", "0"),
            ("CMDRELAY_MAX_CONCURRENCY", "-1"),
            ("CMDRELAY_MAX_OUTPUT_BYTES", "0"),
            ("CMDRELAY_OVERLOAD", "drop"),
            ("CMDRELAY_BIND_ADDR", "localhost"),
            ("PORT", "70000"),
        ] {
            let err = load(&[(var, value)]).unwrap_err();
            assert_eq!(err.var, var);
        }
    }

    #[test]
    fn empty_token_disables_auth() {
        assert!(load(&[("CMDRELAY_API_TOKEN", "")]).unwrap().api_token.is_none());
        assert_eq!(
            load(&[("CMDRELAY_API_TOKEN", "s3cret")]).unwrap().api_token.as_deref(),
            Some("s3cret")
        );
    }
}
