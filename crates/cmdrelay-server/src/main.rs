//! `cmdrelay` server entry point.
//!
//! Loads the operation registry, builds the gateway and its audit sinks,
//! then starts the Axum HTTP server with graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};

use cmdrelay_core::audit::AuditLog;
use cmdrelay_core::audit_file::FileAuditSink;
use cmdrelay_core::gateway::{Gateway, OverloadPolicy};
use cmdrelay_core::registry::OperationRegistry;

use cmdrelay_server::config::ServerConfig;
use cmdrelay_server::routes;
use cmdrelay_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env().context("invalid configuration")?;

    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(registry = %config.registry_path.display(), "cmdrelay starting");

    let state = Arc::new(build_app_state(&config)?);
    let app = routes::build_router(state, config.max_body_bytes);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "cmdrelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("cmdrelay stopped");
    Ok(())
}

/// Load the registry and assemble the gateway.
fn build_app_state(config: &ServerConfig) -> anyhow::Result<AppState> {
    let registry = OperationRegistry::load(&config.registry_path)
        .context("failed to load operation registry")?;
    if registry.is_empty() {
        warn!("operation registry is empty; every request will be unknown_operation");
    }

    let mut audit = AuditLog::new();
    if let Some(path) = &config.audit_file_path {
        audit = audit.with_sink(Arc::new(FileAuditSink::new(path)));
        info!(path = %path.display(), "file audit sink registered");
    }

    let limits = &config.gateway;
    info!(
        operations = registry.len(),
        max_concurrency = limits.max_concurrency,
        default_timeout_ms = u64::try_from(limits.default_timeout.as_millis()).unwrap_or(u64::MAX),
        max_output_bytes = limits.max_output_bytes,
        queue = matches!(limits.overload, OverloadPolicy::Queue { .. }),
        "gateway configured"
    );

    let gateway = Gateway::new(Arc::new(registry), limits.clone()).with_audit(audit);

    if config.api_token.is_none() {
        warn!("CMDRELAY_API_TOKEN not set; operation endpoints are unauthenticated");
    }

    Ok(AppState::new(gateway, config.api_token.as_deref()))
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
}
