//! Audit trail for gateway requests.
//!
//! Every request that reaches [`Gateway::handle_request`](crate::gateway::Gateway::handle_request)
//! produces one [`AuditEntry`], including requests rejected before a process
//! was spawned. Parameter *values* are never recorded; only the names the
//! caller supplied.
//!
//! A request whose future is dropped mid-flight (client disconnect) is
//! recorded as `cancelled` by a task spawned from the gateway.
//!
//! Unlike a fail-closed audit design, a sink failure here never blocks the
//! request: it is logged at `warn` and the response goes out unchanged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::AuditError;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditEntry {
    /// Unique entry ID.
    pub id: String,
    /// When the request finished.
    pub timestamp: DateTime<Utc>,
    /// Requested operation name (as registered, or sanitized if unknown).
    pub operation: String,
    /// `success`, `failure`, `timeout`, `rejected`, `unknown_operation`,
    /// `invalid_parameter`, `overloaded`, or `cancelled`.
    pub outcome: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Names of the parameters the caller supplied.
    pub params: Vec<String>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(operation: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            operation: operation.into(),
            outcome: outcome.into(),
            exit_code: None,
            duration_ms: 0,
            params: Vec::new(),
        }
    }
}

/// Trait for audit log sinks.
///
/// Implementations must be safe to share across async tasks.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name (for error reporting).
    fn name(&self) -> &str;

    /// Persist one entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be written.
    async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// Fans entries out to every registered sink.
#[derive(Default, Clone)]
pub struct AuditLog {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink. Sinks are fixed once the gateway is built.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Write `entry` to all sinks; failures are logged, never returned.
    pub async fn record(&self, entry: &AuditEntry) {
        for sink in &self.sinks {
            if let Err(e) = sink.record(entry).await {
                warn!(
                    sink = sink.name(),
                    entry_id = %entry.id,
                    error = %e,
                    "audit sink failed to record entry"
                );
            }
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}
