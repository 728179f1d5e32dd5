//! The command gateway.
//!
//! [`Gateway::handle_request`] is the whole request pipeline:
//!
//! 1. look the operation up in the frozen registry
//! 2. validate parameters and render the argv
//! 3. take an execution permit (reject or queue per [`OverloadPolicy`])
//! 4. run the process under its time and output limits
//! 5. record an audit entry (`cancelled` if the caller drops the request
//!    before it finishes)
//!
//! Steps 1 and 2 run before a permit is taken, so malformed requests never
//! occupy an execution slot and never spawn anything.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info};

use crate::audit::{AuditEntry, AuditLog};
use crate::error::GatewayError;
use crate::executor::{ExecLimits, ProcessRunner, TokioProcessRunner};
use crate::registry::{OperationRegistry, sanitize_name};
use crate::result::ExecutionResult;

/// Default per-invocation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capture cap per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Default number of simultaneous external processes.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Longest list of supplied parameter names kept in an audit entry.
const MAX_AUDITED_PARAMS: usize = 32;

/// Audit outcome for requests abandoned by the caller mid-flight.
const CANCELLED: &str = "cancelled";

/// What happens when every execution permit is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverloadPolicy {
    /// Fail immediately with [`GatewayError::Overloaded`].
    #[default]
    Reject,
    /// Wait up to `wait` for a permit, then fail with [`GatewayError::Overloaded`].
    Queue { wait: Duration },
}

/// Gateway-wide limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Timeout for operations that do not set their own.
    pub default_timeout: Duration,
    /// Capture cap per stream.
    pub max_output_bytes: usize,
    /// Simultaneous external processes. Values below 1 are treated as 1.
    pub max_concurrency: usize,
    pub overload: OverloadPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            overload: OverloadPolicy::Reject,
        }
    }
}

/// Validates, executes, and reports whitelisted operations.
pub struct Gateway {
    registry: Arc<OperationRegistry>,
    runner: Arc<dyn ProcessRunner>,
    permits: Semaphore,
    config: GatewayConfig,
    audit: AuditLog,
}

impl Gateway {
    /// Build a gateway that runs real processes via `tokio::process`.
    #[must_use]
    pub fn new(registry: Arc<OperationRegistry>, config: GatewayConfig) -> Self {
        let limit = config.max_concurrency.max(1);
        Self {
            registry,
            runner: Arc::new(TokioProcessRunner),
            permits: Semaphore::new(limit),
            config: GatewayConfig {
                max_concurrency: limit,
                ..config
            },
            audit: AuditLog::new(),
        }
    }

    /// Replace the process runner.
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Attach audit sinks.
    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Execution permits not currently held.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one request through the full pipeline.
    ///
    /// Process-level outcomes (success, non-zero exit, timeout, launch
    /// failure) come back as `Ok(ExecutionResult)`. `Err` means nothing was
    /// executed.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::UnknownOperation`] if `name` is not registered.
    /// - [`GatewayError::InvalidParameter`] if `raw` fails validation.
    /// - [`GatewayError::Overloaded`] if no execution permit is available.
    pub async fn handle_request(
        &self,
        name: &str,
        raw: &Map<String, Value>,
    ) -> Result<ExecutionResult, GatewayError> {
        let mut pending = PendingAudit {
            audit: &self.audit,
            operation: sanitize_name(name),
            params: raw
                .keys()
                .take(MAX_AUDITED_PARAMS)
                .map(|k| sanitize_name(k))
                .collect(),
            started: Instant::now(),
            armed: true,
        };
        let outcome = self.dispatch(name, raw).await;
        pending.armed = false;

        let mut entry = match &outcome {
            Ok(result) => {
                let mut entry = AuditEntry::new(&result.operation, result.outcome.as_str());
                entry.exit_code = result.exit_code;
                entry
            }
            Err(e) => {
                debug!(operation = %pending.operation, error = %e, "request refused");
                AuditEntry::new(pending.operation.clone(), e.kind())
            }
        };
        entry.duration_ms = elapsed_ms(pending.started);
        entry.params = std::mem::take(&mut pending.params);
        self.audit.record(&entry).await;

        outcome
    }

    async fn dispatch(
        &self,
        name: &str,
        raw: &Map<String, Value>,
    ) -> Result<ExecutionResult, GatewayError> {
        let operation = self
            .registry
            .get(name)
            .ok_or_else(|| GatewayError::UnknownOperation {
                name: sanitize_name(name),
            })?;

        let invocation = operation.bind(raw)?;

        let _permit = self.acquire_permit().await?;

        let limits = ExecLimits {
            timeout: operation.timeout().unwrap_or(self.config.default_timeout),
            max_output_bytes: self.config.max_output_bytes,
        };
        let result = self.runner.run(operation.name(), &invocation, limits).await;

        info!(
            operation = %operation.name(),
            outcome = result.outcome.as_str(),
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            stdout_truncated = result.stdout_truncated,
            stderr_truncated = result.stderr_truncated,
            "operation finished"
        );

        Ok(result)
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>, GatewayError> {
        let overloaded = || GatewayError::Overloaded {
            limit: self.config.max_concurrency,
        };

        match self.config.overload {
            OverloadPolicy::Reject => self.permits.try_acquire().map_err(|_| overloaded()),
            OverloadPolicy::Queue { wait } => {
                match tokio::time::timeout(wait, self.permits.acquire()).await {
                    Ok(Ok(permit)) => Ok(permit),
                    Ok(Err(_)) | Err(_) => Err(overloaded()),
                }
            }
        }
    }
}

/// Audit state for a request in flight. If the request future is dropped
/// before [`Gateway::handle_request`] writes its own entry, a `cancelled`
/// entry is recorded from a spawned task instead.
struct PendingAudit<'a> {
    audit: &'a AuditLog,
    operation: String,
    params: Vec<String>,
    started: Instant,
    armed: bool,
}

impl Drop for PendingAudit<'_> {
    fn drop(&mut self) {
        if !self.armed || self.audit.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        debug!(operation = %self.operation, "request dropped before completion");

        let mut entry = AuditEntry::new(std::mem::take(&mut self.operation), CANCELLED);
        entry.duration_ms = elapsed_ms(self.started);
        entry.params = std::mem::take(&mut self.params);
        let audit = self.audit.clone();
        runtime.spawn(async move { audit.record(&entry).await });
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("operations", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::Mutex;

    use super::*;
    use crate::audit::AuditSink;
    use crate::error::AuditError;
    use crate::executor::Invocation;
    use crate::param::{ParamKind, ParamSpec};
    use crate::registry::{OperationDef, RegistryBuilder};
    use crate::result::Outcome;

    /// Fake runner: counts spawns, tracks peak concurrency, sleeps `hold`.
    #[derive(Default)]
    struct CountingRunner {
        spawned: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        hold: Duration,
        last: Mutex<Option<Invocation>>,
    }

    impl CountingRunner {
        fn holding(hold: Duration) -> Self {
            Self {
                hold,
                ..Self::default()
            }
        }
    }

    #[async_trait::async_trait]
    impl ProcessRunner for CountingRunner {
        async fn run(
            &self,
            operation: &str,
            invocation: &Invocation,
            _limits: ExecLimits,
        ) -> ExecutionResult {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            *self.last.lock().await = Some(invocation.clone());
            tokio::time::sleep(self.hold).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            ExecutionResult::completed(
                operation,
                Some(0),
                crate::result::CapturedOutput::default(),
                crate::result::CapturedOutput::default(),
                1024,
                self.hold,
            )
        }
    }

    #[derive(Default)]
    struct MemorySink {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait::async_trait]
    impl AuditSink for MemorySink {
        fn name(&self) -> &str {
            "memory"
        }

        async fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
            self.entries.lock().await.push(entry.clone());
            Ok(())
        }
    }

    fn echo_registry() -> Arc<OperationRegistry> {
        let mut builder = RegistryBuilder::new();
        builder
            .register(OperationDef::new(
                "echo",
                ["/bin/echo", "{msg}"],
                vec![ParamSpec::required(
                    "msg",
                    ParamKind::string("[A-Za-z0-9]+", 32).unwrap(),
                )],
            ))
            .unwrap();
        builder
            .register(
                OperationDef::new("slow", ["sleep", "30"], Vec::new())
                    .with_timeout(Duration::from_millis(200)),
            )
            .unwrap();
        Arc::new(builder.build())
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn gateway_with(runner: Arc<CountingRunner>, config: GatewayConfig) -> Gateway {
        Gateway::new(echo_registry(), config).with_runner(runner)
    }

    // ── refusal paths never spawn ────────────────────────────────────

    #[tokio::test]
    async fn unknown_operation_spawns_nothing() {
        let runner = Arc::new(CountingRunner::default());
        let gw = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        let err = gw.handle_request("rm", &params(json!({}))).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownOperation { ref name } if name == "rm"));
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_parameter_spawns_nothing() {
        let runner = Arc::new(CountingRunner::default());
        let gw = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        for body in [
            json!({"msg": "; rm -rf /"}),
            json!({"msg": "a".repeat(33)}),
            json!({"msg": 7}),
            json!({}),
            json!({"msg": "ok", "extra": "x"}),
        ] {
            let err = gw.handle_request("echo", &params(body)).await.unwrap_err();
            assert!(matches!(err, GatewayError::InvalidParameter { .. }), "{err}");
        }
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 0);
        assert_eq!(gw.available_permits(), DEFAULT_MAX_CONCURRENCY);
    }

    #[tokio::test]
    async fn valid_request_reaches_runner_with_argv() {
        let runner = Arc::new(CountingRunner::default());
        let gw = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        let r = gw.handle_request("echo", &params(json!({"msg": "hello"}))).await.unwrap();
        assert_eq!(r.outcome, Outcome::Success);

        let last = runner.last.lock().await.clone().unwrap();
        assert_eq!(last.program, "/bin/echo");
        assert_eq!(last.args, vec!["hello"]);
        assert_eq!(gw.available_permits(), DEFAULT_MAX_CONCURRENCY);
    }

    // ── concurrency ──────────────────────────────────────────────────

    #[tokio::test]
    async fn reject_policy_overloads_past_limit() {
        let runner = Arc::new(CountingRunner::holding(Duration::from_millis(300)));
        let gw = Arc::new(gateway_with(
            Arc::clone(&runner),
            GatewayConfig {
                max_concurrency: 2,
                ..GatewayConfig::default()
            },
        ));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let gw = Arc::clone(&gw);
            tasks.push(tokio::spawn(async move {
                gw.handle_request("echo", &params(json!({"msg": "hi"}))).await
            }));
        }

        let mut ok = 0;
        let mut overloaded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(GatewayError::Overloaded { limit }) => {
                    assert_eq!(limit, 2);
                    overloaded += 1;
                }
                Err(other) => unreachable!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 2);
        assert_eq!(overloaded, 1);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queue_policy_serves_everyone_within_limit() {
        let runner = Arc::new(CountingRunner::holding(Duration::from_millis(100)));
        let gw = Arc::new(gateway_with(
            Arc::clone(&runner),
            GatewayConfig {
                max_concurrency: 2,
                overload: OverloadPolicy::Queue {
                    wait: Duration::from_secs(5),
                },
                ..GatewayConfig::default()
            },
        ));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let gw = Arc::clone(&gw);
            tasks.push(tokio::spawn(async move {
                gw.handle_request("echo", &params(json!({"msg": "hi"}))).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 5);
        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queue_policy_gives_up_after_wait() {
        let runner = Arc::new(CountingRunner::holding(Duration::from_millis(500)));
        let gw = Arc::new(gateway_with(
            Arc::clone(&runner),
            GatewayConfig {
                max_concurrency: 1,
                overload: OverloadPolicy::Queue {
                    wait: Duration::from_millis(50),
                },
                ..GatewayConfig::default()
            },
        ));

        let first = {
            let gw = Arc::clone(&gw);
            tokio::spawn(async move {
                gw.handle_request("echo", &params(json!({"msg": "a"}))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = gw.handle_request("echo", &params(json!({"msg": "b"}))).await;

        assert!(matches!(second, Err(GatewayError::Overloaded { limit: 1 })));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn zero_concurrency_is_clamped_to_one() {
        let gw = gateway_with(
            Arc::new(CountingRunner::default()),
            GatewayConfig {
                max_concurrency: 0,
                ..GatewayConfig::default()
            },
        );
        assert_eq!(gw.config().max_concurrency, 1);
        assert!(gw.handle_request("echo", &params(json!({"msg": "x"}))).await.is_ok());
    }

    // ── audit ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn every_request_is_audited_without_values() {
        let sink = Arc::new(MemorySink::default());
        let gw = gateway_with(Arc::new(CountingRunner::default()), GatewayConfig::default())
            .with_audit(AuditLog::new().with_sink(Arc::clone(&sink) as Arc<dyn AuditSink>));

        gw.handle_request("echo", &params(json!({"msg": "secretvalue"}))).await.unwrap();
        let _ = gw.handle_request("echo", &params(json!({"msg": "; bad"}))).await;
        let _ = gw.handle_request("nope", &params(json!({}))).await;

        let entries = sink.entries.lock().await;
        let outcomes: Vec<_> = entries.iter().map(|e| e.outcome.as_str()).collect();
        assert_eq!(outcomes, vec!["success", "invalid_parameter", "unknown_operation"]);
        assert_eq!(entries[0].params, vec!["msg"]);
        assert_eq!(entries[0].exit_code, Some(0));

        let serialized = serde_json::to_string(&*entries).unwrap();
        assert!(!serialized.contains("secretvalue"));
    }

    #[tokio::test]
    async fn dropped_request_is_audited_as_cancelled() {
        let sink = Arc::new(MemorySink::default());
        let runner = Arc::new(CountingRunner::holding(Duration::from_secs(5)));
        let gw = gateway_with(runner, GatewayConfig::default())
            .with_audit(AuditLog::new().with_sink(Arc::clone(&sink) as Arc<dyn AuditSink>));

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            gw.handle_request("echo", &params(json!({"msg": "hi"}))),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..50 {
            if !sink.entries.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let entries = sink.entries.lock().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, "echo");
        assert_eq!(entries[0].outcome, "cancelled");
        assert_eq!(entries[0].params, vec!["msg"]);
        assert_eq!(gw.available_permits(), DEFAULT_MAX_CONCURRENCY);
    }

    // ── real processes ───────────────────────────────────────────────

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_hello_end_to_end() {
        let gw = Gateway::new(echo_registry(), GatewayConfig::default());
        let r = gw.handle_request("echo", &params(json!({"msg": "hello"}))).await.unwrap();
        assert_eq!(r.outcome, Outcome::Success);
        assert_eq!(r.stdout, "hello\n");
        assert_eq!(r.exit_code, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn per_operation_timeout_applies_and_releases_permit() {
        let gw = Gateway::new(echo_registry(), GatewayConfig::default());
        let r = gw.handle_request("slow", &Map::new()).await.unwrap();
        assert_eq!(r.outcome, Outcome::Timeout);
        assert!(r.stdout.is_empty());
        assert_eq!(gw.available_permits(), DEFAULT_MAX_CONCURRENCY);
    }
}
