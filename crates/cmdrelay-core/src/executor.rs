//! Bounded external-process execution.
//!
//! [`ProcessRunner`] is the seam between the gateway and the host: "spawn a
//! process, capture its streams, await exit or timeout". The shipped
//! implementation, [`TokioProcessRunner`], never goes through a shell. The
//! argv is passed straight to `execve`.
//!
//! # Cleanup
//!
//! Each child runs in its own process group and is owned by a guard for the
//! whole invocation:
//!
//! - normal exit: the child has been reaped by `wait`. If descendants still
//!   hold its output pipes after a short grace period, the group is killed.
//! - timeout or wait error: the group gets `SIGKILL`, then the child is
//!   reaped before the result is returned.
//! - the caller's future is dropped (client went away): the guard's `Drop`
//!   kills the group and tokio's orphan reaper collects the child.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::result::{CapturedOutput, ExecutionResult};

/// Read buffer size for stdout/stderr pipes.
const READ_CHUNK: usize = 8 * 1024;

/// How long output may stay open after the child exits before the rest of
/// its process group is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(250);

/// The only variables a child inherits from the server. Everything else it
/// sees comes from the operation's `env` table.
const INHERITED_ENV: [&str; 4] = ["PATH", "HOME", "LANG", "TZ"];

/// A fully validated argv, ready to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

/// Resource limits applied to one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    /// Hard wall-clock limit.
    pub timeout: Duration,
    /// Cap on captured bytes, applied to stdout and stderr separately.
    pub max_output_bytes: usize,
}

/// Runs an [`Invocation`] and reports the outcome as data.
///
/// Implementations never return an error: launch failures, non-zero exits,
/// and timeouts all become an [`ExecutionResult`].
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        operation: &str,
        invocation: &Invocation,
        limits: ExecLimits,
    ) -> ExecutionResult;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait::async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        operation: &str,
        invocation: &Invocation,
        limits: ExecLimits,
    ) -> ExecutionResult {
        let start = Instant::now();

        let inherited = INHERITED_ENV
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|value| (*key, value)));

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .env_clear()
            .envs(inherited)
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(
                    operation,
                    program = %invocation.program,
                    error = %e,
                    "failed to launch process"
                );
                return ExecutionResult::rejected(
                    operation,
                    format!("failed to launch '{}': {e}", invocation.program),
                    start.elapsed(),
                );
            }
        };

        let mut guard = ChildGuard::new(child);
        debug!(
            operation,
            pid = ?guard.pid,
            program = %invocation.program,
            args = invocation.args.len(),
            "process started"
        );

        let stdout = guard.child.stdout.take();
        let stderr = guard.child.stderr.take();
        let cap = limits.max_output_bytes;
        let pid = guard.pid;
        let mut out = CapturedOutput::default();
        let mut err = CapturedOutput::default();

        let completion = async {
            let reading = async {
                tokio::join!(capture(stdout, cap, &mut out), capture(stderr, cap, &mut err));
            };
            tokio::pin!(reading);
            tokio::select! {
                () = &mut reading => guard.child.wait().await,
                status = guard.child.wait() => {
                    // Background descendants may keep the pipes open after
                    // the child itself has exited.
                    if tokio::time::timeout(DRAIN_GRACE, &mut reading).await.is_err() {
                        debug!(
                            operation,
                            pid = ?pid,
                            "output still open after exit, killing group"
                        );
                        kill_process_group(pid);
                        let _ = tokio::time::timeout(DRAIN_GRACE, &mut reading).await;
                    }
                    status
                }
            }
        };
        let waited = tokio::time::timeout(limits.timeout, completion).await;

        match waited {
            Ok(Ok(status)) => {
                guard.mark_reaped();
                let mut result = ExecutionResult::completed(
                    operation,
                    status.code(),
                    out,
                    err,
                    cap,
                    start.elapsed(),
                );
                result.reason = signal_reason(status);
                result
            }
            Ok(Err(e)) => {
                guard.terminate().await;
                ExecutionResult::rejected(
                    operation,
                    format!("failed to wait for process: {e}"),
                    start.elapsed(),
                )
            }
            Err(_) => {
                warn!(
                    operation,
                    timeout_ms = ?limits.timeout.as_millis(),
                    "process timed out, killing"
                );
                guard.terminate().await;
                ExecutionResult::timeout(operation, limits.timeout, start.elapsed())
            }
        }
    }
}

/// Owns a running child and guarantees it does not outlive the invocation.
struct ChildGuard {
    child: Child,
    /// Also the process group id, since the child leads its own group.
    pid: Option<u32>,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            reaped: false,
        }
    }

    fn mark_reaped(&mut self) {
        self.reaped = true;
    }

    /// Kill the whole group and reap the child.
    async fn terminate(&mut self) {
        kill_process_group(self.pid);
        if let Err(e) = self.child.kill().await {
            warn!(pid = ?self.pid, error = %e, "failed to kill child process");
        }
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        kill_process_group(self.pid);
        if let Err(e) = self.child.start_kill() {
            debug!(pid = ?self.pid, error = %e, "start_kill on drop failed");
        }
        debug!(pid = ?self.pid, "invocation cancelled, child killed");
    }
}

/// Drain a stream to EOF into `out`, keeping at most `cap` bytes.
///
/// Reading continues past the cap so the child never blocks on a full pipe.
/// Whatever was read stays in `out` if the future is dropped early.
async fn capture<R: AsyncRead + Unpin>(
    stream: Option<R>,
    cap: usize,
    out: &mut CapturedOutput,
) {
    let Some(mut stream) = stream else {
        return;
    };

    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let room = cap.saturating_sub(out.bytes.len());
                if n > room {
                    out.truncated = true;
                }
                out.bytes.extend_from_slice(&buf[..n.min(room)]);
            }
            Err(e) => {
                debug!(error = %e, "output stream read failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn signal_reason(status: ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|sig| format!("terminated by signal {sig}"))
}

#[cfg(not(unix))]
fn signal_reason(_status: ExitStatus) -> Option<String> {
    None
}

/// Send `SIGKILL` to the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pgid) = pid
        .and_then(|p| libc::pid_t::try_from(p).ok())
        .filter(|p| *p > 0)
    else {
        return;
    };

    // SAFETY: `killpg` only sends a signal; it does not touch our memory.
    // `pgid` is strictly positive, so this can never target our own group
    // (pgid 0) or every process we may signal (-1).
    #[allow(unsafe_code)]
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };

    if rc != 0 {
        // ESRCH is expected when the group already exited.
        debug!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}
