//! Structured outcome of one operation invocation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The process exited with code 0.
    Success,
    /// The process exited with a non-zero code or was killed by a signal.
    Failure,
    /// The process exceeded its time limit and was terminated.
    Timeout,
    /// The process could not be launched.
    Rejected,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
        }
    }
}

/// Bytes captured from one output stream, cut at the configured cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    /// The stream produced more than the cap; the excess was discarded.
    pub truncated: bool,
}

impl CapturedOutput {
    /// Decode as UTF-8 (lossy), never exceeding `cap` bytes.
    ///
    /// Lossy decoding can grow a cut multi-byte sequence into a replacement
    /// character, so trailing characters are popped until the text fits.
    pub fn into_text(self, cap: usize) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        while text.len() > cap {
            text.pop();
        }
        text
    }
}

/// The result returned to the caller for every executed (or attempted) invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub operation: String,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Exit code; `None` when terminated by a signal, timed out, or never started.
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    /// Explanation for `timeout` and `rejected` outcomes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
}

impl ExecutionResult {
    /// A process that ran to completion. `Success` iff the exit code is 0.
    pub fn completed(
        operation: &str,
        exit_code: Option<i32>,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        cap: usize,
        elapsed: Duration,
    ) -> Self {
        let outcome = if exit_code == Some(0) {
            Outcome::Success
        } else {
            Outcome::Failure
        };
        Self {
            operation: operation.to_owned(),
            outcome,
            stdout_truncated: stdout.truncated,
            stderr_truncated: stderr.truncated,
            stdout: stdout.into_text(cap),
            stderr: stderr.into_text(cap),
            exit_code,
            duration_ms: millis(elapsed),
            reason: None,
        }
    }

    /// The process was killed after exceeding `limit`. No output is reported.
    pub fn timeout(operation: &str, limit: Duration, elapsed: Duration) -> Self {
        Self {
            operation: operation.to_owned(),
            outcome: Outcome::Timeout,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: millis(elapsed),
            reason: Some(format!("exceeded time limit of {}ms", millis(limit))),
        }
    }

    /// The process could not be started.
    pub fn rejected(operation: &str, reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            operation: operation.to_owned(),
            outcome: Outcome::Rejected,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: millis(elapsed),
            reason: Some(reason.into()),
        }
    }

    /// One-line summary for logs.
    pub fn summary(&self) -> String {
        match self.outcome {
            Outcome::Success | Outcome::Failure => format!(
                "{} (exit code: {:?}, {}ms, {} bytes output)",
                self.outcome.as_str(),
                self.exit_code,
                self.duration_ms,
                self.stdout.len().saturating_add(self.stderr.len())
            ),
            Outcome::Timeout | Outcome::Rejected => format!(
                "{} after {}ms: {}",
                self.outcome.as_str(),
                self.duration_ms,
                self.reason.as_deref().unwrap_or("")
            ),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn captured(s: &str) -> CapturedOutput {
        CapturedOutput {
            bytes: s.as_bytes().to_vec(),
            truncated: false,
        }
    }

    #[test]
    fn exit_zero_is_success() {
        let r = ExecutionResult::completed(
            "echo",
            Some(0),
            captured("hello\n"),
            captured(""),
            1024,
            Duration::from_millis(3),
        );
        assert_eq!(r.outcome, Outcome::Success);
        assert_eq!(r.stdout, "hello\n");
        assert_eq!(r.duration_ms, 3);
        assert!(r.summary().starts_with("success"));
    }

    #[test]
    fn nonzero_or_signal_is_failure() {
        let r = ExecutionResult::completed(
            "x",
            Some(2),
            captured(""),
            captured("boom"),
            64,
            Duration::ZERO,
        );
        assert_eq!(r.outcome, Outcome::Failure);
        assert_eq!(r.stderr, "boom");

        let r =
            ExecutionResult::completed("x", None, captured(""), captured(""), 64, Duration::ZERO);
        assert_eq!(r.outcome, Outcome::Failure);
    }

    #[test]
    fn timeout_has_no_output() {
        let r =
            ExecutionResult::timeout("slow", Duration::from_secs(1), Duration::from_millis(1002));
        assert_eq!(r.outcome, Outcome::Timeout);
        assert!(r.stdout.is_empty() && r.stderr.is_empty());
        assert_eq!(r.exit_code, None);
        assert_eq!(r.reason.as_deref(), Some("exceeded time limit of 1000ms"));
    }

    #[test]
    fn text_never_exceeds_cap_after_lossy_decode() {
        // "é" is two bytes; cutting after the first byte leaves an invalid tail.
        let out = CapturedOutput {
            bytes: vec![b'a', b'b', 0xC3],
            truncated: true,
        };
        let text = out.into_text(3);
        assert!(text.len() <= 3);
        assert!(text.starts_with("ab"));
    }

    #[test]
    fn serializes_snake_case_outcome() {
        let r = ExecutionResult::rejected("gone", "spawn failed: not found", Duration::ZERO);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["outcome"], "rejected");
        assert_eq!(json["reason"], "spawn failed: not found");
        assert!(json["exit_code"].is_null());
    }
}
