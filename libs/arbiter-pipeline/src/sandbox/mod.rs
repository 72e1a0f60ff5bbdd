//! Sandbox Client - contract with the external code-execution service
//!
//! **Responsibility:**
//! Map one (code, language, stdin) request onto a sandbox call and its answer
//! onto an `ExecutionOutcome`.
//!
//! **Boundary:**
//! - Knows nothing about test cases, weights or scoring
//! - Backstops the sandbox's run timeout and honours the attempt's cancellation signal
//! - Dropping an in-flight call abandons it; the sandbox kills its own process
pub mod docker;

use crate::cancel::{CancelReason, CancelSignal};
use arbiter_common::types::{ExecutionKind, ExecutionOutcome, Language};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub use docker::DockerSandbox;

/// Successful run as reported by the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxError {
    #[error("compile error: {0}")]
    CompileError(String),

    #[error("runtime error: {message}")]
    RuntimeError {
        message: String,
        stdout: String,
        exit_code: Option<i64>,
    },

    #[error("time limit exceeded")]
    Timeout,

    #[error("sandbox unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    async fn execute(
        &self,
        code: &str,
        language: Language,
        stdin: &str,
        timeout_ms: u64,
    ) -> Result<SandboxOutput, SandboxError>;
}

/// Result of one dispatch through the client
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Completed(ExecutionOutcome),
    Cancelled(CancelReason),
}

#[derive(Clone)]
pub struct SandboxClient {
    sandbox: Arc<dyn Sandbox>,
    /// Extra time on top of the run budget for image pulls, container start and compilation
    setup_allowance: Duration,
}

impl SandboxClient {
    pub fn new(sandbox: Arc<dyn Sandbox>, setup_allowance: Duration) -> Self {
        Self {
            sandbox,
            setup_allowance,
        }
    }

    /// Run once and abandon the call as soon as `cancel` fires.
    ///
    /// The sandbox enforces `timeout` on the program run itself. The client only
    /// steps in when the whole call, setup included, overruns `timeout` plus the
    /// setup allowance.
    pub async fn run(
        &self,
        test_id: u32,
        code: &str,
        language: Language,
        stdin: &str,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Dispatch {
        if let Some(reason) = cancel.reason() {
            return Dispatch::Cancelled(reason);
        }

        let started = Instant::now();
        let timeout_ms = timeout.as_millis() as u64;
        let call = tokio::time::timeout(
            timeout + self.setup_allowance,
            self.sandbox.execute(code, language, stdin, timeout_ms),
        );

        let result = tokio::select! {
            biased;
            reason = cancel.cancelled() => {
                debug!(test_id, %reason, "Abandoning sandbox call");
                return Dispatch::Cancelled(reason);
            }
            result = call => result,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let mapped = match result {
            Err(_elapsed) => {
                warn!(test_id, elapsed_ms, "Sandbox overran its deadline");
                outcome(test_id, ExecutionKind::Timeout, "", "", None, elapsed_ms)
            }
            Ok(Ok(output)) => ExecutionOutcome {
                test_id,
                kind: ExecutionKind::Ok,
                stdout: output.stdout,
                stderr: output.stderr,
                exit_code: Some(output.exit_code),
                duration_ms: output.duration_ms,
            },
            Ok(Err(SandboxError::CompileError(message))) => {
                outcome(test_id, ExecutionKind::CompileError, "", &message, None, elapsed_ms)
            }
            Ok(Err(SandboxError::RuntimeError { message, stdout, exit_code })) => outcome(
                test_id,
                ExecutionKind::RuntimeError,
                &stdout,
                &message,
                exit_code,
                elapsed_ms,
            ),
            Ok(Err(SandboxError::Timeout)) => {
                outcome(test_id, ExecutionKind::Timeout, "", "", None, elapsed_ms)
            }
            Ok(Err(SandboxError::Unavailable(message))) => {
                outcome(test_id, ExecutionKind::SandboxUnavailable, "", &message, None, elapsed_ms)
            }
        };
        Dispatch::Completed(mapped)
    }
}

fn outcome(
    test_id: u32,
    kind: ExecutionKind,
    stdout: &str,
    stderr: &str,
    exit_code: Option<i64>,
    duration_ms: u64,
) -> ExecutionOutcome {
    ExecutionOutcome {
        test_id,
        kind,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        exit_code,
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy(Duration);

    #[async_trait]
    impl Sandbox for Sleepy {
        async fn execute(
            &self,
            _code: &str,
            _language: Language,
            stdin: &str,
            _timeout_ms: u64,
        ) -> Result<SandboxOutput, SandboxError> {
            tokio::time::sleep(self.0).await;
            match stdin {
                "crash" => Err(SandboxError::RuntimeError {
                    message: "panic".to_string(),
                    stdout: "partial".to_string(),
                    exit_code: Some(101),
                }),
                "syntax" => Err(SandboxError::CompileError("expected ';'".to_string())),
                _ => Ok(SandboxOutput {
                    stdout: stdin.to_string(),
                    stderr: String::new(),
                    exit_code: 0,
                    duration_ms: self.0.as_millis() as u64,
                }),
            }
        }
    }

    fn client(delay_ms: u64) -> SandboxClient {
        SandboxClient::new(Arc::new(Sleepy(Duration::from_millis(delay_ms))), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_ok_maps_output() {
        let dispatch = client(1)
            .run(7, "code", Language::Python, "42", Duration::from_secs(1), &CancelSignal::new())
            .await;
        match dispatch {
            Dispatch::Completed(o) => {
                assert_eq!(o.test_id, 7);
                assert_eq!(o.kind, ExecutionKind::Ok);
                assert_eq!(o.stdout, "42");
                assert_eq!(o.exit_code, Some(0));
            }
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_enforced_by_client() {
        let dispatch = client(500)
            .run(1, "code", Language::Python, "x", Duration::from_millis(20), &CancelSignal::new())
            .await;
        match dispatch {
            Dispatch::Completed(o) => assert_eq!(o.kind, ExecutionKind::Timeout),
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_setup_does_not_eat_run_budget() {
        // 500ms of image pull and compilation against a 100ms run limit
        let client = SandboxClient::new(
            Arc::new(Sleepy(Duration::from_millis(500))),
            Duration::from_secs(5),
        );
        let dispatch = client
            .run(1, "code", Language::Java, "42", Duration::from_millis(100), &CancelSignal::new())
            .await;
        match dispatch {
            Dispatch::Completed(o) => {
                assert_eq!(o.kind, ExecutionKind::Ok);
                assert_eq!(o.stdout, "42");
            }
            other => panic!("unexpected dispatch: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_error_kinds() {
        let c = client(1);
        let cancel = CancelSignal::new();
        let crash = c.run(1, "", Language::Rust, "crash", Duration::from_secs(1), &cancel).await;
        let syntax = c.run(2, "", Language::Rust, "syntax", Duration::from_secs(1), &cancel).await;
        let Dispatch::Completed(crash) = crash else {
            panic!("crash was not completed");
        };
        assert_eq!(crash.kind, ExecutionKind::RuntimeError);
        assert_eq!(crash.stdout, "partial");

        let Dispatch::Completed(syntax) = syntax else {
            panic!("syntax was not completed");
        };
        assert_eq!(syntax.kind, ExecutionKind::CompileError);
        assert_eq!(syntax.stderr, "expected ';'");
    }

    #[tokio::test]
    async fn test_cancel_abandons_call() {
        let c = client(5_000);
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel(CancelReason::Superseded);
        });
        let started = Instant::now();
        let dispatch = c.run(1, "", Language::Java, "x", Duration::from_secs(10), &cancel).await;
        assert_eq!(dispatch, Dispatch::Cancelled(CancelReason::Superseded));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
