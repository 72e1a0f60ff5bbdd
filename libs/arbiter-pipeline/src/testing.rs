// Scripted sandbox shared by the unit and scenario tests.
//
// The "program" is driven by markers instead of real execution:
// - code containing `SYNTAX` fails to compile
// - code containing `WRONG` prints `nope`
// - stdin `loop` runs until the sandbox's own run limit, stdin `crash` exits with 1
// - anything else echoes stdin

use crate::sandbox::{Sandbox, SandboxError, SandboxOutput};
use arbiter_common::types::Language;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const DIAGNOSTIC: &str = "main.py:1: SyntaxError: invalid syntax";

#[derive(Default)]
pub struct ScriptedSandbox {
    pub delay: Duration,
    /// Number of initial calls answered with `Unavailable`
    pub unavailable_calls: usize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, ..Default::default() }
    }

    pub fn unavailable(calls: usize) -> Self {
        Self {
            unavailable_calls: calls,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn execute(
        &self,
        code: &str,
        _language: Language,
        stdin: &str,
        timeout_ms: u64,
    ) -> Result<SandboxOutput, SandboxError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if call < self.unavailable_calls {
            return Err(SandboxError::Unavailable("connection refused".to_string()));
        }

        tokio::time::sleep(self.delay).await;

        if code.contains("SYNTAX") {
            return Err(SandboxError::CompileError(DIAGNOSTIC.to_string()));
        }
        match stdin {
            "loop" => {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                Err(SandboxError::Timeout)
            }
            "crash" => Err(SandboxError::RuntimeError {
                message: "Traceback: ZeroDivisionError".to_string(),
                stdout: String::new(),
                exit_code: Some(1),
            }),
            _ => Ok(SandboxOutput {
                stdout: if code.contains("WRONG") {
                    "nope\n".to_string()
                } else {
                    format!("{}\n", stdin)
                },
                stderr: String::new(),
                exit_code: 0,
                duration_ms: self.delay.as_millis() as u64,
            }),
        }
    }
}
