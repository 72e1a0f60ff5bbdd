use crate::error::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Retries after the first try
    pub retries: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            retries,
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms.max(base_ms)),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn total_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// Retry `op` while the store reports transient failures, sleeping between tries.
/// Logical failures (conflicts, missing records) return immediately.
pub async fn retry_transient<T, F, Fut>(
    backoff: &Backoff,
    operation: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < backoff.retries => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient store failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}
