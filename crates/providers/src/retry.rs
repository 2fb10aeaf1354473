//! Per-request retry with exponential backoff + jitter.
//!
//! One engine instance serves one outbound request at a time (never a
//! multi-step run: composites expose each step as its own retryable unit,
//! and a previously succeeded step is never replayed).  Transient failures
//! back off with a provider-supplied `retry_after` floor; terminal failures
//! surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use sb_domain::config::RetryConfig;

use crate::traits::ProviderFailure;

#[derive(Debug, Clone)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` up to `attempts` times.  The closure receives the 1-based
    /// attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        op_name: &str,
        mut op: F,
    ) -> Result<T, ProviderFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProviderFailure>>,
    {
        let attempts = self.config.attempts.max(1);
        let mut last: Option<ProviderFailure> = None;

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.kind.is_transient() && attempt < attempts => {
                    let delay = self.delay_for(attempt, failure.retry_after);
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        kind = %failure.kind,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying"
                    );
                    last = Some(failure);
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        kind = %failure.kind,
                        "terminal failure"
                    );
                    return Err(failure);
                }
            }
        }

        Err(last.unwrap_or_else(|| {
            ProviderFailure::new(
                sb_domain::error::ErrorKind::Internal,
                format!("{op_name}: retries exhausted"),
            )
        }))
    }

    /// `min(max(min_delay * 2^(attempt-1), retry_after), max_delay)` with
    /// multiplicative jitter.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .config
            .min_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
        let floor = retry_after
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
            .max(exp);
        let capped = floor.min(self.config.max_delay_ms);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((capped as f64 * factor) as u64)
    }
}
