use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Capped exponential backoff: `base * 2^(attempt-1)`, never above `cap`.
///
/// Attempts are 1-based; attempt 0 is treated like attempt 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay to wait before the given attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self.base_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(delay.min(self.cap_ms))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1_000, 16_000)
    }
}

/// Run `operation` up to `max_attempts` times, sleeping `backoff_fn(attempt)`
/// between failures. The last error is returned.
pub async fn with_retry_and_backoff<T, E, F, B>(
    operation: F,
    max_attempts: usize,
    log_context: &str,
    backoff_fn: B,
) -> Result<T, E>
where
    F: Fn() -> futures::future::BoxFuture<'static, Result<T, E>> + Send + Sync,
    E: Display + Send,
    B: Fn(usize) -> Duration + Send + Sync,
    T: Send,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", log_context, attempt);
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                error!("{} failed after {} attempts: {}", log_context, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff_fn(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    log_context, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`Backoff`] as a closure for [`with_retry_and_backoff`]
pub fn exponential_backoff(
    base_ms: u64,
    max_ms: Option<u64>,
) -> impl Fn(usize) -> Duration + Send + Sync {
    let backoff = Backoff::new(base_ms, max_ms.unwrap_or(u64::MAX));
    move |attempt| backoff.delay_for_attempt(attempt.min(u32::MAX as usize) as u32)
}
