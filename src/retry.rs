// =============================================================================
// Retry combinator — backoff schedules with a retryability predicate
// =============================================================================

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How long to pause before retry attempt `n` (0-based: the pause taken
/// after the (n+1)-th failure).
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// `2^n` seconds, capped. Used for read endpoints (1 s, 2 s, 4 s, …).
    ExponentialSecs { cap_secs: u64 },
    /// `base · 1.5^n`. Used for transfers (1.5 s, 2.25 s, …).
    GeometricMs { base_ms: u64 },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::ExponentialSecs { cap_secs } => {
                let secs = 1u64 << attempt.min(16);
                Duration::from_secs(secs.min(*cap_secs))
            }
            Self::GeometricMs { base_ms } => {
                let mut ms = *base_ms as f64;
                for _ in 0..attempt {
                    ms *= 1.5;
                }
                Duration::from_millis(ms as u64)
            }
        }
    }
}

/// Run `op` up to `max_attempts` times. A failed attempt is retried only
/// while `retryable(&err)` holds; the last error is returned otherwise.
pub async fn with_retries<T, E, F, Fut, P>(
    label: &str,
    max_attempts: u32,
    backoff: Backoff,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt + 1 >= max_attempts || !retryable(&err) {
                    return Err(err);
                }
                let delay = backoff.delay(attempt);
                debug!(
                    label,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
