use std::future::Future;
use std::time::Duration;

use newsroom_core::config::RateLimitConfig;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, warn};

use crate::pipeline::ModelError;

/// Upper bound of the random extra delay added to a backoff, as a fraction of it.
const JITTER_FRACTION: f64 = 0.1;

/// Paces outbound model calls and retries the rate-limited ones.
///
/// Calls are serialized: the lock is held for the whole call, including
/// retries, so backoff delays compose predictably.
pub struct RateLimiter {
    min_interval: Duration,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    /// End of the previous call.
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(
        min_interval: Duration,
        max_retries: u32,
        base_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            min_interval,
            max_retries,
            base_backoff,
            max_backoff: max_backoff.max(base_backoff),
            last_call: Mutex::new(None),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.min_interval_ms),
            cfg.max_retries,
            Duration::from_millis(cfg.base_backoff_ms),
            Duration::from_millis(cfg.max_backoff_ms),
        )
    }

    /// Run `op` once the minimum spacing has elapsed.
    ///
    /// `RateLimited` replies are retried up to `max_retries` times with
    /// exponential backoff (never shorter than the server's `retry_after`).
    /// `Failed` is returned immediately.
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let mut last_call = self.last_call.lock().await;
        let mut backoff = self.base_backoff;
        let mut attempt = 0u32;

        loop {
            if let Some(prev) = *last_call {
                sleep_until(prev + self.min_interval).await;
            }
            let result = op().await;
            *last_call = Some(Instant::now());

            match result {
                Err(ModelError::RateLimited { retry_after_ms }) if attempt < self.max_retries => {
                    attempt += 1;
                    let base = backoff.max(Duration::from_millis(retry_after_ms));
                    let delay = base + jitter(base);
                    warn!(
                        call = %label,
                        attempt,
                        max = self.max_retries,
                        retry_after_ms = delay.as_millis() as u64,
                        "model call rate limited, backing off"
                    );
                    sleep(delay).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
                other => {
                    if attempt > 0 {
                        debug!(call = %label, attempts = attempt + 1, ok = other.is_ok(), "rate-limited call settled");
                    }
                    return other;
                }
            }
        }
    }
}

/// Jitter offset in `0 .. JITTER_FRACTION * base`, taken from the clock's
/// sub-second nanos.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(nanos as u64 % max_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(min_ms: u64, retries: u32) -> RateLimiter {
        RateLimiter::new(
            Duration::from_millis(min_ms),
            retries,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn succeeds_after_rate_limits() {
        let limiter = limiter(0, 3);
        let calls = AtomicU32::new(0);
        let out = limiter
            .call("summarize", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ModelError::RateLimited { retry_after_ms: 1 })
                } else {
                    Ok("done")
                }
            })
            .await;
        assert_eq!(out, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let limiter = limiter(0, 2);
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = limiter
            .call("compose", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::RateLimited { retry_after_ms: 1 })
            })
            .await;
        assert!(matches!(out, Err(ModelError::RateLimited { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hard_failures_are_not_retried() {
        let limiter = limiter(0, 5);
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = limiter
            .call("summarize", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::Failed("bad model".into()))
            })
            .await;
        assert_eq!(out, Err(ModelError::Failed("bad model".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consecutive_calls_are_spaced() {
        let limiter = limiter(40, 0);
        let start = Instant::now();
        limiter.call("a", || async { Ok::<_, ModelError>(()) }).await.unwrap();
        limiter.call("b", || async { Ok::<_, ModelError>(()) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        for ms in [0u64, 5, 100, 60_000] {
            let base = Duration::from_millis(ms);
            assert!(jitter(base) <= base / 10);
        }
    }
}
