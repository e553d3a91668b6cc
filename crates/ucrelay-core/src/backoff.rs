//! Bounded exponential backoff for registry and heartbeat calls.

use crate::error::RelayResult;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy: `initial * 2^attempt`, capped at `max`, at most `max_retries`
/// retries after the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Backoff {
    #[serde(default = "default_initial_ms", rename = "initial_ms", with = "millis")]
    pub initial: Duration,
    #[serde(default = "default_max_ms", rename = "max_ms", with = "millis")]
    pub max: Duration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_ms() -> Duration {
    Duration::from_millis(50)
}
fn default_max_ms() -> Duration {
    Duration::from_millis(1_000)
}
fn default_max_retries() -> u32 {
    4
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: default_initial_ms(),
            max: default_max_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            initial,
            max,
            max_retries,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 0)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned on exhaustion.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    debug!(op = what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(op = what, attempts = attempt + 1, error = %e, "retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{InfraError, ResolutionError};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delays_grow_and_cap() {
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(70), 5);
        assert_eq!(b.delay(0), Duration::from_millis(10));
        assert_eq!(b.delay(1), Duration::from_millis(20));
        assert_eq!(b.delay(2), Duration::from_millis(40));
        assert_eq!(b.delay(3), Duration::from_millis(70));
        assert_eq!(b.delay(40), Duration::from_millis(70));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let b = Backoff::new(Duration::from_millis(10), Duration::from_millis(100), 3);
        let c = calls.clone();
        let out = b
            .retry("test", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(InfraError::RegistryUnavailable("down".into()).into())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let b = Backoff::new(Duration::from_millis(1), Duration::from_millis(2), 2);
        let c = calls.clone();
        let err = b
            .retry("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(InfraError::RegistryUnavailable("down".into()).into())
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_decisions() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = Backoff::default()
            .retry("test", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ResolutionError::NoHealthyProxy.into())
                }
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
