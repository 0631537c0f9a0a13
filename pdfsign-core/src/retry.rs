// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Exponential backoff with jitter, for checkpoint retries and worker restarts

use crate::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy for durable checkpoints: a few quick attempts
    pub fn checkpoint() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Execute operation, retrying errors that may clear on their own
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        let mut backoff = Backoff::new(self);

        loop {
            attempt += 1;

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let pause = backoff.next_delay();
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Operation failed, retrying after {:?}",
                        pause
                    );
                    sleep(pause).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Growing delay sequence derived from a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            current: policy.initial_backoff,
            max: policy.max_backoff,
            multiplier: policy.multiplier,
            jitter: policy.jitter,
        }
    }

    /// Delay to wait now; the following one grows up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.jitter {
            add_jitter(self.current).min(self.max)
        } else {
            self.current
        };
        self.current = Duration::from_secs_f64(
            (self.current.as_secs_f64() * self.multiplier).min(self.max.as_secs_f64()),
        );
        delay
    }
}

fn add_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let jitter_ms = rand::thread_rng().gen_range(0..=duration.as_millis() / 4);
    duration + Duration::from_millis(jitter_ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retry_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = quick(3)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Storage("database is locked".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<()> = quick(5)
            .execute(|| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Validation("bad".to_string()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        let mut backoff = Backoff::new(&policy);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));

        let last = (0..20).map(|_| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_under_cap() {
        let mut backoff = Backoff::new(&RetryPolicy::default());
        for _ in 0..30 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
