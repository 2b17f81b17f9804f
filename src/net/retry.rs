//! Exponential backoff with jitter around a single fallible call.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 429 / 500 / 502 / 503 / 504
    RetryableStatus(u16),
    /// reset, timeout, DNS, refused, broken pipe
    Transport,
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }
}

pub trait Classify {
    fn classify(&self) -> FailureClass;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub total_retries: u64,
    pub successes: u64,
    pub failures: u64,
    pub transport_retries: u64,
    pub retries_by_status: BTreeMap<u16, u64>,
}

pub struct RetryPolicy {
    config: RetryConfig,
    stats: Mutex<RetryStats>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// `min(max_delay, base * 2^attempt + uniform(0, jitter))`, attempt is zero-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.config.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter_cap = self.config.jitter.as_millis() as u64;
        let jitter_ms = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };
        let max_ms = self.config.max_delay.as_millis() as u64;
        Duration::from_millis(exp_ms.saturating_add(jitter_ms).min(max_ms))
    }

    fn with_stats(&self, f: impl FnOnce(&mut RetryStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut stats);
    }

    pub fn stats(&self) -> RetryStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. The last error is returned untouched.
    pub async fn execute_with_retry<T, E, F, Fut>(&self, context: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            self.with_stats(|s| s.total_attempts += 1);
            match operation().await {
                Ok(value) => {
                    self.with_stats(|s| s.successes += 1);
                    if attempt > 0 {
                        debug!(context, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let class = err.classify();
                    if !class.is_retryable() {
                        self.with_stats(|s| s.failures += 1);
                        debug!(context, error = %err, "non-retryable failure");
                        return Err(err);
                    }
                    if attempt >= self.config.max_retries {
                        self.with_stats(|s| s.failures += 1);
                        warn!(context, attempts = attempt + 1, error = %err, "retries exhausted");
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    self.with_stats(|s| {
                        s.total_retries += 1;
                        match class {
                            FailureClass::RetryableStatus(status) => {
                                *s.retries_by_status.entry(status).or_insert(0) += 1
                            }
                            FailureClass::Transport => s.transport_retries += 1,
                            FailureClass::Fatal => {}
                        }
                    });
                    warn!(
                        context,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
