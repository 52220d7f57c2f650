//! Bounded exponential backoff around remote calls.
//!
//! Every adapter call goes through [`RetryPolicy::execute`]. Rate limits and
//! transient failures are retried with a per-call backoff; daily quota flips the
//! provider into fallback mode; anything else is fatal. Each provider owns one
//! policy, whose gate caps how many of its calls are in flight at once.

use crate::error::{ProviderError, Result, SyncError};
use crate::models::ProviderKind;
use crate::state::RunState;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Timeout applied to each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
            call_timeout: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// `base * 2^attempt` capped at `max_delay`, attempt 0-indexed.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt.min(31) as i32);
        let secs = (self.base_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Backoff plus up to 20% additive jitter, still capped.
    fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..0.2) * delay.as_secs_f64();
        Duration::from_secs_f64((delay.as_secs_f64() + extra).min(self.max_delay.as_secs_f64()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    /// Sleeps taken between attempts, in order. Never decreasing.
    pub delays: Vec<Duration>,
}

#[derive(Debug)]
pub struct RetryPolicy {
    provider: ProviderKind,
    config: RetryConfig,
    gate: Semaphore,
}

impl RetryPolicy {
    pub fn new(provider: ProviderKind, config: RetryConfig, concurrency_limit: usize) -> Self {
        Self {
            provider,
            config,
            gate: Semaphore::new(concurrency_limit.max(1)),
        }
    }

    pub async fn execute<T, F, Fut>(&self, state: &RunState, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        self.execute_with_stats(state, what, op).await.0
    }

    pub async fn execute_with_stats<T, F, Fut>(&self, state: &RunState, what: &str, mut op: F) -> (Result<T>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let provider = self.provider;
        let max_attempts = self.config.max_attempts.max(1);
        let mut stats = RetryStats::default();
        let mut previous = Duration::ZERO;

        for attempt in 0..max_attempts {
            stats.attempts = attempt + 1;

            let outcome = match self.gate.acquire().await {
                Ok(_permit) => match tokio::time::timeout(self.config.call_timeout, op()).await {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "timed out after {:?}",
                        self.config.call_timeout
                    ))),
                },
                Err(e) => Err(ProviderError::Fatal(format!("request gate closed: {}", e))),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(provider = %provider, what, attempts = attempt + 1, "succeeded after retry");
                    }
                    return (Ok(value), stats);
                }
                Err(err) => err,
            };

            match err {
                ProviderError::QuotaExhausted(message) => {
                    debug!(provider = %provider, what, %message, "quota signal");
                    state.mark_quota_exhausted(provider);
                    return (Err(SyncError::QuotaExhausted { provider }), stats);
                }
                ProviderError::Fatal(message) => {
                    return (Err(SyncError::Fatal { provider, message }), stats);
                }
                retryable => {
                    if attempt + 1 >= max_attempts {
                        warn!(provider = %provider, what, attempts = max_attempts, error = %retryable, "retries exhausted");
                        return (
                            Err(SyncError::RetryExhausted {
                                provider,
                                attempts: max_attempts,
                                last_error: retryable.to_string(),
                            }),
                            stats,
                        );
                    }

                    let mut delay = self.config.delay_for(attempt);
                    if let ProviderError::RateLimited { retry_after: Some(after), .. } = &retryable {
                        delay = delay.max(*after);
                    }
                    delay = delay.max(previous);
                    previous = delay;
                    stats.delays.push(delay);

                    warn!(
                        provider = %provider,
                        what,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %retryable,
                        "retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // max_attempts >= 1, so the loop always returns.
        (
            Err(SyncError::RetryExhausted {
                provider,
                attempts: max_attempts,
                last_error: "no attempt made".into(),
            }),
            stats,
        )
    }
}
