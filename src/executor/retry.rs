// Bounded retry with exponential backoff
//
// Only transient errors (pool exhaustion, transport failures) are retried.
// Task-logic failures, authentication failures and cancellation end the
// loop immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output::errors::EngineError;

/// Retry policy for connection acquisition and module execution
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter factor: up to `delay * jitter` is added to each delay
    pub jitter: f64,
    /// Total time budget across attempts and delays
    pub budget: Option<Duration>,
    /// Treat task timeouts as retryable
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
            budget: None,
            retry_on_timeout: false,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
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

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_retry_on_timeout(mut self, retry: bool) -> Self {
        self.retry_on_timeout = retry;
        self
    }

    /// Whether this policy allows another try after `err`
    pub fn should_retry(&self, err: &EngineError) -> bool {
        match err {
            EngineError::Timeout { .. } => self.retry_on_timeout,
            other => other.is_transient(),
        }
    }

    /// Backoff without jitter for the delay following attempt `attempt` (0-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let delay_ms = (self.base_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Calculate delay for a retry attempt, jitter included
pub fn calculate_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy.backoff(attempt);

    if policy.jitter > 0.0 {
        let max_jitter = (delay.as_millis() as f64 * policy.jitter) as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
        delay + Duration::from_millis(jitter_ms)
    } else {
        delay
    }
}

/// A successful value together with the number of attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// A terminal error together with the number of attempts made
#[derive(Debug)]
pub struct RetryFailure {
    pub error: EngineError,
    pub attempts: u32,
}

/// Run `op` under `policy`.
///
/// `op` receives the 1-based attempt number. When attempts run out on a
/// transient error the result is `EngineError::RetriesExhausted`; permanent
/// errors are returned unchanged after the attempt that produced them.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<Retried<T>, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match op(attempt).await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Err(e) => e,
        };

        if !policy.should_retry(&err) {
            return Err(RetryFailure {
                error: err,
                attempts: attempt,
            });
        }

        if attempt >= max_attempts {
            return Err(RetryFailure {
                error: EngineError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                },
                attempts: attempt,
            });
        }

        let delay = calculate_delay(policy, attempt - 1);

        if let Some(budget) = policy.budget {
            if started.elapsed() + delay > budget {
                warn!(attempt, error = %err, "retry budget spent");
                return Err(RetryFailure {
                    error: EngineError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    },
                    attempts: attempt,
                });
            }
        }

        warn!(attempt, max_attempts, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, retrying");

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RetryFailure {
                    error: EngineError::Cancelled,
                    attempts: attempt,
                });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
