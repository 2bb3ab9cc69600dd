//! Async retry wrapper shared by every external call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use leadflow_observability::metrics::{RETRIES_TOTAL, RETRY_EXHAUSTED_TOTAL};

use super::policy::{Classify, ErrorClass, RetryPolicy};
use crate::metrics::QueueMetrics;

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> AttemptError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            AttemptError::Failed(e) => Some(e),
            AttemptError::TimedOut(_) => None,
        }
    }
}

/// Final failure of a wrapped operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetryError<E> {
    /// Classified terminal; never retried.
    #[error("terminal failure after {attempts} attempt(s): {error}")]
    Terminal { attempts: u32, error: E },
    /// Still transient when attempts ran out.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: AttemptError<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryError::Terminal { .. })
    }
}

/// Runs operations under a [`RetryPolicy`] and records retry telemetry.
#[derive(Debug, Clone)]
pub struct RetryRunner {
    metrics: QueueMetrics,
}

impl RetryRunner {
    pub fn new(metrics: QueueMetrics) -> Self {
        Self { metrics }
    }

    /// Run `op` using the error type's own classification.
    pub async fn execute<T, E, F, Fut>(
        &self,
        op_name: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Classify + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(op_name, policy, |e: &E| e.classify(), op)
            .await
    }

    /// Run `op` with an explicit classifier.
    ///
    /// An attempt that outlives `policy.attempt_timeout` is dropped and
    /// counts as a transient failure.
    pub async fn execute_with<T, E, C, F, Fut>(
        &self,
        op_name: &str,
        policy: &RetryPolicy,
        classify: C,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: Display,
        C: Fn(&E) -> ErrorClass,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let result = match policy.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(r) => r.map_err(AttemptError::Failed),
                    Err(_) => Err(AttemptError::TimedOut(limit)),
                },
                None => op().await.map_err(AttemptError::Failed),
            };

            let failure = match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = op_name, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let failure = match failure {
                AttemptError::Failed(error) if classify(&error) == ErrorClass::Terminal => {
                    warn!(op = op_name, attempt, error = %error, "terminal failure, not retrying");
                    self.metrics.incr(RETRY_EXHAUSTED_TOTAL, 1).await;
                    return Err(RetryError::Terminal {
                        attempts: attempt,
                        error,
                    });
                }
                other => other,
            };

            if !policy.should_retry(attempt) || attempt >= max_attempts {
                warn!(op = op_name, attempts = attempt, error = %failure, "retries exhausted");
                self.metrics.incr(RETRY_EXHAUSTED_TOTAL, 1).await;
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: failure,
                });
            }

            let delay = policy.jittered_delay(attempt);
            warn!(
                op = op_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "transient failure, retrying"
            );
            self.metrics.incr(RETRIES_TOTAL, 1).await;
            tokio::time::sleep(delay).await;
        }
    }
}
