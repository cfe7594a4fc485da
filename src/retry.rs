//! Retry, backoff, and circuit breaking around a single task execution
//!
//! Policy lives here once - attempt counts, delays, breaker windows - instead
//! of being re-spelled at every call site.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::worker::{CapabilityWorker, IdempotencyKind, WorkerError};
use crate::types::WorkerOutput;

/// Retry policy applied to every worker call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (default 3)
    pub max_attempts: u32,
    /// Delay before the first retry (default 1s; then 2s, 4s, ...)
    pub base_delay: Duration,
    /// Exponential backoff factor (default 2)
    pub backoff_factor: u32,
    /// Ceiling on any single backoff delay
    pub max_delay: Duration,
    /// Timeout applied to each individual worker call
    pub call_timeout: Duration,
    /// Consecutive failures before the breaker opens
    pub breaker_threshold: u32,
    /// How long an open breaker fails fast before closing again
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2,
            max_delay: Duration::from_secs(8),
            call_timeout: Duration::from_secs(30),
            breaker_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Failure modes of a controlled execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetryError {
    /// Transient failures exhausted every attempt
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { last: WorkerError, attempts: u32 },

    /// Permanent failure - never retried
    #[error("permanent failure: {0}")]
    Permanent(WorkerError),

    /// The capability+subject pair is cooling down; fail fast
    #[error("circuit open for {0}")]
    CircuitOpen(String),

    /// A non-idempotent task may have partially applied; not retried
    #[error("duplicate risk: prior attempt may have applied for {0}")]
    DuplicateRisk(String),
}

impl RetryError {
    /// Machine-readable failure class for task error records
    pub fn kind(&self) -> &'static str {
        match self {
            RetryError::Exhausted { last, .. } => last.kind(),
            RetryError::Permanent(e) => e.kind(),
            RetryError::CircuitOpen(_) => "circuit-open",
            RetryError::DuplicateRisk(_) => "duplicate-risk",
        }
    }

    /// Whether the condition must be routed to the escalation layer instead
    /// of being recorded as a plain task failure
    pub fn needs_escalation(&self) -> bool {
        matches!(self, RetryError::DuplicateRisk(_) | RetryError::Exhausted { .. })
    }
}

/// Successful controlled execution
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub output: WorkerOutput,
    /// Retries consumed (attempts - 1)
    pub retries: u32,
}

#[derive(Debug, Clone)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
}

/// Circuit-breaker states keyed by capability+subject
///
/// Shared across runs: updates take the write lock, reads are cheap.
#[derive(Default)]
pub struct BreakerRegistry {
    states: RwLock<HashMap<String, BreakerState>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Fail fast if the key is cooling down; closes the breaker when the
    /// window has elapsed.
    pub fn check(&self, key: &str) -> Result<(), ()> {
        let now = Instant::now();
        let mut states = self.states.write();
        match states.get(key) {
            Some(BreakerState::Open { until }) if now < *until => Err(()),
            Some(BreakerState::Open { .. }) => {
                // Window elapsed: close, but one more failure reopens
                states.insert(
                    key.to_string(),
                    BreakerState::Closed {
                        consecutive_failures: 0,
                    },
                );
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn record_success(&self, key: &str) {
        self.states.write().remove(key);
    }

    /// Returns true if this failure opened the breaker
    pub fn record_failure(&self, key: &str, threshold: u32, cooldown: Duration) -> bool {
        let mut states = self.states.write();
        let failures = match states.get(key) {
            Some(BreakerState::Closed {
                consecutive_failures,
            }) => consecutive_failures + 1,
            Some(BreakerState::Open { .. }) => return false,
            None => 1,
        };

        if failures >= threshold {
            states.insert(
                key.to_string(),
                BreakerState::Open {
                    until: Instant::now() + cooldown,
                },
            );
            true
        } else {
            states.insert(
                key.to_string(),
                BreakerState::Closed {
                    consecutive_failures: failures,
                },
            );
            false
        }
    }

    pub fn is_open(&self, key: &str) -> bool {
        matches!(
            self.states.read().get(key),
            Some(BreakerState::Open { until }) if Instant::now() < *until
        )
    }
}

/// Wraps one task execution with bounded retries, exponential backoff, and
/// circuit breaking
#[derive(Clone)]
pub struct RetryController {
    policy: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a worker call under the retry policy.
    ///
    /// Transient failures are retried up to `max_attempts` with exponential
    /// backoff. Permanent failures return immediately. Non-idempotent work is
    /// retried only after `check_already_applied` confirms the prior attempt
    /// left no trace; an inconclusive or positive probe aborts with
    /// `DuplicateRisk`.
    pub async fn execute(
        &self,
        worker: &Arc<dyn CapabilityWorker>,
        subject_key: &str,
        input: serde_json::Value,
    ) -> Result<RetryOutcome, RetryError> {
        if self.breakers.check(subject_key).is_err() {
            warn!(subject = subject_key, "circuit open, failing fast");
            return Err(RetryError::CircuitOpen(subject_key.to_string()));
        }

        let mut attempt = 1u32;
        loop {
            let call = worker.execute(input.clone());
            let result = match tokio::time::timeout(self.policy.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(WorkerError::Timeout(format!(
                    "worker call exceeded {:?}",
                    self.policy.call_timeout
                ))),
            };

            match result {
                Ok(output) => {
                    self.breakers.record_success(subject_key);
                    return Ok(RetryOutcome {
                        output,
                        retries: attempt - 1,
                    });
                }
                Err(e) => {
                    let opened = self.breakers.record_failure(
                        subject_key,
                        self.policy.breaker_threshold,
                        self.policy.cooldown,
                    );
                    if opened {
                        warn!(subject = subject_key, error = %e, "circuit breaker opened");
                    }

                    if !e.is_transient() {
                        debug!(subject = subject_key, error = %e, "permanent failure, not retrying");
                        return Err(RetryError::Permanent(e));
                    }

                    if attempt >= self.policy.max_attempts {
                        return Err(RetryError::Exhausted {
                            last: e,
                            attempts: attempt,
                        });
                    }

                    if worker.idempotency_kind() == IdempotencyKind::Effectful {
                        match worker.check_already_applied(subject_key).await {
                            Ok(false) => {}
                            // Applied (or unknowable): retrying risks duplication
                            _ => {
                                warn!(
                                    subject = subject_key,
                                    "cannot confirm prior attempt left no trace"
                                );
                                return Err(RetryError::DuplicateRisk(subject_key.to_string()));
                            }
                        }
                    }

                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        subject = subject_key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
