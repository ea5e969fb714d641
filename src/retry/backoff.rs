//! Backoff Controller
//!
//! Decides per failed attempt whether to retry and how long to wait:
//! `min(cap, base * 2^attempt)`, reduced by up to half for jitter.

use super::classify::ErrorClass;
use crate::deadline::Deadline;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Largest exponent used; beyond it the cap always wins
const MAX_EXPONENT: u32 = 40;

/// Retry tuning differs between reads and mutating calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallClass {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    /// Subtract a random amount in `[0, wait/2]`
    #[default]
    Equal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Total time retries may take for non-conflict failures
    pub budget_ms: u64,
    #[serde(default)]
    pub jitter: Jitter,
}

impl BackoffPolicy {
    pub fn read() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 10_000,
            budget_ms: 3 * 60 * 1_000,
            jitter: Jitter::Equal,
        }
    }

    pub fn write() -> Self {
        Self {
            base_ms: 5_000,
            cap_ms: 60_000,
            budget_ms: 5 * 60 * 1_000,
            jitter: Jitter::Equal,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = Jitter::None;
        self
    }

    pub fn budget(&self) -> Duration {
        Duration::from_millis(self.budget_ms)
    }

    /// Un-jittered wait after the failure of attempt number `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(MAX_EXPONENT);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(self.cap_ms))
    }
}

/// Retry bookkeeping for one logical call
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// Index of the attempt that just failed, starting at 0
    pub number: u32,
    /// Unknown-class failures seen so far, including this one
    pub unknown_failures: u32,
    pub started: Instant,
}

impl Attempt {
    pub fn start() -> Self {
        Self {
            number: 0,
            unknown_failures: 0,
            started: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The classification is never retried (or Unknown recurred)
    NotRetryable,
    AttemptsExhausted,
    /// The per-class retry budget ran out
    BudgetExhausted,
    /// The caller's deadline would pass before the next attempt
    Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Retry,
    Fail(StopReason),
    Succeed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub outcome: RetryOutcome,
    pub wait: Duration,
    pub attempts_remaining: u32,
}

impl RetryDecision {
    fn succeed(attempts_remaining: u32) -> Self {
        Self {
            outcome: RetryOutcome::Succeed,
            wait: Duration::ZERO,
            attempts_remaining,
        }
    }

    fn retry(wait: Duration, attempts_remaining: u32) -> Self {
        Self {
            outcome: RetryOutcome::Retry,
            wait,
            attempts_remaining,
        }
    }

    fn fail(reason: StopReason) -> Self {
        Self {
            outcome: RetryOutcome::Fail(reason),
            wait: Duration::ZERO,
            attempts_remaining: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffController {
    pub policy: BackoffPolicy,
    /// Minimum wait after a throttling signal
    pub rate_limit_floor: Duration,
    /// Retry budget for Conflict, longer than the policy budget
    pub conflict_budget: Duration,
    /// Hard ceiling on attempts regardless of deadline
    pub max_attempts: u32,
    /// Unknown failures tolerated before giving up
    pub unknown_retries: u32,
}

impl BackoffController {
    /// Un-jittered wait for a failure of `class` at `attempt`
    pub fn wait(&self, attempt: u32, class: ErrorClass) -> Duration {
        let wait = self.policy.ceiling(attempt);
        if class == ErrorClass::RateLimited {
            wait.max(self.rate_limit_floor)
        } else {
            wait
        }
    }

    /// Decide after attempt `attempt`; `failure` is `None` when it succeeded
    pub fn next(
        &self,
        attempt: &Attempt,
        failure: Option<ErrorClass>,
        deadline: &Deadline,
    ) -> RetryDecision {
        let attempts_remaining = self.max_attempts.saturating_sub(attempt.number + 1);
        let Some(class) = failure else {
            return RetryDecision::succeed(attempts_remaining);
        };
        if !class.is_retryable() {
            return RetryDecision::fail(StopReason::NotRetryable);
        }
        if class == ErrorClass::Unknown && attempt.unknown_failures > self.unknown_retries {
            return RetryDecision::fail(StopReason::NotRetryable);
        }

        if attempts_remaining == 0 {
            return RetryDecision::fail(StopReason::AttemptsExhausted);
        }

        let wait = self.jittered(self.wait(attempt.number, class));
        let budget = match class {
            ErrorClass::Conflict => self.conflict_budget,
            _ => self.policy.budget(),
        };
        if attempt.started.elapsed() + wait > budget {
            return RetryDecision::fail(StopReason::BudgetExhausted);
        }
        if wait >= deadline.remaining() {
            return RetryDecision::fail(StopReason::Deadline);
        }

        RetryDecision::retry(wait, attempts_remaining)
    }

    fn jittered(&self, wait: Duration) -> Duration {
        match self.policy.jitter {
            Jitter::None => wait,
            Jitter::Equal => {
                let half = (wait.as_millis() / 2) as u64;
                if half == 0 {
                    return wait;
                }
                let jitter = rand::thread_rng().gen_range(0..=half);
                wait - Duration::from_millis(jitter)
            },
        }
    }
}
