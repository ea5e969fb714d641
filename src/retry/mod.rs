//! Retry driver
//!
//! Combines the [`ErrorClassifier`] and the per-call-class
//! [`BackoffController`] into a single loop that every remote call goes
//! through. Callers only ever see the terminal outcome.
//!
//! # Module Structure
//!
//! - [`classify`] - maps remote failures to an [`ErrorClass`]
//! - [`backoff`] - exponential backoff with jitter, budgets and ceilings
//! - [`limit`] - per-action token buckets spacing outgoing requests

pub mod backoff;
pub mod classify;
pub mod limit;

pub use backoff::{
    Attempt, BackoffController, BackoffPolicy, CallClass, Jitter, RetryDecision, RetryOutcome,
    StopReason,
};
pub use classify::{ErrorClass, ErrorClassifier};
pub use limit::{ActionLimiter, RateLimitConfig};

use crate::config::RetryConfig;
use crate::deadline::{Deadline, Interrupt};
use crate::error::{ReconcileError, Result};
use crate::remote::RemoteFailure;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// How a NotFound answer is treated by the retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotFoundPolicy {
    /// Surface it to the caller immediately
    Surface,
    /// Retry it like a transient failure (read-after-write visibility)
    Retry,
}

/// Description of one logical remote call
#[derive(Debug, Clone, Copy)]
pub struct Call<'a> {
    pub op: &'a str,
    pub class: CallClass,
    pub not_found: NotFoundPolicy,
    /// Rate limiter key; defaults to `op`
    action: Option<&'a str>,
}

impl<'a> Call<'a> {
    pub fn read(op: &'a str) -> Self {
        Self {
            op,
            class: CallClass::Read,
            not_found: NotFoundPolicy::Surface,
            action: None,
        }
    }

    pub fn write(op: &'a str) -> Self {
        Self {
            op,
            class: CallClass::Write,
            not_found: NotFoundPolicy::Surface,
            action: None,
        }
    }

    pub fn retry_not_found(mut self) -> Self {
        self.not_found = NotFoundPolicy::Retry;
        self
    }

    /// Share a rate limit bucket with every call naming the same action
    pub fn for_action(mut self, action: &'a str) -> Self {
        self.action = Some(action);
        self
    }

    pub fn action(&self) -> &'a str {
        self.action.unwrap_or(self.op)
    }
}

/// Error for a call stopped by its deadline or by cancellation.
///
/// `last` is the most recent classified failure. Conflict retries cut
/// short by the deadline still report the conflict.
pub(crate) fn interrupted(
    interrupt: Interrupt,
    op: &str,
    started: Instant,
    attempts: u32,
    last: Option<(ErrorClass, RemoteFailure)>,
) -> ReconcileError {
    match (interrupt, last) {
        (Interrupt::Cancelled, _) => ReconcileError::Cancelled { op: op.to_string() },
        (Interrupt::Expired, Some((ErrorClass::Conflict, failure))) => {
            ReconcileError::exhausted(op, ErrorClass::Conflict, attempts, failure)
        },
        (Interrupt::Expired, last) => ReconcileError::DeadlineExceeded {
            op: op.to_string(),
            elapsed: started.elapsed(),
            last_failure: last.map(|(_, failure)| failure),
        },
    }
}

#[derive(Debug, Clone)]
pub struct Retrier {
    classifier: ErrorClassifier,
    read: BackoffController,
    write: BackoffController,
    limiter: Arc<ActionLimiter>,
}

impl Retrier {
    pub fn new(config: &RetryConfig, classifier: ErrorClassifier) -> Self {
        Self {
            classifier,
            read: config.controller(CallClass::Read),
            write: config.controller(CallClass::Write),
            limiter: Arc::new(ActionLimiter::new(config.rate_limit.clone())),
        }
    }

    /// Same budgets and rate limit buckets, different classifier
    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn limiter(&self) -> &ActionLimiter {
        &self.limiter
    }

    pub fn controller(&self, class: CallClass) -> &BackoffController {
        match class {
            CallClass::Read => &self.read,
            CallClass::Write => &self.write,
        }
    }

    /// Run `f` until it succeeds, fails terminally, or `deadline` interrupts
    pub async fn run<T, F, Fut>(&self, call: Call<'_>, deadline: &Deadline, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteFailure>>,
    {
        let op = call.op;
        let controller = self.controller(call.class);
        let mut attempt = Attempt::start();
        let mut last: Option<(ErrorClass, RemoteFailure)> = None;

        loop {
            if let Err(interrupt) = self.limiter.acquire(call.action(), deadline).await {
                let attempts = attempt.number;
                return Err(interrupted(interrupt, op, attempt.started, attempts, last));
            }

            let failure = match deadline.run(f()).await {
                Ok(Ok(value)) => {
                    let decision = controller.next(&attempt, None, deadline);
                    tracing::trace!(
                        "{}: succeeded on attempt {}, {} attempt(s) to spare",
                        call.op,
                        attempt.number + 1,
                        decision.attempts_remaining
                    );
                    return Ok(value);
                },
                Ok(Err(failure)) => failure,
                Err(interrupt) => {
                    let attempts = attempt.number;
                    return Err(interrupted(interrupt, op, attempt.started, attempts, last));
                },
            };

            let mut class = self.classifier.classify(&failure);
            if class == ErrorClass::NotFound && call.not_found == NotFoundPolicy::Retry {
                class = ErrorClass::Transient;
            }
            if class == ErrorClass::Unknown {
                attempt.unknown_failures += 1;
            }

            let decision = controller.next(&attempt, Some(class), deadline);
            let reason = match decision.outcome {
                RetryOutcome::Retry => {
                    tracing::warn!(
                        "{}: attempt {} failed ({}): {}; retrying in {:?}, {} attempt(s) left",
                        call.op,
                        attempt.number + 1,
                        class.as_str(),
                        failure,
                        decision.wait,
                        decision.attempts_remaining
                    );
                    let failed = Some((class, failure));
                    if let Err(interrupt) = deadline.sleep(decision.wait).await {
                        let attempts = attempt.number + 1;
                        return Err(interrupted(interrupt, op, attempt.started, attempts, failed));
                    }
                    attempt.number += 1;
                    last = failed;
                    continue;
                },
                RetryOutcome::Fail(reason) => reason,
                RetryOutcome::Succeed => StopReason::NotRetryable,
            };

            tracing::debug!(
                "{}: giving up after {} attempt(s) ({:?}, {}): {}",
                call.op,
                attempt.number + 1,
                reason,
                class.as_str(),
                failure
            );
            let attempts = attempt.number + 1;
            if reason == StopReason::Deadline {
                let failed = Some((class, failure));
                return Err(interrupted(Interrupt::Expired, op, attempt.started, attempts, failed));
            }
            return Err(ReconcileError::exhausted(call.op, class, attempts, failure));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn retrier(rate_limit: RateLimitConfig) -> Retrier {
        let config = RetryConfig {
            read: BackoffPolicy::read().without_jitter(),
            write: BackoffPolicy::write().without_jitter(),
            rate_limit,
            ..Default::default()
        };
        Retrier::new(&config, ErrorClassifier::new())
    }

    async fn failing(r: &Retrier, code: &str, deadline: &Deadline) -> (ReconcileError, u32) {
        let calls = AtomicU32::new(0);
        let result: Result<()> = r
            .run(Call::write("delete ins-1"), deadline, || {
                calls.fetch_add(1, Ordering::SeqCst);
                let failure = RemoteFailure::new(code, "try later");
                async move { Err(failure) }
            })
            .await;
        (result.unwrap_err(), calls.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_stopped_by_deadline_stays_conflict() {
        let r = retrier(RateLimitConfig::disabled());
        let deadline = Deadline::after(Duration::from_secs(600));
        let start = Instant::now();

        let (err, calls) = failing(&r, "ResourceInUse", &deadline).await;

        // 5+10+20+40 then 60s waits: the 14th attempt would land past 600s
        assert_eq!(start.elapsed(), Duration::from_secs(555));
        assert_eq!(calls, 13);
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(matches!(err, ReconcileError::Conflict { attempts: 13, .. }));
        assert!(err.to_string().contains("ResourceInUse"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_stopped_by_deadline_is_deadline_exceeded() {
        let r = retrier(RateLimitConfig::disabled());
        let deadline = Deadline::after(Duration::from_secs(100));

        let (err, calls) = failing(&r, "InternalError", &deadline).await;

        assert_eq!(calls, 5);
        match err {
            ReconcileError::DeadlineExceeded {
                elapsed,
                last_failure,
                ..
            } => {
                assert_eq!(elapsed, Duration::from_secs(75));
                assert_eq!(last_failure.map(|f| f.code), Some("InternalError".to_string()));
            },
            other => panic!("expected deadline exceeded, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_spaces_calls_of_one_action() {
        let r = retrier(RateLimitConfig::default().with_action_limit("instance.read", 1));
        let deadline = Deadline::unbounded();
        let start = Instant::now();

        for id in ["ins-1", "ins-2", "ins-3"] {
            let op = format!("read {}", id);
            let call = Call::read(&op).for_action("instance.read");
            let value = r.run(call, &deadline, || async { Ok::<_, RemoteFailure>(1) }).await;
            assert_eq!(value.unwrap(), 1);
        }

        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_wait_is_bounded_by_deadline() {
        let r = retrier(RateLimitConfig::default().with_action_limit("instance.read", 1));
        let deadline = Deadline::after(Duration::from_millis(500));
        let calls = AtomicU32::new(0);
        let call = Call::read("read ins-1").for_action("instance.read");

        for _ in 0..2 {
            let _ = r
                .run(call, &deadline, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, RemoteFailure>(()) }
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(deadline.is_expired());
    }

    #[test]
    fn test_action_defaults_to_op() {
        assert_eq!(Call::read("read ins-1").action(), "read ins-1");
        let call = Call::write("delete ins-1").for_action("instance.delete");
        assert_eq!(call.action(), "instance.delete");
    }
}
