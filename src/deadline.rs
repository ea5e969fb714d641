//! Monotonic deadlines with cancellation
//!
//! Every public operation takes a [`Deadline`]. Waits and in-flight calls
//! are raced against both the deadline and the cancellation token, so an
//! interrupt is observed mid-wait rather than at the next loop boundary.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Far enough away to never fire, close enough not to overflow `Instant`
const UNBOUNDED: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Why a wait or call stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    Expired,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Deadline {
    at: Instant,
    cancel: CancellationToken,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self::at(Instant::now() + timeout)
    }

    pub fn at(at: Instant) -> Self {
        Self {
            at,
            cancel: CancellationToken::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::after(UNBOUNDED)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A deadline no later than `limit` from now, sharing this cancellation
    pub fn earlier(&self, limit: Duration) -> Self {
        Self {
            at: self.at.min(Instant::now() + limit),
            cancel: self.cancel.clone(),
        }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Drive `fut` unless the deadline passes or cancellation fires first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupt> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(self.at) => Err(Interrupt::Expired),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `wait`; a wait that would overrun the deadline ends at it
    pub async fn sleep(&self, wait: Duration) -> Result<(), Interrupt> {
        let wake = Instant::now() + wait;
        if wake >= self.at {
            return match self.run(std::future::pending::<()>()).await {
                Ok(()) => Err(Interrupt::Expired),
                Err(interrupt) => Err(interrupt),
            };
        }
        self.run(tokio::time::sleep_until(wake)).await
    }
}
