//! Operation Poller
//!
//! Drives an [`OperationHandle`] to a terminal state:
//!
//! ```text
//! Submitted -> Running -> { Succeeded | Failed | TimedOut | Cancelled }
//! ```
//!
//! Status checks go through the [`Retrier`], so a flaky status endpoint is
//! retried independently of the operation's own outcome. A failed
//! operation is surfaced, never resubmitted.

use crate::config::PollConfig;
use crate::deadline::{Deadline, Interrupt};
use crate::error::{ReconcileError, Result};
use crate::remote::{OperationHandle, OperationStatus, RemoteApi, RemoteObject};
use crate::retry::{Call, Retrier};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Running { polls: u32 },
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    Running,
    Succeeded,
    Failed,
    Expired,
    Cancelled,
}

impl PollState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    /// Transition on `event`; terminal states absorb everything
    pub fn on(self, event: PollEvent) -> Self {
        if self.is_terminal() {
            return self;
        }
        match event {
            PollEvent::Running => match self {
                Self::Running { polls } => Self::Running { polls: polls + 1 },
                _ => Self::Running { polls: 1 },
            },
            PollEvent::Succeeded => Self::Succeeded,
            PollEvent::Failed => Self::Failed,
            PollEvent::Expired => Self::TimedOut,
            PollEvent::Cancelled => Self::Cancelled,
        }
    }

    pub fn polls(self) -> u32 {
        match self {
            Self::Running { polls } => polls,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationPoller {
    config: PollConfig,
    retrier: Retrier,
}

impl OperationPoller {
    pub fn new(config: PollConfig, retrier: Retrier) -> Self {
        Self { config, retrier }
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Wait for `handle` to finish and return the final remote object
    pub async fn wait<A>(
        &self,
        api: &A,
        handle: &OperationHandle,
        deadline: &Deadline,
    ) -> Result<RemoteObject>
    where
        A: RemoteApi + ?Sized,
    {
        let started = Instant::now();
        let window = match self.config.timeout() {
            Some(timeout) => deadline.earlier(timeout),
            None => deadline.clone(),
        };
        let op = format!("status of {}", handle);
        let action = format!("{}.operation_status", handle.kind);
        let mut state = PollState::Submitted;
        tracing::debug!("{}: {:?}", handle, state);

        loop {
            let status = self
                .retrier
                .run(Call::read(&op).for_action(&action), &window, move || {
                    api.operation_status(handle)
                })
                .await;

            let status = match status {
                Ok(status) => status,
                Err(ReconcileError::DeadlineExceeded { .. }) => {
                    return Err(self.timed_out(state, handle, started));
                },
                Err(ReconcileError::Cancelled { .. }) => {
                    return Err(self.cancelled(state, api, handle).await);
                },
                Err(e) => return Err(e),
            };

            match status {
                OperationStatus::Running => {
                    state = state.on(PollEvent::Running);
                    let interval = self.config.interval_for(state.polls());
                    tracing::trace!(
                        "{}: still running (poll {}), next check in {:?}",
                        handle,
                        state.polls(),
                        interval
                    );
                    match window.sleep(interval).await {
                        Ok(()) => {},
                        Err(Interrupt::Expired) => {
                            return Err(self.timed_out(state, handle, started));
                        },
                        Err(Interrupt::Cancelled) => {
                            return Err(self.cancelled(state, api, handle).await);
                        },
                    }
                },
                OperationStatus::Succeeded(object) => {
                    state = state.on(PollEvent::Succeeded);
                    tracing::info!("{}: {:?} after {:?}", handle, state, started.elapsed());
                    return Ok(object);
                },
                OperationStatus::Failed(reason) => {
                    state = state.on(PollEvent::Failed);
                    tracing::error!("{}: {:?}: {}", handle, state, reason);
                    return Err(ReconcileError::OperationFailed {
                        handle: handle.clone(),
                        reason,
                    });
                },
            }
        }
    }

    fn timed_out(
        &self,
        state: PollState,
        handle: &OperationHandle,
        started: Instant,
    ) -> ReconcileError {
        let state = state.on(PollEvent::Expired);
        tracing::warn!("{}: {:?} after {:?}", handle, state, started.elapsed());
        ReconcileError::OperationTimedOut {
            handle: handle.clone(),
            elapsed: started.elapsed(),
        }
    }

    /// Stop waiting. The remote operation keeps running unless the API
    /// declares a cancel endpoint for it.
    async fn cancelled<A>(
        &self,
        state: PollState,
        api: &A,
        handle: &OperationHandle,
    ) -> ReconcileError
    where
        A: RemoteApi + ?Sized,
    {
        let state = state.on(PollEvent::Cancelled);
        tracing::info!("{}: {:?}", handle, state);
        if api.can_cancel(handle) {
            match tokio::time::timeout(self.config.interval(), api.cancel_operation(handle)).await {
                Ok(Ok(())) => tracing::info!("{}: remote cancel issued", handle),
                Ok(Err(e)) => tracing::warn!("{}: remote cancel failed: {}", handle, e),
                Err(_) => tracing::warn!("{}: remote cancel timed out", handle),
            }
        }
        ReconcileError::Cancelled {
            op: format!("wait for {}", handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_counts_polls() {
        let state = PollState::Submitted
            .on(PollEvent::Running)
            .on(PollEvent::Running)
            .on(PollEvent::Running);
        assert_eq!(state, PollState::Running { polls: 3 });
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_terminal_states_absorb() {
        let done = PollState::Submitted.on(PollEvent::Succeeded);
        assert_eq!(done, PollState::Succeeded);
        assert_eq!(done.on(PollEvent::Failed), PollState::Succeeded);
        assert_eq!(done.on(PollEvent::Running), PollState::Succeeded);
    }

    #[test]
    fn test_interrupt_transitions() {
        let running = PollState::Running { polls: 2 };
        assert_eq!(running.on(PollEvent::Expired), PollState::TimedOut);
        assert_eq!(running.on(PollEvent::Cancelled), PollState::Cancelled);
        assert_eq!(PollState::Submitted.on(PollEvent::Failed), PollState::Failed);
    }
}
