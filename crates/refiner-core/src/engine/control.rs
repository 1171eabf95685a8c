//! Out-of-band signals into a running pipeline: cooperative stop and the
//! human-feedback handoff.

use crate::errors::InvalidStateError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

pub const DEFAULT_FEEDBACK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    AwaitingFeedback { iteration: u32 },
    Finished,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "pending",
            Phase::Running => "running",
            Phase::AwaitingFeedback { .. } => "awaiting_feedback",
            Phase::Finished => "finished",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackOutcome {
    Submitted(String),
    TimedOut,
    /// The wait was abandoned because a stop was requested.
    Cancelled,
}

struct State {
    phase: Phase,
    feedback_tx: Option<oneshot::Sender<String>>,
}

pub struct RunControl {
    run_id: i64,
    stop: AtomicBool,
    state: Mutex<State>,
    feedback_timeout: Duration,
}

impl RunControl {
    pub fn new(run_id: i64, feedback_timeout: Duration) -> Self {
        Self {
            run_id,
            stop: AtomicBool::new(false),
            state: Mutex::new(State {
                phase: Phase::Pending,
                feedback_tx: None,
            }),
            feedback_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn set_phase(&self, phase: Phase) {
        self.lock().phase = phase;
    }

    /// Idempotent. A pending feedback wait is released immediately.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // Dropping the sender wakes the waiter.
        self.lock().feedback_tx = None;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Suspend until feedback arrives, the timeout elapses or a stop is
    /// requested. The phase reads `AwaitingFeedback` for the duration.
    pub async fn await_feedback(&self, iteration: u32) -> FeedbackOutcome {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.lock();
            if self.stop_requested() {
                return FeedbackOutcome::Cancelled;
            }
            st.feedback_tx = Some(tx);
            st.phase = Phase::AwaitingFeedback { iteration };
        }

        let outcome = match tokio::time::timeout(self.feedback_timeout, rx).await {
            Ok(Ok(text)) => FeedbackOutcome::Submitted(text),
            Ok(Err(_)) => FeedbackOutcome::Cancelled,
            Err(_) => FeedbackOutcome::TimedOut,
        };

        let mut st = self.lock();
        st.feedback_tx = None;
        st.phase = Phase::Running;
        outcome
    }

    pub fn submit_feedback(&self, text: impl Into<String>) -> Result<(), InvalidStateError> {
        let mut st = self.lock();
        let phase = st.phase;
        let not_awaiting = || InvalidStateError::NotAwaitingFeedback {
            run_id: self.run_id,
            phase: phase.as_str().to_string(),
        };
        if !matches!(phase, Phase::AwaitingFeedback { .. }) {
            return Err(not_awaiting());
        }
        let tx = st.feedback_tx.take().ok_or_else(not_awaiting)?;
        // The receiver only disappears once the wait ended; treat as out of phase.
        tx.send(text.into()).map_err(|_| not_awaiting())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_resumes_with_empty_feedback() {
        let ctl = RunControl::new(1, Duration::from_secs(1800));
        let start = tokio::time::Instant::now();
        let out = ctl.await_feedback(1).await;
        assert_eq!(out, FeedbackOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(1800));
        assert_eq!(ctl.phase(), Phase::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wakes_waiter() {
        let ctl = Arc::new(RunControl::new(1, DEFAULT_FEEDBACK_TIMEOUT));
        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.await_feedback(2).await })
        };
        while ctl.phase() == Phase::Pending {
            tokio::task::yield_now().await;
        }
        assert_eq!(ctl.phase(), Phase::AwaitingFeedback { iteration: 2 });
        ctl.submit_feedback("be terse").unwrap();
        assert_eq!(
            waiter.await.unwrap(),
            FeedbackOutcome::Submitted("be terse".into())
        );
        // Second submission is out of phase.
        assert!(matches!(
            ctl.submit_feedback("again"),
            Err(InvalidStateError::NotAwaitingFeedback { .. })
        ));
    }

    #[test]
    fn test_submit_outside_wait_is_rejected() {
        let ctl = RunControl::new(9, DEFAULT_FEEDBACK_TIMEOUT);
        ctl.set_phase(Phase::Running);
        let err = ctl.submit_feedback("x").unwrap_err();
        assert_eq!(
            err,
            InvalidStateError::NotAwaitingFeedback {
                run_id: 9,
                phase: "running".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_feedback_wait() {
        let ctl = Arc::new(RunControl::new(1, DEFAULT_FEEDBACK_TIMEOUT));
        let waiter = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.await_feedback(1).await })
        };
        while !matches!(ctl.phase(), Phase::AwaitingFeedback { .. }) {
            tokio::task::yield_now().await;
        }
        ctl.request_stop();
        assert_eq!(waiter.await.unwrap(), FeedbackOutcome::Cancelled);
        assert!(ctl.stop_requested());
    }
}
