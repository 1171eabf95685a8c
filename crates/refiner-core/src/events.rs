//! Per-run fan-out of pipeline progress.
//!
//! Each run gets a bounded [`tokio::sync::broadcast`] channel created lazily on
//! first publish or subscribe. Delivery is best-effort: a subscriber that falls
//! more than `capacity` events behind skips ahead, and a subscriber that joins
//! late only sees what is emitted after it joined (the store has the rest).

use crate::model::{ConvergenceReason, Stage, Summary};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// How many closed run ids are remembered so that a subscriber racing a run's
/// end still gets an empty stream. Older runs are answered from the store.
const CLOSED_RUNS_RETAINED: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RunEvent {
    StageStart {
        iteration: u32,
        stage: Stage,
    },
    TestProgress {
        iteration: u32,
        completed: usize,
        total: usize,
    },
    IterationComplete {
        iteration: u32,
        avg_score: Option<f64>,
        best_score: Option<f64>,
    },
    FeedbackRequested {
        iteration: u32,
        summary: Summary,
    },
    Converged {
        reason: ConvergenceReason,
        best_score: Option<f64>,
    },
    Completed {
        reason: ConvergenceReason,
        best_score: Option<f64>,
        total_iterations: u32,
    },
    Failed {
        error: String,
    },
    Stopped {},
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::StageStart { .. } => "stage_start",
            RunEvent::TestProgress { .. } => "test_progress",
            RunEvent::IterationComplete { .. } => "iteration_complete",
            RunEvent::FeedbackRequested { .. } => "feedback_requested",
            RunEvent::Converged { .. } => "converged",
            RunEvent::Completed { .. } => "completed",
            RunEvent::Failed { .. } => "failed",
            RunEvent::Stopped {} => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::Converged { .. }
                | RunEvent::Completed { .. }
                | RunEvent::Failed { .. }
                | RunEvent::Stopped {}
        )
    }
}

#[derive(Default)]
struct Channels {
    open: HashMap<i64, broadcast::Sender<RunEvent>>,
    closed: HashSet<i64>,
    closed_order: VecDeque<i64>,
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Channels>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Channels::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Channels> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self, ch: &mut Channels, run_id: i64) -> broadcast::Sender<RunEvent> {
        ch.open
            .entry(run_id)
            .or_insert_with(|| {
                debug!(run_id, capacity = self.capacity, "event channel created");
                broadcast::channel(self.capacity).0
            })
            .clone()
    }

    pub fn subscribe(&self, run_id: i64) -> EventStream {
        let mut ch = self.lock();
        if ch.closed.contains(&run_id) {
            return EventStream::ended(run_id);
        }
        let rx = self.sender(&mut ch, run_id).subscribe();
        EventStream {
            run_id,
            rx: Some(rx),
            done: false,
        }
    }

    /// Deliver to current subscribers. Having none is not an error.
    pub fn publish(&self, run_id: i64, event: RunEvent) {
        let tx = {
            let mut ch = self.lock();
            if ch.closed.contains(&run_id) {
                debug!(run_id, event = event.kind(), "dropping event for closed run");
                return;
            }
            self.sender(&mut ch, run_id)
        };
        let _ = tx.send(event);
    }

    /// Drop the run's channel. Pending events are still drained by existing
    /// subscribers; new subscribers get an empty stream.
    pub fn close(&self, run_id: i64) {
        let mut ch = self.lock();
        ch.open.remove(&run_id);
        if ch.closed.insert(run_id) {
            ch.closed_order.push_back(run_id);
        }
        while ch.closed_order.len() > CLOSED_RUNS_RETAINED {
            if let Some(old) = ch.closed_order.pop_front() {
                ch.closed.remove(&old);
            }
        }
    }
}

pub struct EventStream {
    run_id: i64,
    rx: Option<broadcast::Receiver<RunEvent>>,
    done: bool,
}

impl EventStream {
    /// A stream with nothing left to deliver.
    pub fn ended(run_id: i64) -> Self {
        Self {
            run_id,
            rx: None,
            done: true,
        }
    }

    /// Next event in emission order; `None` once a terminal event has been
    /// returned or the channel is gone.
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.done {
            return None;
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(ev) => {
                    if ev.is_terminal() {
                        self.done = true;
                    }
                    return Some(ev);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event = "subscriber_lagged",
                        run_id = self.run_id,
                        skipped,
                        "event subscriber fell behind; skipping ahead"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let ev = RunEvent::TestProgress {
            iteration: 1,
            completed: 3,
            total: 10,
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            v,
            serde_json::json!({"event": "test_progress", "data": {"iteration": 1, "completed": 3, "total": 10}})
        );

        let v = serde_json::to_value(RunEvent::Stopped {}).unwrap();
        assert_eq!(v, serde_json::json!({"event": "stopped", "data": {}}));

        let v = serde_json::to_value(RunEvent::Converged {
            reason: ConvergenceReason::Stagnation,
            best_score: Some(0.8),
        })
        .unwrap();
        assert_eq!(v["data"]["reason"], "stagnation");
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_event() {
        let bus = EventBus::default();
        let mut s = bus.subscribe(7);
        bus.publish(
            7,
            RunEvent::StageStart {
                iteration: 1,
                stage: Stage::Test,
            },
        );
        bus.publish(7, RunEvent::Failed { error: "x".into() });
        bus.publish(7, RunEvent::Stopped {});

        assert_eq!(s.next().await.map(|e| e.kind()), Some("stage_start"));
        assert_eq!(s.next().await.map(|e| e.kind()), Some("failed"));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_empty() {
        let bus = EventBus::default();
        bus.close(3);
        let mut s = bus.subscribe(3);
        assert!(s.next().await.is_none());
    }

    #[test]
    fn test_closed_runs_are_forgotten_beyond_the_limit() {
        let bus = EventBus::default();
        for id in 0..(CLOSED_RUNS_RETAINED as i64 + 10) {
            bus.publish(id, RunEvent::Stopped {});
            bus.close(id);
        }
        bus.close(5000);
        bus.close(5000);

        let ch = bus.lock();
        assert!(ch.open.is_empty());
        assert_eq!(ch.closed.len(), CLOSED_RUNS_RETAINED);
        assert_eq!(ch.closed_order.len(), CLOSED_RUNS_RETAINED);
        assert!(!ch.closed.contains(&0));
        assert!(ch.closed.contains(&5000));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_ahead() {
        let bus = EventBus::new(2);
        let mut s = bus.subscribe(1);
        for i in 0..5 {
            bus.publish(
                1,
                RunEvent::TestProgress {
                    iteration: 1,
                    completed: i,
                    total: 5,
                },
            );
        }
        match s.next().await {
            Some(RunEvent::TestProgress { completed, .. }) => assert_eq!(completed, 3),
            other => panic!("unexpected {:?}", other),
        }
    }
}
