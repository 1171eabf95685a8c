use refiner_core::events::{EventBus, RunEvent};
use refiner_core::model::{ConvergenceReason, Stage};

fn progress(completed: usize) -> RunEvent {
    RunEvent::TestProgress {
        iteration: 1,
        completed,
        total: 3,
    }
}

#[tokio::test]
async fn subscribers_see_the_same_order() {
    let bus = EventBus::new(16);
    let mut a = bus.subscribe(7);
    let mut b = bus.subscribe(7);
    let mut other = bus.subscribe(8);

    bus.publish(
        7,
        RunEvent::StageStart {
            iteration: 1,
            stage: Stage::Test,
        },
    );
    for i in 1..=3 {
        bus.publish(7, progress(i));
    }
    bus.publish(
        7,
        RunEvent::Converged {
            reason: ConvergenceReason::Target,
            best_score: Some(1.0),
        },
    );
    // Anything after the terminal event is not delivered to finished streams.
    bus.publish(7, progress(99));

    let mut seen_a = Vec::new();
    while let Some(ev) = a.next().await {
        seen_a.push(ev);
    }
    let mut seen_b = Vec::new();
    while let Some(ev) = b.next().await {
        seen_b.push(ev);
    }
    assert_eq!(seen_a.len(), 5);
    assert_eq!(seen_a, seen_b);
    assert!(seen_a.last().is_some_and(RunEvent::is_terminal));

    // Runs are isolated.
    bus.close(8);
    assert_eq!(other.next().await, None);
}

#[tokio::test]
async fn late_subscriber_only_sees_new_events() {
    let bus = EventBus::default();
    let mut early = bus.subscribe(1);
    bus.publish(1, progress(1));

    let mut late = bus.subscribe(1);
    bus.publish(1, RunEvent::Stopped {});

    assert_eq!(early.next().await, Some(progress(1)));
    assert_eq!(early.next().await, Some(RunEvent::Stopped {}));
    assert_eq!(late.next().await, Some(RunEvent::Stopped {}));
    assert_eq!(late.next().await, None);
}

#[test]
fn events_serialize_as_tagged_json() {
    let v = serde_json::to_value(RunEvent::Failed {
        error: "boom".into(),
    })
    .unwrap();
    assert_eq!(v, serde_json::json!({"event": "failed", "data": {"error": "boom"}}));
}
