use std::time::Duration;

use frameroute::orchestrator::types::RoutingStrategy;

use crate::support::{Harness, HarnessOptions, frame_entry, with_priority};

#[tokio::test]
async fn given_priority_strategy_when_mixed_batch_arrives_then_high_priority_is_served_first() {
    let harness = Harness::with_options(HarnessOptions {
        strategy: RoutingStrategy::Priority,
        dispatch_concurrency: 1,
        ..HarnessOptions::default()
    });
    harness.register_healthy("p1", &[], 100).await;

    harness
        .submit(with_priority(frame_entry("low", "cam1"), 0))
        .await;
    harness
        .submit(with_priority(frame_entry("high-a", "cam1"), 9))
        .await;
    harness
        .submit(with_priority(frame_entry("high-b", "cam1"), 9))
        .await;

    harness.pump(Duration::from_millis(300)).await;

    let delivered: Vec<String> = harness
        .ready_queue("p1")
        .iter()
        .map(|entry| entry.fields.get("frame_id").cloned().unwrap_or_default())
        .collect();
    assert_eq!(delivered, ["high-a", "high-b", "low"]);
}

#[tokio::test]
async fn given_low_starvation_threshold_when_high_priority_floods_then_low_is_not_starved() {
    let harness = Harness::with_options(HarnessOptions {
        strategy: RoutingStrategy::Priority,
        dispatch_concurrency: 1,
        starvation_threshold: 3,
        batch_size: 20,
        ..HarnessOptions::default()
    });
    harness.register_healthy("p1", &[], 100).await;

    harness
        .submit(with_priority(frame_entry("low", "cam1"), 0))
        .await;
    for n in 0..12 {
        harness
            .submit(with_priority(frame_entry(&format!("high-{n}"), "cam1"), 9))
            .await;
    }

    harness.pump(Duration::from_millis(400)).await;

    let delivered: Vec<String> = harness
        .ready_queue("p1")
        .iter()
        .map(|entry| entry.fields.get("frame_id").cloned().unwrap_or_default())
        .collect();
    let low_position = delivered
        .iter()
        .position(|frame_id| frame_id == "low")
        .expect("low-priority frame must be dispatched");
    assert!(
        low_position <= 3,
        "low-priority frame dequeued at position {low_position}, threshold is 3"
    );
    assert_eq!(delivered.len(), 13);
}
