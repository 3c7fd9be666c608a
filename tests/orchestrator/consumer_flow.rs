use std::{collections::BTreeMap, time::Duration};

use frameroute::{
    bus::{ReadStart, StreamBus},
    orchestrator::types::RoutingStrategy,
};

use crate::support::{CONSUMER_ID, GROUP, Harness, INGRESS, frame_entry};

#[tokio::test]
async fn given_dispatch_write_rejected_when_bus_recovers_then_frame_is_redelivered_once() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;
    harness.bus.set_append_failure("frames:ready:p1", true);

    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(150)).await;

    assert!(harness.ready_queue("p1").is_empty());
    assert_eq!(
        harness.ingress_pending().len(),
        1,
        "rejected write must leave the entry unacked"
    );

    harness.bus.set_append_failure("frames:ready:p1", false);
    harness.pump(Duration::from_millis(200)).await;

    assert_eq!(
        harness.ready_queue("p1").len(),
        1,
        "redelivery must dispatch the entry exactly once downstream"
    );
    assert!(harness.ingress_pending().is_empty());
}

#[tokio::test]
async fn given_malformed_entry_when_pumped_then_it_is_acked_without_dispatch() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;

    // No frame_id: unroutable garbage that must not wedge the stream.
    let fields = BTreeMap::from([
        ("camera_id".to_string(), "cam1".to_string()),
        ("timestamp".to_string(), "2026-08-01T10:00:00Z".to_string()),
    ]);
    harness.submit(fields).await;
    harness.submit(frame_entry("f2", "cam1")).await;
    harness.pump(Duration::from_millis(200)).await;

    assert!(harness.ingress_pending().is_empty());
    let delivered = harness.ready_queue("p1");
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].fields.get("frame_id").map(String::as_str),
        Some("f2")
    );
}

#[tokio::test]
async fn given_entries_claimed_before_a_crash_when_restarted_then_they_are_drained_first() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;

    harness.submit(frame_entry("f1", "cam1")).await;
    // Claim the delivery under the consumer's id without acking, as a
    // crashed predecessor would have.
    let claimed = harness
        .bus
        .read_group(INGRESS, GROUP, CONSUMER_ID, ReadStart::New, 10, Duration::ZERO)
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    harness.pump(Duration::from_millis(200)).await;

    assert_eq!(harness.ready_queue("p1").len(), 1);
    assert!(harness.ingress_pending().is_empty());
}

#[tokio::test]
async fn given_paused_gate_when_frames_arrive_then_nothing_is_read_until_resume() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;
    harness.gate.pause();

    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(150)).await;

    assert!(harness.ready_queue("p1").is_empty());
    assert!(
        harness.ingress_pending().is_empty(),
        "a paused consumer must not claim deliveries"
    );

    harness.gate.resume();
    harness.pump(Duration::from_millis(200)).await;
    assert_eq!(harness.ready_queue("p1").len(), 1);
}

#[tokio::test]
async fn given_well_formed_entries_when_pumped_then_every_entry_is_dispatched_or_pending() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 10).await;

    for n in 0..25 {
        harness
            .submit(frame_entry(&format!("f{n}"), "cam1"))
            .await;
    }
    harness.pump(Duration::from_millis(400)).await;

    let dispatched = harness.ready_queue("p1").len();
    let pending = harness.ingress_pending().len();
    assert_eq!(
        dispatched + pending,
        25,
        "no silent drops: {dispatched} dispatched + {pending} pending"
    );
    assert!(dispatched > 0);
}
