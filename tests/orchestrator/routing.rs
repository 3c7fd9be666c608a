use std::time::Duration;

use frameroute::orchestrator::types::RoutingStrategy;

use crate::support::{Harness, frame_entry, with_detection_type};

#[tokio::test]
async fn given_capability_tagged_frame_when_pumped_then_only_matching_processor_receives_it() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("P1", &["face_detection"], 10).await;
    harness.register_healthy("P2", &["object_detection"], 10).await;

    harness
        .submit(with_detection_type(
            frame_entry("f1", "cam1"),
            "face_detection",
        ))
        .await;
    harness.pump(Duration::from_millis(200)).await;

    assert_eq!(harness.ready_queue("P1").len(), 1);
    assert!(harness.ready_queue("P2").is_empty());
    assert!(harness.ingress_pending().is_empty(), "ingress entry must be acked");
}

#[tokio::test]
async fn given_affinity_strategy_when_ten_frames_share_a_camera_then_one_processor_takes_all() {
    let harness = Harness::new(RoutingStrategy::Affinity);
    harness.register_healthy("p1", &[], 10).await;
    harness.register_healthy("p2", &[], 10).await;
    harness.register_healthy("p3", &[], 10).await;

    for n in 0..10 {
        harness
            .submit(frame_entry(&format!("f{n}"), "cam1"))
            .await;
    }
    harness.pump(Duration::from_millis(300)).await;

    let counts = [
        harness.ready_queue("p1").len(),
        harness.ready_queue("p2").len(),
        harness.ready_queue("p3").len(),
    ];
    assert!(counts.contains(&10), "all frames on one processor: {counts:?}");
    assert_eq!(counts.iter().sum::<usize>(), 10);

    let assignments = harness.router.affinity_assignments();
    assert_eq!(assignments.len(), 1);
    assert!(assignments.contains_key("cam1"));
}

#[tokio::test]
async fn given_least_loaded_strategy_when_loads_differ_then_lightest_processor_wins() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("P1", &[], 10).await;
    harness.register_healthy("P2", &[], 10).await;
    harness.register_healthy("P3", &[], 10).await;
    harness.registry.update_load("P1", 0.8);
    harness.registry.update_load("P2", 0.2);
    harness.registry.update_load("P3", 0.5);

    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(200)).await;

    assert_eq!(harness.ready_queue("P2").len(), 1);
    assert!(harness.ready_queue("P1").is_empty());
    assert!(harness.ready_queue("P3").is_empty());
}

#[tokio::test]
async fn given_no_registered_processors_when_pumped_then_frame_stays_pending_unacked() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);

    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(150)).await;

    assert_eq!(harness.ingress_pending().len(), 1, "frame must stay in the PEL");
    assert!(harness.ready_queue("p1").is_empty());
}
