use frameroute::orchestrator::types::{HealthConfig, ProcessorHealth, RoutingStrategy};

use crate::support::Harness;

#[tokio::test]
async fn given_probeless_processor_with_closed_circuit_when_swept_then_it_is_healthy() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.registry.register(&frameroute::orchestrator::types::ProcessorSpec {
        id: "p1".to_string(),
        capabilities: Default::default(),
        capacity: 4,
        queue: None,
        endpoint: None,
    })
    .await
    .expect("register");
    assert_eq!(
        harness.registry.get("p1").expect("registered").health,
        ProcessorHealth::Unknown
    );

    let monitor = harness.monitor(HealthConfig::default());
    monitor.sweep().await;

    assert_eq!(
        harness.registry.get("p1").expect("registered").health,
        ProcessorHealth::Healthy
    );
}

#[tokio::test]
async fn given_open_circuit_when_swept_then_processor_reads_unhealthy() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("p1", &[], 4).await;
    for _ in 0..3 {
        harness.circuits.record_failure("p1");
    }

    let monitor = harness.monitor(HealthConfig::default());
    monitor.sweep().await;

    assert_eq!(
        harness.registry.get("p1").expect("registered").health,
        ProcessorHealth::Unhealthy
    );
}

#[tokio::test]
async fn given_zero_grace_when_processor_stays_unhealthy_then_it_is_unregistered() {
    let harness = Harness::with_options(crate::support::HarnessOptions {
        strategy: RoutingStrategy::Affinity,
        ..Default::default()
    });
    harness.register_healthy("p1", &[], 4).await;
    harness.register_healthy("p2", &[], 4).await;
    // Pin cam1 onto p1 so eviction has an affinity entry to clear.
    let frame = frameroute::orchestrator::types::FrameRecord::from_entry_fields(
        &crate::support::frame_entry("f1", "cam1"),
    )
    .expect("frame");
    let pinned = harness
        .router
        .select(&frame, &harness.registry.snapshot())
        .expect("selection")
        .id;
    assert_eq!(pinned, "p1");
    harness.depths.set("p1", 2);

    for _ in 0..3 {
        harness.circuits.record_failure("p1");
    }

    let monitor = harness.monitor(HealthConfig {
        permanent_failure_grace_s: Some(0),
        ..HealthConfig::default()
    });
    monitor.sweep().await;

    assert!(harness.registry.get("p1").is_none(), "failed processor evicted");
    assert!(harness.registry.get("p2").is_some(), "healthy processor kept");
    assert!(
        harness.router.affinity_assignments().is_empty(),
        "affinity entries pointing at the evicted processor must be dropped"
    );
    assert!(
        !harness.depths.all().contains_key("p1"),
        "depth sample for the evicted processor must be dropped"
    );
}
