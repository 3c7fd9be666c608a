use std::time::Duration;

use frameroute::orchestrator::types::{CircuitConfig, RoutingStrategy};

use crate::support::{Harness, HarnessOptions, frame_entry};

fn fast_circuit() -> CircuitConfig {
    CircuitConfig {
        failure_threshold: 3,
        success_threshold: 2,
        recovery_timeout_s: 1,
    }
}

#[tokio::test]
async fn given_three_dispatch_failures_when_routing_continues_then_frame_lands_elsewhere() {
    let harness = Harness::with_options(HarnessOptions {
        strategy: RoutingStrategy::LeastLoaded,
        circuit: fast_circuit(),
        ..HarnessOptions::default()
    });
    // Equal load: the id tie-break pins selection to p1 until its circuit
    // opens.
    harness.register_healthy("p1", &[], 10).await;
    harness.register_healthy("p2", &[], 10).await;
    harness.bus.set_append_failure("frames:ready:p1", true);

    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(500)).await;

    assert!(
        harness.circuits.state("p1").is_open(),
        "three consecutive write failures must open the circuit"
    );
    assert_eq!(
        harness.ready_queue("p2").len(),
        1,
        "frame must be rerouted away from the open processor"
    );
    assert!(harness.ingress_pending().is_empty());
}

#[tokio::test]
async fn given_recovery_timeout_elapsed_when_successes_follow_then_circuit_closes_again() {
    let harness = Harness::with_options(HarnessOptions {
        strategy: RoutingStrategy::LeastLoaded,
        circuit: fast_circuit(),
        ..HarnessOptions::default()
    });
    let target = harness.register_healthy("p1", &[], 10).await;

    for _ in 0..3 {
        harness.circuits.record_failure("p1");
    }
    assert!(harness.circuits.state("p1").is_open());

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(
        harness.circuits.state("p1").name(),
        "half_open",
        "recovery timeout must move the breaker to half-open"
    );

    let frame = frameroute::orchestrator::types::FrameRecord::from_entry_fields(&frame_entry(
        "f1", "cam1",
    ))
    .expect("frame");
    harness.dispatcher.dispatch(&frame, &target).await.expect("dispatch");
    harness.dispatcher.dispatch(&frame, &target).await.expect("dispatch");

    assert_eq!(harness.circuits.state("p1").name(), "closed");
}

#[tokio::test]
async fn given_half_open_circuit_when_dispatch_fails_then_it_reopens() {
    let harness = Harness::with_options(HarnessOptions {
        strategy: RoutingStrategy::LeastLoaded,
        circuit: fast_circuit(),
        ..HarnessOptions::default()
    });
    let target = harness.register_healthy("p1", &[], 10).await;

    for _ in 0..3 {
        harness.circuits.record_failure("p1");
    }
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(harness.circuits.state("p1").name(), "half_open");

    harness.bus.set_append_failure("frames:ready:p1", true);
    let frame = frameroute::orchestrator::types::FrameRecord::from_entry_fields(&frame_entry(
        "f1", "cam1",
    ))
    .expect("frame");
    harness
        .dispatcher
        .dispatch(&frame, &target)
        .await
        .expect_err("write should be refused");

    assert!(harness.circuits.state("p1").is_open());
}
