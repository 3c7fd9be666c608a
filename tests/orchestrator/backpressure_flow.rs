use std::{collections::BTreeMap, time::Duration};

use frameroute::{
    bus::StreamBus,
    orchestrator::types::{BackpressureConfig, PressureLevel, RoutingStrategy},
};

use crate::support::{Harness, frame_entry};

async fn fill_queue(harness: &Harness, queue: &str, count: usize) {
    let fields = BTreeMap::from([("frame_id".to_string(), "backlog".to_string())]);
    for _ in 0..count {
        harness.bus.append(queue, &fields).await.expect("append");
    }
}

#[tokio::test]
async fn given_backlog_at_82_percent_when_sampled_then_rate_drops_to_half() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("P2", &[], 100).await;
    fill_queue(&harness, "frames:ready:P2", 82).await;

    let controller = harness.controller(BackpressureConfig::default());
    let mut previous = None;
    controller.sample_once(&mut previous).await;

    assert_eq!(harness.gate.pressure(), PressureLevel::High);
    assert_eq!(harness.gate.rate(), 0.5);
    let load = harness.registry.get("P2").expect("registered").current_load;
    assert!((load - 0.82).abs() < 1e-9);
}

#[tokio::test]
async fn given_backlog_at_98_percent_when_sampled_then_consumption_pauses() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("P2", &[], 100).await;
    fill_queue(&harness, "frames:ready:P2", 98).await;

    let controller = harness.controller(BackpressureConfig::default());
    let mut previous = None;
    controller.sample_once(&mut previous).await;

    assert_eq!(harness.gate.pressure(), PressureLevel::Critical);
    assert_eq!(harness.gate.rate(), 0.0);

    // The paused gate must stop the read loop: a fresh ingress entry stays
    // untouched.
    harness.submit(frame_entry("f1", "cam1")).await;
    harness.pump(Duration::from_millis(150)).await;
    assert!(harness.ingress_pending().is_empty());
    // Backlog count unchanged: nothing new landed on P2.
    assert_eq!(harness.ready_queue("P2").len(), 98);
}

#[tokio::test]
async fn given_worst_processor_recovers_when_resampled_then_rate_restores() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    harness.register_healthy("P1", &[], 100).await;
    fill_queue(&harness, "frames:ready:P1", 96).await;

    let controller = harness.controller(BackpressureConfig::default());
    let mut previous = None;
    controller.sample_once(&mut previous).await;
    assert_eq!(harness.gate.rate(), 0.0);

    // The saturated processor leaves the fleet; the survivor has an empty
    // queue, so the next sample must restore full-rate consumption.
    harness.register_healthy("P2", &[], 100).await;
    harness.registry.unregister("P1").await.expect("unregister");
    controller.sample_once(&mut previous).await;

    assert_eq!(harness.gate.pressure(), PressureLevel::Normal);
    assert_eq!(harness.gate.rate(), 1.0);
}

#[tokio::test]
async fn given_empty_fleet_when_sampled_then_pressure_is_normal() {
    let harness = Harness::new(RoutingStrategy::LeastLoaded);
    let controller = harness.controller(BackpressureConfig::default());
    let mut previous = None;
    controller.sample_once(&mut previous).await;

    assert_eq!(harness.gate.pressure(), PressureLevel::Normal);
    assert_eq!(harness.gate.rate(), 1.0);
}
