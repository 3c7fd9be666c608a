use metrics::{Unit, describe_counter, describe_gauge, describe_histogram, counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::orchestrator::{
    telemetry::{OrchestratorEvent, TelemetrySink},
    types::{PressureLevel, ProcessorId},
};

pub const FRAMES_CONSUMED_TOTAL: &str = "frameroute_frames_consumed_total";
pub const FRAMES_ROUTED_TOTAL: &str = "frameroute_frames_routed_total";
pub const FRAMES_DISPATCH_FAILURES_TOTAL: &str = "frameroute_frames_dispatch_failures_total";
pub const FRAMES_MALFORMED_TOTAL: &str = "frameroute_malformed_frames_total";
pub const FRAMES_STARVED_TOTAL: &str = "frameroute_frames_unroutable_total";
pub const ROUTING_DURATION_SECONDS: &str = "frameroute_routing_duration_seconds";
pub const DISPATCH_DURATION_SECONDS: &str = "frameroute_dispatch_duration_seconds";
pub const REGISTERED_PROCESSORS: &str = "frameroute_registered_processors";
pub const PROCESSOR_QUEUE_DEPTH: &str = "frameroute_processor_queue_depth";
pub const CIRCUIT_STATE: &str = "frameroute_circuit_state";
pub const PROBE_FAILURES_TOTAL: &str = "frameroute_probe_failures_total";
pub const BACKPRESSURE_LEVEL: &str = "frameroute_backpressure_level";
pub const CONSUMPTION_RATE: &str = "frameroute_consumption_rate";
pub const FRAMES_PER_SECOND: &str = "frameroute_frames_per_second";

/// Installs the process-global Prometheus recorder and registers metric
/// descriptions. The returned handle renders the text exposition for the
/// control API's `GET /metrics`.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        FRAMES_CONSUMED_TOTAL,
        Unit::Count,
        "Frames read from the ingress stream."
    );
    describe_counter!(
        FRAMES_ROUTED_TOTAL,
        Unit::Count,
        "Frames accepted by a processor stream."
    );
    describe_counter!(
        FRAMES_DISPATCH_FAILURES_TOTAL,
        Unit::Count,
        "Dispatch writes rejected by the bus, by processor."
    );
    describe_counter!(
        FRAMES_MALFORMED_TOTAL,
        Unit::Count,
        "Ingress entries dropped as malformed (acked without dispatch)."
    );
    describe_counter!(
        FRAMES_STARVED_TOTAL,
        Unit::Count,
        "Routing attempts that found no eligible processor."
    );
    describe_histogram!(
        ROUTING_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of a routing decision, without bus I/O."
    );
    describe_histogram!(
        DISPATCH_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of the dispatch write to a processor stream."
    );
    describe_gauge!(
        REGISTERED_PROCESSORS,
        Unit::Count,
        "Processors currently registered."
    );
    describe_gauge!(
        PROCESSOR_QUEUE_DEPTH,
        Unit::Count,
        "Depth of a processor's ready stream, by processor."
    );
    describe_gauge!(
        CIRCUIT_STATE,
        Unit::Count,
        "Circuit state by processor: 0 closed, 1 half-open, 2 open."
    );
    describe_counter!(
        PROBE_FAILURES_TOTAL,
        Unit::Count,
        "Failed health probes, by processor."
    );
    describe_gauge!(
        BACKPRESSURE_LEVEL,
        Unit::Count,
        "Backpressure level: 0 normal, 1 moderate, 2 high, 3 critical."
    );
    describe_gauge!(
        CONSUMPTION_RATE,
        Unit::Count,
        "Current ingress consumption rate in [0, 1]."
    );
    describe_gauge!(
        FRAMES_PER_SECOND,
        Unit::Count,
        "Dispatch throughput over the last backpressure tick."
    );

    Ok(handle)
}

pub fn record_routing_duration(seconds: f64) {
    histogram!(ROUTING_DURATION_SECONDS).record(seconds);
}

pub fn record_dispatch_duration(seconds: f64) {
    histogram!(DISPATCH_DURATION_SECONDS).record(seconds);
}

pub fn record_registered_processors(count: usize) {
    gauge!(REGISTERED_PROCESSORS).set(count as f64);
}

pub fn record_queue_depth(processor_id: &ProcessorId, depth: u64) {
    gauge!(PROCESSOR_QUEUE_DEPTH, "processor_id" => processor_id.clone()).set(depth as f64);
}

pub fn record_circuit_state(processor_id: &ProcessorId, state_code: u8) {
    gauge!(CIRCUIT_STATE, "processor_id" => processor_id.clone()).set(state_code as f64);
}

pub fn record_pressure(level: PressureLevel, rate: f64) {
    let code = match level {
        PressureLevel::Normal => 0.0,
        PressureLevel::Moderate => 1.0,
        PressureLevel::High => 2.0,
        PressureLevel::Critical => 3.0,
    };
    gauge!(BACKPRESSURE_LEVEL).set(code);
    gauge!(CONSUMPTION_RATE).set(rate);
}

pub fn record_frames_per_second(fps: f64) {
    gauge!(FRAMES_PER_SECOND).set(fps);
}

/// Telemetry sink that turns orchestrator events into metrics and log
/// records; the production wiring installs this one.
#[derive(Default)]
pub struct MetricsTelemetrySink;

impl TelemetrySink for MetricsTelemetrySink {
    fn on_event(&self, event: OrchestratorEvent) {
        match event {
            OrchestratorEvent::FrameConsumed { .. } => {
                counter!(FRAMES_CONSUMED_TOTAL).increment(1);
            }
            OrchestratorEvent::FrameMalformed { entry_id, reason } => {
                counter!(FRAMES_MALFORMED_TOTAL).increment(1);
                tracing::warn!(
                    target: "consumer",
                    entry_id = %entry_id,
                    reason = %reason,
                    "malformed_frame_acked"
                );
            }
            OrchestratorEvent::FrameRouted { .. } => {}
            OrchestratorEvent::FrameDispatched {
                frame_id,
                processor_id,
                queue,
            } => {
                counter!(FRAMES_ROUTED_TOTAL).increment(1);
                tracing::debug!(
                    target: "dispatcher",
                    frame_id = %frame_id,
                    processor_id = %processor_id,
                    queue = %queue,
                    "frame_dispatched"
                );
            }
            OrchestratorEvent::DispatchFailed {
                frame_id,
                processor_id,
                kind,
            } => {
                counter!(FRAMES_DISPATCH_FAILURES_TOTAL, "processor_id" => processor_id.clone())
                    .increment(1);
                tracing::warn!(
                    target: "dispatcher",
                    frame_id = %frame_id,
                    processor_id = %processor_id,
                    kind = ?kind,
                    "dispatch_failed"
                );
            }
            OrchestratorEvent::RoutingStarved { frame_id } => {
                counter!(FRAMES_STARVED_TOTAL).increment(1);
                tracing::debug!(
                    target: "router",
                    frame_id = %frame_id,
                    "no_eligible_processor"
                );
            }
            OrchestratorEvent::ProcessorRegistered { processor_id } => {
                tracing::info!(
                    target: "registry",
                    processor_id = %processor_id,
                    "processor_registered"
                );
            }
            OrchestratorEvent::ProcessorUnregistered { processor_id } => {
                tracing::info!(
                    target: "registry",
                    processor_id = %processor_id,
                    "processor_unregistered"
                );
            }
            OrchestratorEvent::CircuitTransition {
                processor_id,
                from,
                to,
            } => {
                let code = match to {
                    "open" => 2,
                    "half_open" => 1,
                    _ => 0,
                };
                record_circuit_state(&processor_id, code);
                tracing::warn!(
                    target: "circuit",
                    processor_id = %processor_id,
                    from = from,
                    to = to,
                    "circuit_transition"
                );
            }
            OrchestratorEvent::ProbeSucceeded {
                processor_id,
                latency_ms,
            } => {
                tracing::debug!(
                    target: "health",
                    processor_id = %processor_id,
                    latency_ms = latency_ms,
                    "probe_succeeded"
                );
            }
            OrchestratorEvent::ProbeFailed {
                processor_id,
                reason,
            } => {
                counter!(PROBE_FAILURES_TOTAL, "processor_id" => processor_id.clone())
                    .increment(1);
                tracing::warn!(
                    target: "health",
                    processor_id = %processor_id,
                    reason = %reason,
                    "probe_failed"
                );
            }
            OrchestratorEvent::PressureChanged {
                level,
                rate,
                max_utilization,
            } => {
                record_pressure(level, rate);
                if level >= PressureLevel::High {
                    tracing::warn!(
                        target: "backpressure",
                        level = ?level,
                        rate = rate,
                        max_utilization = max_utilization,
                        "backpressure_elevated"
                    );
                } else {
                    tracing::info!(
                        target: "backpressure",
                        level = ?level,
                        rate = rate,
                        max_utilization = max_utilization,
                        "backpressure_changed"
                    );
                }
            }
        }
    }
}
