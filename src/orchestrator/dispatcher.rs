use std::{sync::Arc, time::Instant};

use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::Instrument;

use crate::{
    bus::StreamBus,
    observability::metrics::record_dispatch_duration,
    orchestrator::{
        circuit::CircuitBoard,
        error::{OrchestratorError, OrchestratorErrorKind, circuit_open},
        telemetry::{DispatchStats, OrchestratorEvent, TelemetrySink},
        trace::TraceContext,
        types::{FrameRecord, ProcessorInfo},
    },
};

const FIELD_ENQUEUED_AT: &str = "enqueued_at";

/// Writes routed frames onto their processor's ready stream. A frame never
/// leaves here without a trace context: an inbound context is forked into a
/// child span, an absent one is replaced by a fresh root. Write outcomes
/// feed the circuit board; the ingress ACK stays with the caller so a
/// rejected write leaves the entry pending for redelivery.
pub struct Dispatcher {
    bus: Arc<dyn StreamBus>,
    circuits: Arc<CircuitBoard>,
    telemetry: Arc<dyn TelemetrySink>,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        circuits: Arc<CircuitBoard>,
        telemetry: Arc<dyn TelemetrySink>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self {
            bus,
            circuits,
            telemetry,
            stats,
        }
    }

    pub async fn dispatch(
        &self,
        frame: &FrameRecord,
        target: &ProcessorInfo,
    ) -> Result<String, OrchestratorError> {
        // The circuit may have opened between routing and dispatch; fail
        // fast without touching the bus and let the router pick again.
        if !self.circuits.allows(&target.id) {
            let rejected = circuit_open(target.id.clone());
            self.telemetry.on_event(OrchestratorEvent::DispatchFailed {
                frame_id: frame.frame_id.clone(),
                processor_id: target.id.clone(),
                kind: rejected.kind,
            });
            return Err(rejected);
        }

        let parent = frame
            .trace_context
            .clone()
            .unwrap_or_else(TraceContext::new_root);

        let mut outbound = frame.clone();
        outbound.trace_context = Some(parent.child());

        let mut fields = outbound.to_entry_fields();
        if let Ok(enqueued_at) = OffsetDateTime::now_utc().format(&Rfc3339) {
            fields.insert(FIELD_ENQUEUED_AT.to_string(), enqueued_at);
        }

        let span = tracing::info_span!(
            target: "dispatcher",
            "dispatch_to_processor",
            processor.id = %target.id,
            queue.name = %target.queue,
            frame.id = %frame.frame_id,
            frame.camera_id = %frame.camera_id,
            frame.priority = frame.priority,
            selected_processor.load = target.current_load,
            trace_id = %parent.trace_id,
        );

        let started = Instant::now();
        let result = self
            .bus
            .append(&target.queue, &fields)
            .instrument(span)
            .await;
        record_dispatch_duration(started.elapsed().as_secs_f64());

        match result {
            Ok(entry_id) => {
                self.circuits.record_success(&target.id);
                self.stats.record_dispatched();
                self.telemetry.on_event(OrchestratorEvent::FrameDispatched {
                    frame_id: frame.frame_id.clone(),
                    processor_id: target.id.clone(),
                    queue: target.queue.clone(),
                });
                Ok(entry_id)
            }
            Err(err) => {
                self.circuits.record_failure(&target.id);
                let mapped = OrchestratorError::new(
                    OrchestratorErrorKind::ProcessorUnavailable,
                    format!("dispatch write to '{}' failed: {err}", target.queue),
                )
                .with_processor_id(target.id.clone());
                self.telemetry.on_event(OrchestratorEvent::DispatchFailed {
                    frame_id: frame.frame_id.clone(),
                    processor_id: target.id.clone(),
                    kind: mapped.kind,
                });
                Err(mapped)
            }
        }
    }
}
