use crate::orchestrator::{
    error::OrchestratorErrorKind,
    types::{PressureLevel, ProcessorId},
};

/// Lifecycle events emitted by the orchestrator's moving parts. Sinks decide
/// what to do with them (metrics, logs, nothing in tests).
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    FrameConsumed {
        entry_id: String,
        frame_id: String,
    },
    FrameMalformed {
        entry_id: String,
        reason: String,
    },
    FrameRouted {
        frame_id: String,
        processor_id: ProcessorId,
    },
    FrameDispatched {
        frame_id: String,
        processor_id: ProcessorId,
        queue: String,
    },
    DispatchFailed {
        frame_id: String,
        processor_id: ProcessorId,
        kind: OrchestratorErrorKind,
    },
    RoutingStarved {
        frame_id: String,
    },
    ProcessorRegistered {
        processor_id: ProcessorId,
    },
    ProcessorUnregistered {
        processor_id: ProcessorId,
    },
    CircuitTransition {
        processor_id: ProcessorId,
        from: &'static str,
        to: &'static str,
    },
    ProbeSucceeded {
        processor_id: ProcessorId,
        latency_ms: u64,
    },
    ProbeFailed {
        processor_id: ProcessorId,
        reason: String,
    },
    PressureChanged {
        level: PressureLevel,
        rate: f64,
        max_utilization: f64,
    },
}

pub trait TelemetrySink: Send + Sync {
    fn on_event(&self, event: OrchestratorEvent);
}

#[derive(Default)]
pub struct NoopTelemetrySink;

impl TelemetrySink for NoopTelemetrySink {
    fn on_event(&self, _event: OrchestratorEvent) {}
}

/// Shared dispatch counters: the dispatcher bumps them, the backpressure
/// tick derives frames-per-second, the stats endpoint reads both.
#[derive(Default)]
pub struct DispatchStats {
    dispatched: std::sync::atomic::AtomicU64,
    fps_bits: std::sync::atomic::AtomicU64,
}

impl DispatchStats {
    pub fn record_dispatched(&self) {
        self.dispatched
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits
            .store(fps.to_bits(), std::sync::atomic::Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(std::sync::atomic::Ordering::Relaxed))
    }
}
