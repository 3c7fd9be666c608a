use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    bus::StreamBus,
    observability::metrics::{record_frames_per_second, record_pressure, record_queue_depth},
    orchestrator::{
        registry::ProcessorRegistry,
        telemetry::{DispatchStats, OrchestratorEvent, TelemetrySink},
        types::{BackpressureConfig, PressureLevel, PressureThresholds, ProcessorId},
    },
};

/// Shared consumption-rate cell: one writer (the controller, plus the
/// pause/resume override from the control API), many readers (the consumer
/// loop). A manual pause pins the effective rate to zero regardless of
/// computed pressure.
pub struct RateGate {
    rate_bits: AtomicU64,
    level_code: AtomicU8,
    manual_pause: AtomicBool,
}

impl Default for RateGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGate {
    pub fn new() -> Self {
        Self {
            rate_bits: AtomicU64::new(1.0_f64.to_bits()),
            level_code: AtomicU8::new(0),
            manual_pause: AtomicBool::new(false),
        }
    }

    pub fn rate(&self) -> f64 {
        if self.manual_pause.load(Ordering::Acquire) {
            return 0.0;
        }
        f64::from_bits(self.rate_bits.load(Ordering::Acquire))
    }

    pub fn pressure(&self) -> PressureLevel {
        match self.level_code.load(Ordering::Acquire) {
            0 => PressureLevel::Normal,
            1 => PressureLevel::Moderate,
            2 => PressureLevel::High,
            _ => PressureLevel::Critical,
        }
    }

    pub fn set_pressure(&self, level: PressureLevel) {
        let code = match level {
            PressureLevel::Normal => 0,
            PressureLevel::Moderate => 1,
            PressureLevel::High => 2,
            PressureLevel::Critical => 3,
        };
        self.level_code.store(code, Ordering::Release);
        self.rate_bits.store(level.rate().to_bits(), Ordering::Release);
    }

    pub fn pause(&self) {
        self.manual_pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.manual_pause.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.manual_pause.load(Ordering::Acquire)
    }
}

/// Latest sampled queue depth per processor, for the backlog endpoint.
#[derive(Default)]
pub struct DepthBoard {
    depths: Mutex<BTreeMap<ProcessorId, u64>>,
}

impl DepthBoard {
    pub fn set(&self, processor_id: &str, depth: u64) {
        self.depths
            .lock()
            .expect("lock poisoned")
            .insert(processor_id.to_string(), depth);
    }

    pub fn forget(&self, processor_id: &str) {
        self.depths.lock().expect("lock poisoned").remove(processor_id);
    }

    pub fn retain_known(&self, known: &[ProcessorId]) {
        self.depths
            .lock()
            .expect("lock poisoned")
            .retain(|id, _| known.contains(id));
    }

    pub fn all(&self) -> BTreeMap<ProcessorId, u64> {
        self.depths.lock().expect("lock poisoned").clone()
    }
}

/// Deterministic level derivation over the worst per-processor utilisation.
pub fn level_for(max_utilization: f64, thresholds: &PressureThresholds) -> PressureLevel {
    if max_utilization >= thresholds.critical {
        PressureLevel::Critical
    } else if max_utilization >= thresholds.high {
        PressureLevel::High
    } else if max_utilization >= thresholds.low {
        PressureLevel::Moderate
    } else {
        PressureLevel::Normal
    }
}

/// Samples processor queue depths on a fixed cadence, folds them into a
/// pressure level, and modulates the consumer's rate gate. Also feeds the
/// registry's load figures and the per-tick fps gauge.
pub struct BackpressureController {
    bus: Arc<dyn StreamBus>,
    registry: Arc<ProcessorRegistry>,
    gate: Arc<RateGate>,
    depths: Arc<DepthBoard>,
    stats: Arc<DispatchStats>,
    telemetry: Arc<dyn TelemetrySink>,
    config: BackpressureConfig,
}

impl BackpressureController {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        registry: Arc<ProcessorRegistry>,
        gate: Arc<RateGate>,
        depths: Arc<DepthBoard>,
        stats: Arc<DispatchStats>,
        telemetry: Arc<dyn TelemetrySink>,
        config: BackpressureConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            gate,
            depths,
            stats,
            telemetry,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let interval = Duration::from_secs(self.config.check_interval_s.max(1));
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut previous_level: Option<PressureLevel> = None;
        let mut last_dispatched = self.stats.dispatched();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.sample_once(&mut previous_level).await;
                    let dispatched = self.stats.dispatched();
                    let fps = (dispatched.saturating_sub(last_dispatched)) as f64
                        / interval.as_secs_f64();
                    last_dispatched = dispatched;
                    self.stats.set_fps(fps);
                    record_frames_per_second(fps);
                }
            }
        }
    }

    /// One sampling pass. Skips processors whose depth read fails; an empty
    /// fleet reads as NORMAL.
    pub async fn sample_once(&self, previous_level: &mut Option<PressureLevel>) {
        let snapshot = self.registry.snapshot();
        let known: Vec<ProcessorId> = snapshot
            .processors
            .iter()
            .map(|info| info.id.clone())
            .collect();
        self.depths.retain_known(&known);
        let mut max_utilization: f64 = 0.0;

        for info in &snapshot.processors {
            let depth = match self.bus.queue_len(&info.queue).await {
                Ok(depth) => depth,
                Err(err) => {
                    tracing::warn!(
                        target: "backpressure",
                        processor_id = %info.id,
                        queue = %info.queue,
                        error = %err,
                        "queue depth sample failed"
                    );
                    continue;
                }
            };

            self.depths.set(&info.id, depth);
            record_queue_depth(&info.id, depth);
            let utilization = depth as f64 / f64::from(info.capacity.max(1));
            self.registry.update_load(&info.id, utilization);
            max_utilization = max_utilization.max(utilization);
        }

        let level = level_for(max_utilization, &self.config.thresholds);
        self.gate.set_pressure(level);
        let effective_rate = self.gate.rate();
        record_pressure(level, effective_rate);

        if previous_level.map(|prior| prior != level).unwrap_or(true) {
            self.telemetry.on_event(OrchestratorEvent::PressureChanged {
                level,
                rate: effective_rate,
                max_utilization,
            });
        }
        *previous_level = Some(level);
    }
}
