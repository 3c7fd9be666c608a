use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::{StreamExt, stream};
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{
    observability::metrics::record_circuit_state,
    orchestrator::{
        backpressure::DepthBoard,
        circuit::{CircuitBoard, CircuitState},
        registry::ProcessorRegistry,
        router::FrameRouter,
        telemetry::{OrchestratorEvent, TelemetrySink},
        types::{HealthConfig, ProcessorHealth, ProcessorId, ProcessorInfo},
    },
};

// The sweep runs on a short tick so HALF_OPEN processors are probed
// promptly; healthy ones are only probed once per configured interval.
const SWEEP_TICK: Duration = Duration::from_secs(1);
const PROBE_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct ProbeState {
    last_attempt: Option<Instant>,
    last_ok: Option<Instant>,
}

/// Periodically probes registered processors over HTTP, feeds outcomes into
/// the circuit board, and derives each processor's health. Processors
/// registered without an endpoint are never probed; their health follows
/// circuit state alone.
pub struct HealthMonitor {
    registry: Arc<ProcessorRegistry>,
    circuits: Arc<CircuitBoard>,
    router: Arc<FrameRouter>,
    depths: Arc<DepthBoard>,
    telemetry: Arc<dyn TelemetrySink>,
    client: reqwest::Client,
    config: HealthConfig,
    probes: Mutex<HashMap<ProcessorId, ProbeState>>,
    unhealthy_since: Mutex<HashMap<ProcessorId, Instant>>,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        circuits: Arc<CircuitBoard>,
        router: Arc<FrameRouter>,
        depths: Arc<DepthBoard>,
        telemetry: Arc<dyn TelemetrySink>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            circuits,
            router,
            depths,
            telemetry,
            client: reqwest::Client::new(),
            config,
            probes: Mutex::new(HashMap::new()),
            unhealthy_since: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(SWEEP_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => self.sweep().await,
            }
        }
    }

    pub async fn sweep(&self) {
        let snapshot = self.registry.snapshot();
        let now = Instant::now();
        let interval = Duration::from_secs(self.config.check_interval_s.max(1));

        let due: Vec<ProcessorInfo> = snapshot
            .processors
            .iter()
            .filter(|info| info.endpoint.is_some())
            .filter(|info| self.probe_due(info, now, interval))
            .cloned()
            .collect();

        stream::iter(due)
            .for_each_concurrent(PROBE_CONCURRENCY, |info| async move {
                self.probe(&info).await;
            })
            .await;

        let probes = self.probes.lock().expect("lock poisoned").clone();
        for info in &snapshot.processors {
            let state = self.circuits.state(&info.id);
            record_circuit_state(&info.id, state.metric_code());

            let probe = probes.get(&info.id).copied().unwrap_or_default();
            let health = derive_health(state, probe.last_ok, now, interval, info.endpoint.is_some());
            let heartbeat = probe
                .last_ok
                .filter(|ok| ok.elapsed() < SWEEP_TICK)
                .map(|_| OffsetDateTime::now_utc());
            self.registry.mark_health(&info.id, health, heartbeat);
            self.track_permanent_failure(&info.id, health, now).await;
        }

        // Drop probe bookkeeping for processors that unregistered.
        let live: std::collections::BTreeSet<&ProcessorId> =
            snapshot.processors.iter().map(|info| &info.id).collect();
        self.probes
            .lock()
            .expect("lock poisoned")
            .retain(|id, _| live.contains(id));
        self.unhealthy_since
            .lock()
            .expect("lock poisoned")
            .retain(|id, _| live.contains(id));
    }

    /// Evicts a processor that has been continuously unhealthy past the
    /// configured grace. Disabled when no grace is set.
    async fn track_permanent_failure(
        &self,
        processor_id: &str,
        health: ProcessorHealth,
        now: Instant,
    ) {
        let Some(grace_s) = self.config.permanent_failure_grace_s else {
            return;
        };

        let since = {
            let mut unhealthy = self.unhealthy_since.lock().expect("lock poisoned");
            if health != ProcessorHealth::Unhealthy {
                unhealthy.remove(processor_id);
                return;
            }
            *unhealthy
                .entry(processor_id.to_string())
                .or_insert(now)
        };

        if now.saturating_duration_since(since) < Duration::from_secs(grace_s) {
            return;
        }

        tracing::warn!(
            target: "health",
            processor_id = %processor_id,
            grace_s,
            "unregistering permanently failed processor"
        );
        // Same teardown as the API's unregister: registry record, breaker,
        // affinity assignments and depth sample all go together.
        if self.registry.unregister(processor_id).await.is_ok() {
            self.circuits.remove(processor_id);
            self.router.forget_processor(processor_id);
            self.depths.forget(processor_id);
        }
        self.unhealthy_since
            .lock()
            .expect("lock poisoned")
            .remove(processor_id);
    }

    fn probe_due(&self, info: &ProcessorInfo, now: Instant, interval: Duration) -> bool {
        if matches!(self.circuits.state(&info.id), CircuitState::HalfOpen { .. }) {
            return true;
        }
        let probes = self.probes.lock().expect("lock poisoned");
        match probes.get(&info.id).and_then(|probe| probe.last_attempt) {
            Some(last_attempt) => now.saturating_duration_since(last_attempt) >= interval,
            None => true,
        }
    }

    async fn probe(&self, info: &ProcessorInfo) {
        let Some(endpoint) = info.endpoint.as_deref() else {
            return;
        };
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let timeout = Duration::from_secs(self.config.probe_timeout_s.max(1));

        let started = Instant::now();
        let outcome = self.client.get(&url).timeout(timeout).send().await;

        let mut probes = self.probes.lock().expect("lock poisoned");
        let state = probes.entry(info.id.clone()).or_default();
        state.last_attempt = Some(started);

        match outcome {
            Ok(response) if response.status().is_success() => {
                state.last_ok = Some(Instant::now());
                drop(probes);
                self.circuits.record_success(&info.id);
                self.telemetry.on_event(OrchestratorEvent::ProbeSucceeded {
                    processor_id: info.id.clone(),
                    latency_ms: started.elapsed().as_millis() as u64,
                });
            }
            Ok(response) => {
                drop(probes);
                self.circuits.record_failure(&info.id);
                self.telemetry.on_event(OrchestratorEvent::ProbeFailed {
                    processor_id: info.id.clone(),
                    reason: format!("probe returned {}", response.status()),
                });
            }
            Err(err) => {
                drop(probes);
                self.circuits.record_failure(&info.id);
                self.telemetry.on_event(OrchestratorEvent::ProbeFailed {
                    processor_id: info.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// HEALTHY: circuit closed and (for probed processors) a recent 2xx.
/// UNHEALTHY: circuit open. DEGRADED: everything in between.
fn derive_health(
    state: CircuitState,
    last_ok: Option<Instant>,
    now: Instant,
    interval: Duration,
    probed: bool,
) -> ProcessorHealth {
    match state {
        CircuitState::Open { .. } => ProcessorHealth::Unhealthy,
        CircuitState::HalfOpen { .. } => ProcessorHealth::Degraded,
        CircuitState::Closed { .. } => {
            if !probed {
                return ProcessorHealth::Healthy;
            }
            match last_ok {
                Some(last_ok)
                    if now.saturating_duration_since(last_ok) <= interval + SWEEP_TICK =>
                {
                    ProcessorHealth::Healthy
                }
                Some(_) => ProcessorHealth::Degraded,
                None => ProcessorHealth::Degraded,
            }
        }
    }
}
