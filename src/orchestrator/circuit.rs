use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::orchestrator::{
    telemetry::{OrchestratorEvent, TelemetrySink},
    types::{CircuitConfig, ProcessorId},
};

/// Per-processor breaker state. Transitions are pure functions of
/// (state, event, now, config); the board below owns the mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { consecutive_successes: u32 },
}

impl CircuitState {
    pub fn initial() -> Self {
        Self::Closed {
            consecutive_failures: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }

    pub fn metric_code(&self) -> u8 {
        match self {
            Self::Closed { .. } => 0,
            Self::HalfOpen { .. } => 1,
            Self::Open { .. } => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    Success,
    Failure,
}

pub fn advance(
    state: CircuitState,
    event: CircuitEvent,
    now: Instant,
    config: &CircuitConfig,
) -> CircuitState {
    match (state, event) {
        (CircuitState::Closed { consecutive_failures }, CircuitEvent::Failure) => {
            let failures = consecutive_failures.saturating_add(1);
            if failures >= config.failure_threshold.max(1) {
                CircuitState::Open { opened_at: now }
            } else {
                CircuitState::Closed {
                    consecutive_failures: failures,
                }
            }
        }
        (CircuitState::Closed { .. }, CircuitEvent::Success) => CircuitState::Closed {
            consecutive_failures: 0,
        },
        // Failures while open push the recovery window out; successes while
        // open (early probes) do not short-circuit the timeout.
        (CircuitState::Open { .. }, CircuitEvent::Failure) => {
            CircuitState::Open { opened_at: now }
        }
        (CircuitState::Open { opened_at }, CircuitEvent::Success) => {
            CircuitState::Open { opened_at }
        }
        (CircuitState::HalfOpen { consecutive_successes }, CircuitEvent::Success) => {
            let successes = consecutive_successes.saturating_add(1);
            if successes >= config.success_threshold.max(1) {
                CircuitState::Closed {
                    consecutive_failures: 0,
                }
            } else {
                CircuitState::HalfOpen {
                    consecutive_successes: successes,
                }
            }
        }
        (CircuitState::HalfOpen { .. }, CircuitEvent::Failure) => {
            CircuitState::Open { opened_at: now }
        }
    }
}

/// OPEN → HALF_OPEN once the recovery timeout has elapsed; identity
/// otherwise.
pub fn poll_recovery(state: CircuitState, now: Instant, config: &CircuitConfig) -> CircuitState {
    match state {
        CircuitState::Open { opened_at }
            if now.saturating_duration_since(opened_at)
                >= Duration::from_secs(config.recovery_timeout_s) =>
        {
            CircuitState::HalfOpen {
                consecutive_successes: 0,
            }
        }
        other => other,
    }
}

/// API view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSummary {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub open_for_s: Option<u64>,
}

/// All breakers, keyed by processor id. Reads apply the recovery poll so an
/// expired OPEN window is observed as HALF_OPEN without a dedicated timer.
pub struct CircuitBoard {
    config: CircuitConfig,
    states: Mutex<HashMap<ProcessorId, CircuitState>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl CircuitBoard {
    pub fn new(config: CircuitConfig, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            telemetry,
        }
    }

    pub fn state(&self, processor_id: &str) -> CircuitState {
        self.evaluate(processor_id, None)
    }

    /// Whether the router may select this processor right now.
    pub fn allows(&self, processor_id: &str) -> bool {
        !self.state(processor_id).is_open()
    }

    pub fn record_success(&self, processor_id: &str) -> CircuitState {
        self.evaluate(processor_id, Some(CircuitEvent::Success))
    }

    pub fn record_failure(&self, processor_id: &str) -> CircuitState {
        self.evaluate(processor_id, Some(CircuitEvent::Failure))
    }

    /// Forgets the breaker entirely (processor unregistered).
    pub fn remove(&self, processor_id: &str) {
        self.states
            .lock()
            .expect("lock poisoned")
            .remove(processor_id);
    }

    pub fn summary(&self, processor_id: &str) -> CircuitSummary {
        let state = self.state(processor_id);
        let (failures, successes, open_for_s) = match state {
            CircuitState::Closed { consecutive_failures } => (consecutive_failures, 0, None),
            CircuitState::HalfOpen { consecutive_successes } => (0, consecutive_successes, None),
            CircuitState::Open { opened_at } => (
                0,
                0,
                Some(Instant::now().saturating_duration_since(opened_at).as_secs()),
            ),
        };
        CircuitSummary {
            state: state.name(),
            consecutive_failures: failures,
            consecutive_successes: successes,
            open_for_s,
        }
    }

    fn evaluate(&self, processor_id: &str, event: Option<CircuitEvent>) -> CircuitState {
        let now = Instant::now();
        let mut guard = self.states.lock().expect("lock poisoned");
        let current = guard
            .get(processor_id)
            .copied()
            .unwrap_or_else(CircuitState::initial);

        let mut next = poll_recovery(current, now, &self.config);
        if let Some(event) = event {
            next = advance(next, event, now, &self.config);
        }
        guard.insert(processor_id.to_string(), next);
        drop(guard);

        if next.name() != current.name() {
            self.telemetry.on_event(OrchestratorEvent::CircuitTransition {
                processor_id: processor_id.to_string(),
                from: current.name(),
                to: next.name(),
            });
        }
        next
    }
}
