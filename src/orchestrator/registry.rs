use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

use time::OffsetDateTime;

use crate::{
    bus::{BusError, StreamBus},
    observability::metrics::record_registered_processors,
    orchestrator::{
        error::{OrchestratorError, conflict, internal_error, not_found},
        telemetry::{OrchestratorEvent, TelemetrySink},
        types::{ProcessorHealth, ProcessorId, ProcessorInfo, ProcessorSpec},
    },
};

/// Internally consistent registry view handed to the router. Computed by
/// copy-on-read; never observes a half-applied mutation.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub processors: Vec<ProcessorInfo>,
}

#[derive(Default)]
struct RegistryState {
    version: u64,
    by_id: BTreeMap<ProcessorId, ProcessorInfo>,
}

/// Processor registry, mirrored into a bus-side hash so a restarted
/// orchestrator reconstructs it before consuming. Structural mutations
/// (register/unregister) are serialised behind one async lock so the mirror
/// write and the in-memory insert cannot interleave; field updates
/// (health, load) take the write lock directly.
pub struct ProcessorRegistry {
    bus: Arc<dyn StreamBus>,
    mirror_key: String,
    state: RwLock<RegistryState>,
    mutation_lock: tokio::sync::Mutex<()>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ProcessorRegistry {
    pub fn new(
        bus: Arc<dyn StreamBus>,
        mirror_key: impl Into<String>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            bus,
            mirror_key: mirror_key.into(),
            state: RwLock::new(RegistryState::default()),
            mutation_lock: tokio::sync::Mutex::new(()),
            telemetry,
        }
    }

    /// Registers a processor: persisted to the mirror first, visible in
    /// memory only after the bus accepted the write.
    pub async fn register(&self, spec: &ProcessorSpec) -> Result<ProcessorInfo, OrchestratorError> {
        spec.validate()?;
        let _guard = self.mutation_lock.lock().await;

        {
            let state = self.state.read().expect("lock poisoned");
            if state.by_id.contains_key(&spec.id) {
                return Err(conflict(format!(
                    "processor '{}' is already registered",
                    spec.id
                ))
                .with_processor_id(spec.id.clone()));
            }
        }

        let info = ProcessorInfo::from_spec(spec, OffsetDateTime::now_utc());
        let encoded = serde_json::to_string(&info)
            .map_err(|err| internal_error(format!("failed to encode processor record: {err}")))?;
        self.bus
            .hash_set(&self.mirror_key, &info.id, &encoded)
            .await
            .map_err(OrchestratorError::from)?;

        let count = {
            let mut state = self.state.write().expect("lock poisoned");
            state.by_id.insert(info.id.clone(), info.clone());
            state.version = state.version.saturating_add(1);
            state.by_id.len()
        };
        record_registered_processors(count);
        self.telemetry.on_event(OrchestratorEvent::ProcessorRegistered {
            processor_id: info.id.clone(),
        });
        Ok(info)
    }

    pub async fn unregister(&self, processor_id: &str) -> Result<ProcessorInfo, OrchestratorError> {
        let _guard = self.mutation_lock.lock().await;

        let exists = {
            let state = self.state.read().expect("lock poisoned");
            state.by_id.contains_key(processor_id)
        };
        if !exists {
            return Err(not_found(format!("processor '{processor_id}' is not registered"))
                .with_processor_id(processor_id.to_string()));
        }

        self.bus
            .hash_del(&self.mirror_key, processor_id)
            .await
            .map_err(OrchestratorError::from)?;

        let (removed, count) = {
            let mut state = self.state.write().expect("lock poisoned");
            let removed = state.by_id.remove(processor_id);
            state.version = state.version.saturating_add(1);
            (removed, state.by_id.len())
        };
        record_registered_processors(count);
        self.telemetry.on_event(OrchestratorEvent::ProcessorUnregistered {
            processor_id: processor_id.to_string(),
        });
        removed.ok_or_else(|| internal_error("registry entry vanished during unregister"))
    }

    pub fn get(&self, processor_id: &str) -> Option<ProcessorInfo> {
        self.state
            .read()
            .expect("lock poisoned")
            .by_id
            .get(processor_id)
            .cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.read().expect("lock poisoned");
        RegistrySnapshot {
            version: state.version,
            processors: state.by_id.values().cloned().collect(),
        }
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ProcessorInfo> {
        self.state
            .read()
            .expect("lock poisoned")
            .by_id
            .values()
            .filter(|info| info.has_capability(capability))
            .cloned()
            .collect()
    }

    /// Health transition driven by the monitor. Returns false for unknown
    /// processors (raced with an unregister).
    pub fn mark_health(
        &self,
        processor_id: &str,
        health: ProcessorHealth,
        heartbeat_at: Option<OffsetDateTime>,
    ) -> bool {
        let mut state = self.state.write().expect("lock poisoned");
        let Some(info) = state.by_id.get_mut(processor_id) else {
            return false;
        };
        if info.health != health || heartbeat_at.is_some() {
            info.health = health;
            if let Some(heartbeat_at) = heartbeat_at {
                info.last_heartbeat_at = Some(heartbeat_at);
            }
            info.version = info.version.saturating_add(1);
            state.version = state.version.saturating_add(1);
        }
        true
    }

    /// Load fraction from queue-depth sampling, clamped into [0, 1].
    pub fn update_load(&self, processor_id: &str, load: f64) -> bool {
        let clamped = load.clamp(0.0, 1.0);
        let mut state = self.state.write().expect("lock poisoned");
        let Some(info) = state.by_id.get_mut(processor_id) else {
            return false;
        };
        if (info.current_load - clamped).abs() > f64::EPSILON {
            info.current_load = clamped;
            info.version = info.version.saturating_add(1);
            state.version = state.version.saturating_add(1);
        }
        true
    }

    /// Rebuilds the in-memory registry from the bus mirror on startup.
    /// Malformed mirror entries are skipped and logged, not fatal. Health
    /// and load restart derived (probes re-establish them).
    pub async fn reload_from_mirror(&self) -> Result<usize, BusError> {
        let entries = self.bus.hash_get_all(&self.mirror_key).await?;
        let _guard = self.mutation_lock.lock().await;

        let mut restored = 0;
        let mut state = self.state.write().expect("lock poisoned");
        for (processor_id, encoded) in entries {
            match serde_json::from_str::<ProcessorInfo>(&encoded) {
                Ok(mut info) => {
                    info.health = ProcessorHealth::Unknown;
                    info.current_load = 0.0;
                    state.by_id.insert(processor_id, info);
                    restored += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        target: "registry",
                        processor_id = %processor_id,
                        error = %err,
                        "skipping malformed registry mirror entry"
                    );
                }
            }
        }
        state.version = state.version.saturating_add(1);
        let count = state.by_id.len();
        drop(state);
        record_registered_processors(count);
        Ok(restored)
    }
}
