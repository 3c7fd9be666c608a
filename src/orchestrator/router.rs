use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering as AtomicOrdering},
    },
};

use crate::orchestrator::{
    circuit::CircuitBoard,
    error::{OrchestratorError, no_eligible_processor},
    registry::RegistrySnapshot,
    types::{CameraId, FrameRecord, ProcessorHealth, ProcessorId, ProcessorInfo, RoutingStrategy},
};

/// Routing decision engine: one eligibility/capability pipeline feeding the
/// configured strategy. Pure over the registry snapshot except for the
/// rotation cursor and the affinity map, which are the strategies' own
/// state.
pub struct FrameRouter {
    strategy: RoutingStrategy,
    circuits: Arc<CircuitBoard>,
    rotation: AtomicU64,
    affinity: Mutex<BTreeMap<CameraId, ProcessorId>>,
}

impl FrameRouter {
    pub fn new(strategy: RoutingStrategy, circuits: Arc<CircuitBoard>) -> Self {
        Self {
            strategy,
            circuits,
            rotation: AtomicU64::new(0),
            affinity: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.strategy
    }

    pub fn select(
        &self,
        frame: &FrameRecord,
        snapshot: &RegistrySnapshot,
    ) -> Result<ProcessorInfo, OrchestratorError> {
        let mut eligible: Vec<&ProcessorInfo> = snapshot
            .processors
            .iter()
            .filter(|info| info.health != ProcessorHealth::Unhealthy)
            .filter(|info| self.circuits.allows(&info.id))
            .collect();

        if let Some(capability) = frame.detection_type() {
            eligible.retain(|info| info.has_capability(capability));
        }

        if eligible.is_empty() {
            return Err(no_eligible_processor(format!(
                "no eligible processor for frame '{}'",
                frame.frame_id
            )));
        }

        let chosen = match self.strategy {
            RoutingStrategy::LeastLoaded | RoutingStrategy::Priority => least_loaded(&eligible),
            RoutingStrategy::RoundRobin => self.rotate(&mut eligible),
            RoutingStrategy::Affinity => self.affine(&frame.camera_id, &eligible),
        };
        Ok(chosen.clone())
    }

    /// Drops every affinity assignment pointing at an unregistered
    /// processor.
    pub fn forget_processor(&self, processor_id: &str) {
        self.affinity
            .lock()
            .expect("lock poisoned")
            .retain(|_, assigned| assigned != processor_id);
    }

    pub fn affinity_assignments(&self) -> BTreeMap<CameraId, ProcessorId> {
        self.affinity.lock().expect("lock poisoned").clone()
    }

    fn rotate<'a>(&self, eligible: &mut Vec<&'a ProcessorInfo>) -> &'a ProcessorInfo {
        eligible.sort_by(|a, b| a.id.cmp(&b.id));
        let slot = self.rotation.fetch_add(1, AtomicOrdering::Relaxed) as usize;
        eligible[slot % eligible.len()]
    }

    fn affine<'a>(
        &self,
        camera_id: &str,
        eligible: &[&'a ProcessorInfo],
    ) -> &'a ProcessorInfo {
        let mut assignments = self.affinity.lock().expect("lock poisoned");

        if let Some(assigned) = assignments.get(camera_id) {
            if let Some(info) = eligible.iter().copied().find(|info| &info.id == assigned) {
                return info;
            }
            // Target vanished or became ineligible: prune and reassign.
            assignments.remove(camera_id);
        }

        let mut camera_counts: HashMap<&ProcessorId, usize> = HashMap::new();
        for assigned in assignments.values() {
            *camera_counts.entry(assigned).or_insert(0) += 1;
        }

        let chosen = eligible
            .iter()
            .copied()
            .min_by(|a, b| {
                let a_count = camera_counts.get(&a.id).copied().unwrap_or(0);
                let b_count = camera_counts.get(&b.id).copied().unwrap_or(0);
                a_count.cmp(&b_count).then_with(|| a.id.cmp(&b.id))
            })
            .expect("eligible set checked non-empty");

        assignments.insert(camera_id.to_string(), chosen.id.clone());
        chosen
    }
}

fn least_loaded<'a>(eligible: &[&'a ProcessorInfo]) -> &'a ProcessorInfo {
    eligible
        .iter()
        .copied()
        .min_by(|a, b| {
            a.current_load
                .partial_cmp(&b.current_load)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        })
        .expect("eligible set checked non-empty")
}
