use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use frameroute::{
    bus::{InMemoryStreamBus, StreamBus},
    config::BusConfig,
    orchestrator::{
        backpressure::{BackpressureController, DepthBoard, RateGate},
        circuit::CircuitBoard,
        consumer::StreamConsumer,
        dispatcher::Dispatcher,
        health::HealthMonitor,
        registry::ProcessorRegistry,
        router::FrameRouter,
        telemetry::{DispatchStats, NoopTelemetrySink},
        types::{
            BackpressureConfig, CircuitConfig, HealthConfig, ProcessorHealth, ProcessorInfo,
            ProcessorSpec, RoutingStrategy,
        },
    },
};

pub const INGRESS: &str = "frames:metadata";
pub const GROUP: &str = "frame-buffer";
pub const CONSUMER_ID: &str = "frameroute-test";

pub struct HarnessOptions {
    pub strategy: RoutingStrategy,
    pub circuit: CircuitConfig,
    pub starvation_threshold: u32,
    pub dispatch_concurrency: usize,
    pub batch_size: usize,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::LeastLoaded,
            circuit: CircuitConfig::default(),
            starvation_threshold: 100,
            dispatch_concurrency: 4,
            batch_size: 10,
        }
    }
}

/// Full consume→route→dispatch pipeline over the in-memory bus.
pub struct Harness {
    pub bus: Arc<InMemoryStreamBus>,
    pub registry: Arc<ProcessorRegistry>,
    pub circuits: Arc<CircuitBoard>,
    pub router: Arc<FrameRouter>,
    pub dispatcher: Arc<Dispatcher>,
    pub consumer: Arc<StreamConsumer>,
    pub gate: Arc<RateGate>,
    pub depths: Arc<DepthBoard>,
    pub stats: Arc<DispatchStats>,
    pub bus_config: BusConfig,
}

impl Harness {
    pub fn new(strategy: RoutingStrategy) -> Self {
        Self::with_options(HarnessOptions {
            strategy,
            ..HarnessOptions::default()
        })
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let bus = Arc::new(InMemoryStreamBus::new());
        let telemetry = Arc::new(NoopTelemetrySink);

        let bus_config = BusConfig {
            consumer_id: CONSUMER_ID.to_string(),
            batch_size: options.batch_size,
            block_ms: 10,
            ..BusConfig::default()
        };

        let circuits = Arc::new(CircuitBoard::new(options.circuit, telemetry.clone()));
        let registry = Arc::new(ProcessorRegistry::new(
            bus.clone(),
            bus_config.registry_key.clone(),
            telemetry.clone(),
        ));
        let router = Arc::new(FrameRouter::new(options.strategy, circuits.clone()));
        let gate = Arc::new(RateGate::new());
        let depths = Arc::new(DepthBoard::default());
        let stats = Arc::new(DispatchStats::default());
        let dispatcher = Arc::new(Dispatcher::new(
            bus.clone(),
            circuits.clone(),
            telemetry.clone(),
            stats.clone(),
        ));
        let consumer = Arc::new(StreamConsumer::new(
            bus.clone(),
            registry.clone(),
            router.clone(),
            dispatcher.clone(),
            gate.clone(),
            telemetry.clone(),
            bus_config.clone(),
            options.dispatch_concurrency,
            options.starvation_threshold,
        ));

        Self {
            bus,
            registry,
            circuits,
            router,
            dispatcher,
            consumer,
            gate,
            depths,
            stats,
            bus_config,
        }
    }

    pub fn controller(&self, config: BackpressureConfig) -> BackpressureController {
        BackpressureController::new(
            self.bus.clone(),
            self.registry.clone(),
            self.gate.clone(),
            self.depths.clone(),
            self.stats.clone(),
            Arc::new(NoopTelemetrySink),
            config,
        )
    }

    pub fn monitor(&self, config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(
            self.registry.clone(),
            self.circuits.clone(),
            self.router.clone(),
            self.depths.clone(),
            Arc::new(NoopTelemetrySink),
            config,
        )
    }

    pub async fn register_healthy(
        &self,
        id: &str,
        capabilities: &[&str],
        capacity: u32,
    ) -> ProcessorInfo {
        let spec = ProcessorSpec {
            id: id.to_string(),
            capabilities: capabilities
                .iter()
                .map(|cap| cap.to_string())
                .collect::<BTreeSet<_>>(),
            capacity,
            queue: None,
            endpoint: None,
        };
        let info = self.registry.register(&spec).await.expect("register");
        self.registry
            .mark_health(id, ProcessorHealth::Healthy, None);
        info
    }

    pub async fn submit(&self, fields: BTreeMap<String, String>) -> String {
        self.bus.append(INGRESS, &fields).await.expect("ingress append")
    }

    /// Runs the consumer loop for a bounded window, then cancels and joins.
    pub async fn pump(&self, window: Duration) {
        let cancel = CancellationToken::new();
        let consumer = self.consumer.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { consumer.run(token).await });
        tokio::time::sleep(window).await;
        cancel.cancel();
        task.await
            .expect("consumer task join")
            .expect("consumer loop");
    }

    pub fn ready_queue(&self, processor_id: &str) -> Vec<frameroute::bus::BusEntry> {
        self.bus.entries(&format!("frames:ready:{processor_id}"))
    }

    pub fn ingress_pending(&self) -> Vec<String> {
        self.bus.pending_entry_ids(INGRESS, GROUP)
    }
}

pub fn frame_entry(frame_id: &str, camera_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("frame_id".to_string(), frame_id.to_string()),
        ("camera_id".to_string(), camera_id.to_string()),
        (
            "timestamp".to_string(),
            "2026-08-01T10:00:00Z".to_string(),
        ),
        ("size_bytes".to_string(), "2048".to_string()),
        ("width".to_string(), "640".to_string()),
        ("height".to_string(), "480".to_string()),
        ("format".to_string(), "jpeg".to_string()),
    ])
}

pub fn with_detection_type(
    mut fields: BTreeMap<String, String>,
    detection_type: &str,
) -> BTreeMap<String, String> {
    fields.insert(
        "metadata".to_string(),
        format!(r#"{{"detection_type":"{detection_type}"}}"#),
    );
    fields
}

pub fn with_priority(
    mut fields: BTreeMap<String, String>,
    priority: u32,
) -> BTreeMap<String, String> {
    fields.insert("priority".to_string(), priority.to_string());
    fields
}

pub fn with_traceparent(
    mut fields: BTreeMap<String, String>,
    traceparent: &str,
) -> BTreeMap<String, String> {
    fields.insert("traceparent".to_string(), traceparent.to_string());
    fields
}
