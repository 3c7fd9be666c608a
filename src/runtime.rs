use std::{
    fmt,
    sync::{Arc, atomic::{AtomicBool, Ordering}},
    time::Duration,
};

use anyhow::anyhow;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
};
use tokio_util::sync::CancellationToken;

use crate::{
    api::{ApiState, control_router},
    bus::{BusError, RedisStreamBus, StreamBus},
    config::Config,
    observability::metrics::{MetricsTelemetrySink, install_prometheus_recorder},
    orchestrator::{
        backpressure::{BackpressureController, DepthBoard, RateGate},
        circuit::CircuitBoard,
        consumer::StreamConsumer,
        dispatcher::Dispatcher,
        health::HealthMonitor,
        registry::ProcessorRegistry,
        router::FrameRouter,
        telemetry::{DispatchStats, TelemetrySink},
    },
};

const STARTUP_CONNECT_ATTEMPTS: u32 = 5;
const STARTUP_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum RuntimeError {
    /// The bus could not be reached or refused us during startup.
    BusStartup(String),
    Fatal(anyhow::Error),
}

impl RuntimeError {
    pub fn exit_code(&self) -> u8 {
        match self {
            RuntimeError::BusStartup(_) => 2,
            RuntimeError::Fatal(_) => 1,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::BusStartup(message) => {
                write!(f, "unrecoverable bus failure at startup: {message}")
            }
            RuntimeError::Fatal(err) => write!(f, "{err:#}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

pub async fn run(config: Config) -> Result<(), RuntimeError> {
    let prometheus = install_prometheus_recorder()
        .map_err(|err| RuntimeError::Fatal(anyhow!("failed to install metrics recorder: {err}")))?;

    let bus = connect_bus(&config).await?;
    bus.ensure_group(&config.bus.ingress_stream, &config.bus.consumer_group)
        .await
        .map_err(|err| RuntimeError::BusStartup(err.message))?;

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(MetricsTelemetrySink);
    let circuits = Arc::new(CircuitBoard::new(config.circuit, telemetry.clone()));
    let registry = Arc::new(ProcessorRegistry::new(
        bus.clone(),
        config.bus.registry_key.clone(),
        telemetry.clone(),
    ));

    match registry.reload_from_mirror().await {
        Ok(restored) => {
            tracing::info!(target: "runtime", restored, "registry mirror reloaded");
        }
        Err(err) if err.is_fatal() => return Err(RuntimeError::BusStartup(err.message)),
        Err(err) => {
            tracing::warn!(
                target: "runtime",
                error = %err,
                "registry mirror reload failed, starting empty"
            );
        }
    }

    let gate = Arc::new(RateGate::new());
    let depths = Arc::new(DepthBoard::default());
    let stats = Arc::new(DispatchStats::default());
    let frame_router = Arc::new(FrameRouter::new(config.router.strategy, circuits.clone()));
    let dispatcher = Arc::new(Dispatcher::new(
        bus.clone(),
        circuits.clone(),
        telemetry.clone(),
        stats.clone(),
    ));

    let consumer = Arc::new(StreamConsumer::new(
        bus.clone(),
        registry.clone(),
        frame_router.clone(),
        dispatcher,
        gate.clone(),
        telemetry.clone(),
        config.bus.clone(),
        config.dispatch.concurrency,
        config.priority.starvation_threshold,
    ));
    let monitor = HealthMonitor::new(
        registry.clone(),
        circuits.clone(),
        frame_router.clone(),
        depths.clone(),
        telemetry.clone(),
        config.health.clone(),
    );
    let controller = BackpressureController::new(
        bus.clone(),
        registry.clone(),
        gate.clone(),
        depths.clone(),
        stats.clone(),
        telemetry.clone(),
        config.backpressure.clone(),
    );

    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let api_state = Arc::new(ApiState {
        registry: registry.clone(),
        circuits: circuits.clone(),
        router: frame_router.clone(),
        gate: gate.clone(),
        depths: depths.clone(),
        stats: stats.clone(),
        prometheus: Some(prometheus),
        ready: ready.clone(),
    });

    let listener = TcpListener::bind(&config.http.listen_addr)
        .await
        .map_err(|err| {
            RuntimeError::Fatal(anyhow!(
                "failed to bind control api on {}: {err}",
                config.http.listen_addr
            ))
        })?;
    let http_cancel = cancel.clone();
    let http_task = tokio::spawn(
        axum::serve(listener, control_router(api_state))
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .into_future(),
    );

    let monitor_task = tokio::spawn(monitor.run(cancel.clone()));
    let pressure_task = tokio::spawn(controller.run(cancel.clone()));
    let consumer_cancel = cancel.clone();
    let consumer_for_task = consumer.clone();
    let mut consumer_task =
        tokio::spawn(async move { consumer_for_task.run(consumer_cancel).await });

    ready.store(true, Ordering::Release);
    tracing::info!(
        target: "runtime",
        listen_addr = %config.http.listen_addr,
        ingress_stream = %config.bus.ingress_stream,
        consumer_group = %config.bus.consumer_group,
        consumer_id = %config.bus.consumer_id,
        strategy = ?config.router.strategy,
        "frameroute started"
    );

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|err| RuntimeError::Fatal(anyhow!("unable to listen for SIGINT: {err}")))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|err| RuntimeError::Fatal(anyhow!("unable to listen for SIGTERM: {err}")))?;

    let outcome: Result<&'static str, RuntimeError> = tokio::select! {
        _ = sigint.recv() => Ok("SIGINT"),
        _ = sigterm.recv() => Ok("SIGTERM"),
        joined = &mut consumer_task => match joined {
            Ok(Ok(())) => Ok("consumer stopped"),
            Ok(Err(err)) => Err(RuntimeError::Fatal(anyhow!("consumer failed: {err}"))),
            Err(err) => Err(RuntimeError::Fatal(anyhow!("consumer task panicked: {err}"))),
        },
    };

    // Stop accepting reads and registrations, then drain within the grace
    // window; whatever did not complete stays unacked for redelivery.
    ready.store(false, Ordering::Release);
    cancel.cancel();
    let grace = Duration::from_secs(config.shutdown.grace_s.max(1));
    let drained = tokio::time::timeout(grace, async {
        let _ = consumer_task.await;
        let _ = monitor_task.await;
        let _ = pressure_task.await;
        let _ = http_task.await;
    })
    .await;

    match &outcome {
        Ok(reason) => {
            tracing::info!(
                target: "runtime",
                reason,
                drained = drained.is_ok(),
                "frameroute stopped"
            );
        }
        Err(err) => {
            tracing::error!(target: "runtime", error = %err, "frameroute stopping after failure");
        }
    }

    outcome.map(|_| ())
}

async fn connect_bus(config: &Config) -> Result<Arc<dyn StreamBus>, RuntimeError> {
    let op_timeout = Duration::from_millis(config.bus.op_timeout_ms.max(1));
    let mut last_error: Option<BusError> = None;

    for attempt in 0..STARTUP_CONNECT_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(STARTUP_CONNECT_BACKOFF * 2u32.pow(attempt - 1)).await;
        }

        match RedisStreamBus::connect(&config.bus.url, op_timeout).await {
            Ok(bus) => match bus.ping().await {
                Ok(()) => return Ok(Arc::new(bus)),
                Err(err) if err.is_fatal() => return Err(RuntimeError::BusStartup(err.message)),
                Err(err) => {
                    tracing::warn!(
                        target: "runtime",
                        attempt,
                        error = %err,
                        "bus ping failed during startup"
                    );
                    last_error = Some(err);
                }
            },
            Err(err) if err.is_fatal() => return Err(RuntimeError::BusStartup(err.message)),
            Err(err) => {
                tracing::warn!(
                    target: "runtime",
                    attempt,
                    error = %err,
                    "bus connect failed during startup"
                );
                last_error = Some(err);
            }
        }
    }

    Err(RuntimeError::BusStartup(
        last_error
            .map(|err| err.message)
            .unwrap_or_else(|| "bus unreachable".to_string()),
    ))
}
