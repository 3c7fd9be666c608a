use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures_util::{StreamExt, stream};
use tokio_util::sync::CancellationToken;

use crate::{
    bus::{BusEntry, ReadStart, StreamBus},
    config::BusConfig,
    observability::metrics::record_routing_duration,
    orchestrator::{
        backpressure::RateGate,
        dispatcher::Dispatcher,
        error::{OrchestratorError, OrchestratorErrorKind},
        priority::PriorityFrameQueue,
        registry::ProcessorRegistry,
        router::FrameRouter,
        telemetry::{OrchestratorEvent, TelemetrySink},
        types::{FrameRecord, RoutingStrategy},
    },
};

const PAUSED_POLL: Duration = Duration::from_millis(200);
const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Dispatched,
    Malformed,
    LeftPending,
}

/// The ingress consumer-group loop: drains entries this consumer already
/// owns (crash recovery), then follows new deliveries, gated by the shared
/// rate. Entries are ACKed strictly after an accepted dispatch write;
/// everything else stays in the pending list and is re-read.
pub struct StreamConsumer {
    bus: Arc<dyn StreamBus>,
    registry: Arc<ProcessorRegistry>,
    router: Arc<FrameRouter>,
    dispatcher: Arc<Dispatcher>,
    gate: Arc<RateGate>,
    telemetry: Arc<dyn TelemetrySink>,
    config: BusConfig,
    dispatch_concurrency: usize,
    staging: Option<Mutex<PriorityFrameQueue<BusEntry>>>,
}

impl StreamConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<dyn StreamBus>,
        registry: Arc<ProcessorRegistry>,
        router: Arc<FrameRouter>,
        dispatcher: Arc<Dispatcher>,
        gate: Arc<RateGate>,
        telemetry: Arc<dyn TelemetrySink>,
        config: BusConfig,
        dispatch_concurrency: usize,
        starvation_threshold: u32,
    ) -> Self {
        let staging = matches!(router.strategy(), RoutingStrategy::Priority)
            .then(|| Mutex::new(PriorityFrameQueue::new(starvation_threshold)));
        Self {
            bus,
            registry,
            router,
            dispatcher,
            gate,
            telemetry,
            config,
            dispatch_concurrency: dispatch_concurrency.max(1),
            staging,
        }
    }

    /// Runs until cancelled. Returns an error only for a fatal bus failure;
    /// transient failures back off and retry indefinitely.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), OrchestratorError> {
        self.drain_own_pending(&cancel).await?;

        let block = Duration::from_millis(self.config.block_ms);
        let mut backoff_attempt: u32 = 0;
        let mut reread_pending = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let rate = self.gate.rate();
            if rate <= 0.0 {
                // Paused: no reads; in-flight dispatches already completed
                // within the previous batch.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(PAUSED_POLL) => continue,
                }
            }

            let count = scaled_batch(self.config.batch_size, rate);
            let start = if reread_pending {
                ReadStart::Pending
            } else {
                ReadStart::New
            };

            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = self.bus.read_group(
                    &self.config.ingress_stream,
                    &self.config.consumer_group,
                    &self.config.consumer_id,
                    start,
                    count,
                    block,
                ) => read,
            };

            let batch = match read {
                Ok(batch) => {
                    backoff_attempt = 0;
                    batch
                }
                Err(err) if err.is_fatal() => {
                    return Err(OrchestratorError::from(err));
                }
                Err(err) => {
                    backoff_attempt = backoff_attempt.saturating_add(1);
                    let delay = backoff_delay(backoff_attempt);
                    tracing::warn!(
                        target: "consumer",
                        error = %err,
                        attempt = backoff_attempt,
                        delay_ms = delay.as_millis() as u64,
                        "ingress read failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            reread_pending = false;
            let entries = self.stage(batch);
            if entries.is_empty() {
                continue;
            }

            let outcomes = self.process_batch(entries).await;
            if outcomes
                .iter()
                .any(|outcome| *outcome == EntryOutcome::LeftPending)
            {
                // No eligible target or rejected write: treat as
                // backpressure and come back to our pending list.
                reread_pending = true;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(block) => {}
                }
            }

            if rate < 1.0 {
                let throttle = block.mul_f64(1.0 - rate);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(throttle) => {}
                }
            }
        }

        Ok(())
    }

    /// Startup recovery: entries delivered to this consumer id before a
    /// crash are re-dispatched before any new delivery is read.
    async fn drain_own_pending(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let batch = match self
                .bus
                .read_group(
                    &self.config.ingress_stream,
                    &self.config.consumer_group,
                    &self.config.consumer_id,
                    ReadStart::Pending,
                    self.config.batch_size,
                    Duration::ZERO,
                )
                .await
            {
                Ok(batch) => batch,
                Err(err) if err.is_fatal() => return Err(OrchestratorError::from(err)),
                Err(err) => {
                    tracing::warn!(
                        target: "consumer",
                        error = %err,
                        "pending drain read failed, continuing with new entries"
                    );
                    return Ok(());
                }
            };

            if batch.is_empty() {
                return Ok(());
            }

            let entries = self.stage(batch);
            let outcomes = self.process_batch(entries).await;
            if outcomes
                .iter()
                .any(|outcome| *outcome == EntryOutcome::LeftPending)
            {
                // Nothing routable yet; leave the remainder for the main
                // loop's pending re-reads instead of spinning here.
                return Ok(());
            }
        }
    }

    /// Under the priority strategy entries pass through the multi-band
    /// queue so higher-priority frames in the window are served first;
    /// other strategies dispatch in delivery order.
    fn stage(&self, batch: Vec<BusEntry>) -> Vec<BusEntry> {
        let Some(staging) = &self.staging else {
            return batch;
        };

        let mut queue = staging.lock().expect("lock poisoned");
        let incoming = batch.len();
        for entry in batch {
            let priority = entry
                .fields
                .get("priority")
                .and_then(|raw| raw.trim().parse::<u32>().ok())
                .unwrap_or(0);
            queue.push(priority, entry);
        }

        let take = incoming.max(self.config.batch_size).min(queue.len());
        (0..take).filter_map(|_| queue.pop()).collect()
    }

    async fn process_batch(&self, entries: Vec<BusEntry>) -> Vec<EntryOutcome> {
        stream::iter(entries)
            .map(|entry| self.handle_entry(entry))
            .buffered(self.dispatch_concurrency)
            .collect()
            .await
    }

    async fn handle_entry(&self, entry: BusEntry) -> EntryOutcome {
        let frame = match FrameRecord::from_entry_fields(&entry.fields) {
            Ok(frame) => frame,
            Err(err) => {
                self.telemetry.on_event(OrchestratorEvent::FrameMalformed {
                    entry_id: entry.id.clone(),
                    reason: err.message,
                });
                // Malformed entries are acked away so they cannot wedge the
                // pending list; the metric is the paper trail.
                self.ack_entry(&entry.id).await;
                return EntryOutcome::Malformed;
            }
        };

        self.telemetry.on_event(OrchestratorEvent::FrameConsumed {
            entry_id: entry.id.clone(),
            frame_id: frame.frame_id.clone(),
        });

        let routing_started = Instant::now();
        let snapshot = self.registry.snapshot();
        let selected = self.router.select(&frame, &snapshot);
        record_routing_duration(routing_started.elapsed().as_secs_f64());

        let target = match selected {
            Ok(target) => target,
            Err(err) => {
                if err.kind == OrchestratorErrorKind::NoEligibleProcessor {
                    self.telemetry.on_event(OrchestratorEvent::RoutingStarved {
                        frame_id: frame.frame_id.clone(),
                    });
                }
                return EntryOutcome::LeftPending;
            }
        };

        self.telemetry.on_event(OrchestratorEvent::FrameRouted {
            frame_id: frame.frame_id.clone(),
            processor_id: target.id.clone(),
        });

        match self.dispatcher.dispatch(&frame, &target).await {
            Ok(_) => {
                self.ack_entry(&entry.id).await;
                EntryOutcome::Dispatched
            }
            Err(_) => EntryOutcome::LeftPending,
        }
    }

    async fn ack_entry(&self, entry_id: &str) {
        if let Err(err) = self
            .bus
            .ack(
                &self.config.ingress_stream,
                &self.config.consumer_group,
                entry_id,
            )
            .await
        {
            // The dispatch already landed; a lost ACK degrades to a
            // duplicate delivery, which processors absorb idempotently.
            tracing::warn!(
                target: "consumer",
                entry_id = %entry_id,
                error = %err,
                "ack failed after dispatch"
            );
        }
    }
}

fn scaled_batch(batch_size: usize, rate: f64) -> usize {
    ((batch_size as f64) * rate.clamp(0.0, 1.0)).ceil().max(1.0) as usize
}

/// Exponential backoff with a small deterministic jitter; no RNG needed for
/// spreading retries.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE.as_millis() as f64;
    let max = BACKOFF_MAX.as_millis() as f64;
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let without_jitter = (base * 2f64.powi(exponent)).min(max);
    let jitter_factor = 0.9 + f64::from(attempt % 3) * 0.05;
    Duration::from_millis((without_jitter * jitter_factor) as u64)
}
