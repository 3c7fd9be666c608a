use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::orchestrator::{
    error::{OrchestratorError, validation_error},
    trace::TraceContext,
};

pub type ProcessorId = String;
pub type CameraId = String;

pub const DETECTION_TYPE_KEY: &str = "detection_type";
pub const PROCESSOR_QUEUE_PREFIX: &str = "frames:ready:";

/// Routable frame metadata. The orchestrator never holds pixel data;
/// unrecognised entry fields (`image_data` included) ride along in `extra`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub frame_id: String,
    pub camera_id: CameraId,
    pub timestamp: OffsetDateTime,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub priority: u32,
    pub trace_context: Option<TraceContext>,
    pub metadata: BTreeMap<String, String>,
    pub extra: BTreeMap<String, String>,
}

const FIELD_FRAME_ID: &str = "frame_id";
const FIELD_CAMERA_ID: &str = "camera_id";
const FIELD_TIMESTAMP: &str = "timestamp";
const FIELD_SIZE_BYTES: &str = "size_bytes";
const FIELD_WIDTH: &str = "width";
const FIELD_HEIGHT: &str = "height";
const FIELD_FORMAT: &str = "format";
const FIELD_PRIORITY: &str = "priority";
const FIELD_METADATA: &str = "metadata";
const FIELD_TRACE_CONTEXT: &str = "trace_context";
const FIELD_TRACEPARENT: &str = "traceparent";

const KNOWN_FIELDS: &[&str] = &[
    FIELD_FRAME_ID,
    FIELD_CAMERA_ID,
    FIELD_TIMESTAMP,
    FIELD_SIZE_BYTES,
    FIELD_WIDTH,
    FIELD_HEIGHT,
    FIELD_FORMAT,
    FIELD_PRIORITY,
    FIELD_METADATA,
    FIELD_TRACE_CONTEXT,
    FIELD_TRACEPARENT,
];

impl FrameRecord {
    pub fn detection_type(&self) -> Option<&str> {
        self.metadata
            .get(DETECTION_TYPE_KEY)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Decodes a bus entry field map. `frame_id`, `camera_id` and
    /// `timestamp` are required; descriptive fields default when absent but
    /// reject unparseable values.
    pub fn from_entry_fields(
        fields: &BTreeMap<String, String>,
    ) -> Result<Self, OrchestratorError> {
        let frame_id = required_field(fields, FIELD_FRAME_ID)?;
        let camera_id = required_field(fields, FIELD_CAMERA_ID)?;

        let raw_timestamp = required_field(fields, FIELD_TIMESTAMP)?;
        let timestamp = OffsetDateTime::parse(&raw_timestamp, &Rfc3339).map_err(|err| {
            validation_error(format!(
                "frame timestamp '{raw_timestamp}' is not RFC-3339: {err}"
            ))
        })?;

        let size_bytes = numeric_field::<u64>(fields, FIELD_SIZE_BYTES)?.unwrap_or(0);
        let width = numeric_field::<u32>(fields, FIELD_WIDTH)?.unwrap_or(0);
        let height = numeric_field::<u32>(fields, FIELD_HEIGHT)?.unwrap_or(0);
        let priority = numeric_field::<u32>(fields, FIELD_PRIORITY)?.unwrap_or(0);
        let format = fields.get(FIELD_FORMAT).cloned().unwrap_or_default();

        let metadata = match fields.get(FIELD_METADATA) {
            None => BTreeMap::new(),
            Some(raw) if raw.trim().is_empty() => BTreeMap::new(),
            Some(raw) => parse_metadata(raw)?,
        };

        // traceparent wins over the structured carrier when both are present.
        let trace_context = fields
            .get(FIELD_TRACEPARENT)
            .and_then(|raw| TraceContext::parse_traceparent(raw))
            .or_else(|| {
                fields
                    .get(FIELD_TRACE_CONTEXT)
                    .and_then(|raw| serde_json::from_str::<TraceContext>(raw).ok())
            });

        let extra = fields
            .iter()
            .filter(|(key, _)| !KNOWN_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            frame_id,
            camera_id,
            timestamp,
            size_bytes,
            width,
            height,
            format,
            priority,
            trace_context,
            metadata,
            extra,
        })
    }

    /// Encodes the record back into a bus entry field map. The structured
    /// `trace_context` carrier and the `traceparent` header are both written
    /// when a context is present.
    pub fn to_entry_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert(FIELD_FRAME_ID.to_string(), self.frame_id.clone());
        fields.insert(FIELD_CAMERA_ID.to_string(), self.camera_id.clone());
        if let Ok(timestamp) = self.timestamp.format(&Rfc3339) {
            fields.insert(FIELD_TIMESTAMP.to_string(), timestamp);
        }
        fields.insert(FIELD_SIZE_BYTES.to_string(), self.size_bytes.to_string());
        fields.insert(FIELD_WIDTH.to_string(), self.width.to_string());
        fields.insert(FIELD_HEIGHT.to_string(), self.height.to_string());
        fields.insert(FIELD_FORMAT.to_string(), self.format.clone());
        fields.insert(FIELD_PRIORITY.to_string(), self.priority.to_string());

        if !self.metadata.is_empty() {
            if let Ok(encoded) = serde_json::to_string(&self.metadata) {
                fields.insert(FIELD_METADATA.to_string(), encoded);
            }
        }

        if let Some(context) = &self.trace_context {
            fields.insert(FIELD_TRACEPARENT.to_string(), context.to_traceparent());
            if let Ok(encoded) = serde_json::to_string(context) {
                fields.insert(FIELD_TRACE_CONTEXT.to_string(), encoded);
            }
        }

        for (key, value) in &self.extra {
            fields.insert(key.clone(), value.clone());
        }

        fields
    }
}

fn required_field(
    fields: &BTreeMap<String, String>,
    name: &str,
) -> Result<String, OrchestratorError> {
    match fields.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(validation_error(format!(
            "frame record is missing required field '{name}'"
        ))),
    }
}

fn numeric_field<T: std::str::FromStr>(
    fields: &BTreeMap<String, String>,
    name: &str,
) -> Result<Option<T>, OrchestratorError> {
    match fields.get(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            validation_error(format!("frame field '{name}' has non-numeric value '{raw}'"))
        }),
    }
}

fn parse_metadata(raw: &str) -> Result<BTreeMap<String, String>, OrchestratorError> {
    let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|err| validation_error(format!("frame metadata is not a JSON object: {err}")))?;

    Ok(values
        .into_iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            (key, rendered)
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorHealth {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Registration payload accepted by the control API and mirrored to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub id: ProcessorId,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl ProcessorSpec {
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.id.trim().is_empty() {
            return Err(validation_error("processor id cannot be empty"));
        }
        if self.id.chars().any(char::is_whitespace) {
            return Err(validation_error("processor id cannot contain whitespace"));
        }
        if self.capacity == 0 {
            return Err(validation_error("processor capacity must be positive"));
        }
        if self.capabilities.iter().any(|cap| cap.trim().is_empty()) {
            return Err(validation_error("processor capabilities cannot be empty strings"));
        }
        if let Some(queue) = &self.queue {
            if queue.trim().is_empty() {
                return Err(validation_error("processor queue cannot be empty"));
            }
        }
        Ok(())
    }

    pub fn queue_name(&self) -> String {
        self.queue
            .clone()
            .unwrap_or_else(|| format!("{PROCESSOR_QUEUE_PREFIX}{}", self.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub id: ProcessorId,
    pub capabilities: BTreeSet<String>,
    pub capacity: u32,
    pub queue: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub health: ProcessorHealth,
    pub current_load: f64,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub last_heartbeat_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(default)]
    pub version: u64,
}

impl ProcessorInfo {
    pub fn from_spec(spec: &ProcessorSpec, registered_at: OffsetDateTime) -> Self {
        Self {
            id: spec.id.clone(),
            capabilities: spec.capabilities.clone(),
            capacity: spec.capacity,
            queue: spec.queue_name(),
            endpoint: spec.endpoint.clone(),
            health: ProcessorHealth::Unknown,
            current_load: 0.0,
            last_heartbeat_at: None,
            registered_at,
            version: 1,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    Normal,
    Moderate,
    High,
    Critical,
}

impl PressureLevel {
    pub fn rate(self) -> f64 {
        match self {
            PressureLevel::Normal => 1.0,
            PressureLevel::Moderate => 0.8,
            PressureLevel::High => 0.5,
            PressureLevel::Critical => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Affinity,
    LeastLoaded,
    RoundRobin,
    Priority,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        Self::LeastLoaded
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub strategy: RoutingStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default = "default_probe_timeout_s")]
    pub probe_timeout_s: u64,
    /// When set, a processor that stays unhealthy for this long is
    /// unregistered by the monitor.
    #[serde(default)]
    pub permanent_failure_grace_s: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_health_check_interval_s(),
            probe_timeout_s: default_probe_timeout_s(),
            permanent_failure_grace_s: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_recovery_timeout_s")]
    pub recovery_timeout_s: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            recovery_timeout_s: default_recovery_timeout_s(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PressureThresholds {
    #[serde(default = "default_pressure_low")]
    pub low: f64,
    #[serde(default = "default_pressure_high")]
    pub high: f64,
    #[serde(default = "default_pressure_critical")]
    pub critical: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            low: default_pressure_low(),
            high: default_pressure_high(),
            critical: default_pressure_critical(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_backpressure_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default)]
    pub thresholds: PressureThresholds,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            check_interval_s: default_backpressure_check_interval_s(),
            thresholds: PressureThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    #[serde(default = "default_starvation_threshold")]
    pub starvation_threshold: u32,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            starvation_threshold: default_starvation_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_concurrency")]
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_dispatch_concurrency(),
        }
    }
}

fn default_health_check_interval_s() -> u64 {
    10
}

fn default_probe_timeout_s() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_success_threshold() -> u32 {
    2
}

fn default_recovery_timeout_s() -> u64 {
    60
}

fn default_pressure_low() -> f64 {
    0.6
}

fn default_pressure_high() -> f64 {
    0.8
}

fn default_pressure_critical() -> f64 {
    0.95
}

fn default_backpressure_check_interval_s() -> u64 {
    5
}

fn default_starvation_threshold() -> u32 {
    100
}

fn default_dispatch_concurrency() -> usize {
    8
}
