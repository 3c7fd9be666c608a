use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::orchestrator::types::{
    BackpressureConfig, CircuitConfig, DispatchConfig, HealthConfig, PriorityConfig, RouterConfig,
};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_ingress_stream")]
    pub ingress_stream: String,
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    #[serde(default = "default_consumer_id")]
    pub consumer_id: String,
    #[serde(default = "default_registry_key")]
    pub registry_key: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            ingress_stream: default_ingress_stream(),
            consumer_group: default_consumer_group(),
            consumer_id: default_consumer_id(),
            registry_key: default_registry_key(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint; span export stays off when unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            service_name: default_service_name(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_log_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_log_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_stderr_warn_enabled")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            dir: default_log_dir(),
            rotation: default_log_rotation(),
            retention_days: default_log_retention_days(),
            stderr_warn_enabled: default_stderr_warn_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_s")]
    pub grace_s: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_s: default_grace_s(),
        }
    }
}

fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_ingress_stream() -> String {
    "frames:metadata".to_string()
}

fn default_consumer_group() -> String {
    "frame-buffer".to_string()
}

fn default_consumer_id() -> String {
    "frameroute-0".to_string()
}

fn default_registry_key() -> String {
    "processors:registry".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    1_000
}

fn default_op_timeout_ms() -> u64 {
    2_000
}

fn default_listen_addr() -> String {
    "127.0.0.1:8600".to_string()
}

fn default_service_name() -> String {
    "frameroute".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_log_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_log_retention_days() -> usize {
    7
}

fn default_stderr_warn_enabled() -> bool {
    true
}

fn default_grace_s() -> u64 {
    30
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let config: Config = serde_json::from_value(config_value)
            .context("failed to deserialize frameroute config")?;
        config.check()?;
        Ok(config)
    }

    /// Cross-field constraints the schema cannot express.
    pub fn check(&self) -> Result<()> {
        let thresholds = &self.backpressure.thresholds;
        if !(0.0 < thresholds.low && thresholds.low < thresholds.high) {
            return Err(anyhow!(
                "backpressure.thresholds.low must satisfy 0 < low < high"
            ));
        }
        if !(thresholds.high < thresholds.critical && thresholds.critical <= 1.0) {
            return Err(anyhow!(
                "backpressure.thresholds.critical must satisfy high < critical <= 1"
            ));
        }
        if self.bus.batch_size == 0 {
            return Err(anyhow!("bus.batch_size must be positive"));
        }
        if self.dispatch.concurrency == 0 {
            return Err(anyhow!("dispatch.concurrency must be positive"));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(anyhow!("circuit thresholds must be positive"));
        }
        self.http
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("http.listen_addr '{}' is not host:port", self.http.listen_addr))?;
        Ok(())
    }
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let sibling_default = config_base.join("frameroute.schema.json");
    if sibling_default.exists() {
        return Ok(sibling_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or frameroute.schema.json next to it"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    // Schema documents carry "$schema" for editors; strip before validating.
    let mut candidate = config_value.clone();
    if let Some(object) = candidate.as_object_mut() {
        object.remove("$schema");
    }

    if let Err(errors) = compiled.validate(&candidate) {
        let rendered: Vec<String> = errors
            .map(|error| format!("{} (at {})", error, error.instance_path))
            .collect();
        return Err(anyhow!("config failed schema validation: {}", rendered.join("; ")));
    }
    Ok(())
}
