pub mod memory;
pub mod redis;

use std::{collections::BTreeMap, fmt, time::Duration};

use async_trait::async_trait;

pub use self::memory::InMemoryStreamBus;
pub use self::redis::RedisStreamBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusErrorKind {
    Transient,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct BusError {
    pub kind: BusErrorKind,
    pub message: String,
}

impl BusError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: BusErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: BusErrorKind::Fatal,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == BusErrorKind::Fatal
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BusError {}

/// One delivered stream entry: the bus-assigned id plus its field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Where a consumer-group read starts: `Pending` re-reads entries already
/// delivered to this consumer (crash recovery / redelivery), `New` waits for
/// entries nobody in the group has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStart {
    Pending,
    New,
}

/// The durable append-only bus as the orchestrator consumes it: streams with
/// consumer groups, pending-entries lists and explicit ACK, plus one hash for
/// the registry mirror. Implemented by `RedisStreamBus` in production and by
/// `InMemoryStreamBus` in tests.
#[async_trait]
pub trait StreamBus: Send + Sync {
    async fn ping(&self) -> Result<(), BusError>;

    /// Idempotently creates `group` on `stream`, creating the stream when it
    /// does not exist yet.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: ReadStart,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusEntry>, BusError>;

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError>;

    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError>;

    async fn queue_len(&self, stream: &str) -> Result<u64, BusError>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BusError>;

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BusError>;

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BusError>;
}
