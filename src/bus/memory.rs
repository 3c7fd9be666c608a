use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::bus::{BusEntry, BusError, ReadStart, StreamBus};

/// In-memory rendition of the bus with consumer-group semantics (delivery
/// cursor, pending-entries list, explicit ACK). Kept in-tree so the
/// integration suite can exercise the full consume→route→dispatch→ack path
/// without a running bus; tests can additionally inject append/read
/// failures to simulate outages.
#[derive(Default)]
pub struct InMemoryStreamBus {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    streams: BTreeMap<String, StreamState>,
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    fail_appends_to: BTreeSet<String>,
    fail_all_ops: bool,
    next_entry_seq: u64,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<BusEntry>,
    groups: BTreeMap<String, GroupState>,
}

#[derive(Default)]
struct GroupState {
    // Index into `entries` of the next never-delivered entry.
    cursor: usize,
    // entry id -> consumer that owns it, until ACKed.
    pending: BTreeMap<String, String>,
}

impl InMemoryStreamBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes appends to `stream` fail with a transient bus error until
    /// cleared. Simulates a per-queue outage.
    pub fn set_append_failure(&self, stream: &str, failing: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        if failing {
            state.fail_appends_to.insert(stream.to_string());
        } else {
            state.fail_appends_to.remove(stream);
        }
    }

    /// Makes every bus operation fail with a transient error. Simulates a
    /// full disconnect.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().expect("lock poisoned").fail_all_ops = disconnected;
    }

    pub fn entries(&self, stream: &str) -> Vec<BusEntry> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .streams
            .get(stream)
            .map(|s| s.entries.clone())
            .unwrap_or_default()
    }

    pub fn pending_entry_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn check_connected(state: &MemoryState) -> Result<(), BusError> {
        if state.fail_all_ops {
            Err(BusError::transient("in-memory bus is disconnected"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StreamBus for InMemoryStreamBus {
    async fn ping(&self) -> Result<(), BusError> {
        let state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        start: ReadStart,
        count: usize,
        block: Duration,
    ) -> Result<Vec<BusEntry>, BusError> {
        let entries = {
            let mut state = self.state.lock().expect("lock poisoned");
            Self::check_connected(&state)?;

            let stream_state = state.streams.entry(stream.to_string()).or_default();
            let group_state = stream_state
                .groups
                .entry(group.to_string())
                .or_default();

            match start {
                ReadStart::Pending => {
                    let ids: Vec<String> = group_state
                        .pending
                        .iter()
                        .filter(|(_, owner)| owner.as_str() == consumer)
                        .map(|(id, _)| id.clone())
                        .take(count.max(1))
                        .collect();
                    ids.iter()
                        .filter_map(|id| {
                            stream_state
                                .entries
                                .iter()
                                .find(|entry| &entry.id == id)
                                .cloned()
                        })
                        .collect::<Vec<_>>()
                }
                ReadStart::New => {
                    let cursor = group_state.cursor;
                    let fresh: Vec<BusEntry> = stream_state
                        .entries
                        .iter()
                        .skip(cursor)
                        .take(count.max(1))
                        .cloned()
                        .collect();
                    let group_state = stream_state
                        .groups
                        .get_mut(group)
                        .expect("group just ensured");
                    group_state.cursor = cursor + fresh.len();
                    for entry in &fresh {
                        group_state
                            .pending
                            .insert(entry.id.clone(), consumer.to_string());
                    }
                    fresh
                }
            }
        };

        if entries.is_empty() && start == ReadStart::New && !block.is_zero() {
            // No wakeup machinery: approximate the blocking read with a nap.
            tokio::time::sleep(block.min(Duration::from_millis(20))).await;
        }

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        if let Some(stream_state) = state.streams.get_mut(stream) {
            if let Some(group_state) = stream_state.groups.get_mut(group) {
                group_state.pending.remove(entry_id);
            }
        }
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        if state.fail_appends_to.contains(stream) {
            return Err(BusError::transient(format!(
                "append to '{stream}' refused by test harness"
            )));
        }

        state.next_entry_seq += 1;
        let id = format!("{:016}-0", state.next_entry_seq);
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(BusEntry {
                id: id.clone(),
                fields: fields.clone(),
            });
        Ok(id)
    }

    async fn queue_len(&self, stream: &str) -> Result<u64, BusError> {
        let state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BusError> {
        let state = self.state.lock().expect("lock poisoned");
        Self::check_connected(&state)?;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }
}
