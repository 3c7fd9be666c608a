use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, ErrorKind, RedisError,
    aio::ConnectionManager,
    streams::{StreamReadOptions, StreamReadReply},
};

use crate::bus::{BusEntry, BusError, ReadStart, StreamBus};

/// Redis-Streams implementation of the bus seam. All operations run against
/// a `ConnectionManager` (auto-reconnecting) and are bounded by
/// `op_timeout`; blocking group reads add their block window on top.
pub struct RedisStreamBus {
    connection: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStreamBus {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, BusError> {
        let client =
            Client::open(url).map_err(|err| BusError::fatal(format!("invalid bus url '{url}': {err}")))?;
        let connection = ConnectionManager::new(client)
            .await
            .map_err(map_redis_error)?;
        Ok(Self {
            connection,
            op_timeout,
        })
    }

    async fn bounded<T>(
        &self,
        budget: Duration,
        operation: impl Future<Output = Result<T, RedisError>>,
    ) -> Result<T, BusError> {
        match tokio::time::timeout(budget, operation).await {
            Ok(result) => result.map_err(map_redis_error),
            Err(_) => Err(BusError::transient(format!(
                "bus operation timed out after {budget:?}"
            ))),
        }
    }
}

fn map_redis_error(err: RedisError) -> BusError {
    let fatal = matches!(
        err.kind(),
        ErrorKind::AuthenticationFailed | ErrorKind::InvalidClientConfig
    );
    if fatal {
        BusError::fatal(format!("bus rejected connection: {err}"))
    } else {
        BusError::transient(format!("bus operation failed: {err}"))
    }
}

fn entry_fields(map: &std::collections::HashMap<String, redis::Value>) -> BTreeMap<String, String> {
    map.iter()
        .filter_map(|(key, value)| {
            redis::from_redis_value::<String>(value)
                .ok()
                .map(|text| (key.clone(), text))
        })
        .collect()
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    async fn ping(&self) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let _: String = self
            .bounded(self.op_timeout, async move {
                redis::cmd("PING").query_async(&mut connection).await
            })
            .await?;
        Ok(())
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let stream = stream.to_string();
        let group = group.to_string();
        let result: Result<(), BusError> = self
            .bounded(self.op_timeout, async move {
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(&stream)
                    .arg(&group)
                    .arg("$")
                    .arg("MKSTREAM")
                    .query_async(&mut connection)
                    .await
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            // Group already exists: the bootstrap is idempotent.
            Err(err) if err.message.contains("BUSYGROUP") => Ok(()),
            Err(err) => Err(err),
        }
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
        let mut connection = self.connection.clone();
        let stream = stream.to_string();
        let start_id = match start {
            ReadStart::Pending => "0",
            ReadStart::New => ">",
        };

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        if start == ReadStart::New {
            options = options.block(block.as_millis() as usize);
        }

        let budget = self.op_timeout + block + Duration::from_millis(250);
        let reply: StreamReadReply = self
            .bounded(budget, async move {
                connection
                    .xread_options(&[&stream], &[start_id], &options)
                    .await
            })
            .await?;

        let mut entries = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                entries.push(BusEntry {
                    id: id.id.clone(),
                    fields: entry_fields(&id.map),
                });
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let stream = stream.to_string();
        let group = group.to_string();
        let entry_id = entry_id.to_string();
        let _: i64 = self
            .bounded(self.op_timeout, async move {
                connection.xack(&stream, &group, &[&entry_id]).await
            })
            .await?;
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<String, BusError> {
        let mut connection = self.connection.clone();
        let mut command = redis::cmd("XADD");
        command.arg(stream).arg("*");
        for (key, value) in fields {
            command.arg(key).arg(value);
        }
        let id: String = self
            .bounded(self.op_timeout, async move {
                command.query_async(&mut connection).await
            })
            .await?;
        Ok(id)
    }

    async fn queue_len(&self, stream: &str) -> Result<u64, BusError> {
        let mut connection = self.connection.clone();
        let stream = stream.to_string();
        let length: u64 = self
            .bounded(self.op_timeout, async move { connection.xlen(&stream).await })
            .await?;
        Ok(length)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let key = key.to_string();
        let field = field.to_string();
        let value = value.to_string();
        let _: () = self
            .bounded(self.op_timeout, async move {
                connection.hset(&key, &field, &value).await
            })
            .await?;
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<(), BusError> {
        let mut connection = self.connection.clone();
        let key = key.to_string();
        let field = field.to_string();
        let _: () = self
            .bounded(self.op_timeout, async move {
                connection.hdel(&key, &field).await
            })
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<BTreeMap<String, String>, BusError> {
        let mut connection = self.connection.clone();
        let key = key.to_string();
        let entries: BTreeMap<String, String> = self
            .bounded(self.op_timeout, async move { connection.hgetall(&key).await })
            .await?;
        Ok(entries)
    }
}
