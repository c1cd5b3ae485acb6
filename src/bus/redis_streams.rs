//! Redis Streams binding of [`MessageBus`].
//!
//! Jobs are read through a consumer group with `XREADGROUP`; the JSON body
//! sits under the `data` field of each entry. An entry stays in the group's
//! pending list until `XACK`. A negative acknowledgement leaves the entry
//! pending, and once it has been idle for the redelivery window any consumer
//! of the group reclaims it with `XAUTOCLAIM`. Results are appended to the
//! result stream with `XADD`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;

use super::{BusError, Delivery, MessageBus};

/// Stream entry field carrying the job or result JSON.
pub const PAYLOAD_FIELD: &str = "data";

/// How long one `XREADGROUP` call waits for a new entry.
const BLOCK_MS: u64 = 5_000;

/// Floor for the refresh period of a running job.
const MIN_TOUCH_INTERVAL: Duration = Duration::from_millis(100);

/// Where jobs come from and results go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// `redis://host:port/`
    pub url: String,
    pub request_stream: String,
    pub result_stream: String,
    pub group: String,
    pub consumer: String,
    /// Idle time after which an unacknowledged job is reclaimed.
    pub redelivery: Duration,
}

/// Consumer-group reader and result publisher over one multiplexed connection.
pub struct RedisStreamBus {
    settings: StreamSettings,
    conn: Option<MultiplexedConnection>,
    claim_cursor: String,
}

impl RedisStreamBus {
    /// Open the connection. Does not touch any stream yet.
    pub async fn connect(settings: StreamSettings) -> Result<Self, BusError> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| BusError::Connect(format!("{}: {e}", settings.url)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connect(format!("{}: {e}", settings.url)))?;

        tracing::info!(url = %settings.url, "connected to Redis");
        Ok(Self {
            settings,
            conn: Some(conn),
            claim_cursor: "0-0".to_string(),
        })
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    fn conn(&mut self) -> Result<&mut MultiplexedConnection, BusError> {
        self.conn
            .as_mut()
            .ok_or_else(|| BusError::Connect("connection already closed".into()))
    }

    /// Take over one stale pending entry from any consumer in the group.
    async fn reclaim(&mut self) -> Result<Vec<Delivery>, BusError> {
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.settings.request_stream)
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg(self.settings.redelivery.as_millis() as u64)
            .arg(&self.claim_cursor)
            .arg("COUNT")
            .arg(1);

        let val: Value = cmd
            .query_async(self.conn()?)
            .await
            .map_err(|e| BusError::Command(format!("XAUTOCLAIM: {e}")))?;
        let (cursor, deliveries) = parse_xautoclaim_response(val)?;
        self.claim_cursor = cursor;
        Ok(deliveries)
    }
}

#[async_trait]
impl MessageBus for RedisStreamBus {
    async fn subscribe(&mut self) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE")
            .arg(&self.settings.request_stream)
            .arg(&self.settings.group)
            .arg("$")
            .arg("MKSTREAM");

        let result: redis::RedisResult<()> = cmd.query_async(self.conn()?).await;
        match result {
            Ok(()) => {}
            // The durable group already exists; keep its position.
            Err(e) if e.to_string().contains("BUSYGROUP") => {}
            Err(e) => {
                return Err(BusError::Command(format!(
                    "XGROUP CREATE {}/{}: {e}",
                    self.settings.request_stream, self.settings.group
                )))
            }
        }

        tracing::info!(
            stream = %self.settings.request_stream,
            group = %self.settings.group,
            consumer = %self.settings.consumer,
            "subscribed to job stream"
        );
        Ok(())
    }

    async fn fetch(&mut self) -> Result<Vec<Delivery>, BusError> {
        let reclaimed = self.reclaim().await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.settings.request_stream)
            .arg(">");

        let val: Value = cmd
            .query_async(self.conn()?)
            .await
            .map_err(|e| BusError::Command(format!("XREADGROUP: {e}")))?;
        Ok(parse_xreadgroup_response(val))
    }

    async fn publish(&mut self, payload: &str) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.settings.result_stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload);

        let id: String = cmd
            .query_async(self.conn()?)
            .await
            .map_err(|e| BusError::Command(format!("XADD {}: {e}", self.settings.result_stream)))?;
        tracing::debug!(stream = %self.settings.result_stream, id = %id, "published result");
        Ok(())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.settings.request_stream)
            .arg(&self.settings.group)
            .arg(&delivery.id);

        let acked: i64 = cmd
            .query_async(self.conn()?)
            .await
            .map_err(|e| BusError::Command(format!("XACK {}: {e}", delivery.id)))?;
        if acked == 0 {
            // Already acknowledged, e.g. by the consumer it was reclaimed from.
            tracing::debug!(id = %delivery.id, "entry was no longer pending");
        }
        Ok(())
    }

    async fn nak(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        tracing::debug!(
            id = %delivery.id,
            redelivery_ms = self.settings.redelivery.as_millis() as u64,
            "leaving entry pending for redelivery"
        );
        Ok(())
    }

    async fn touch(&mut self, delivery: &Delivery) -> Result<(), BusError> {
        // Claiming our own entry with no idle threshold resets its idle time.
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.settings.request_stream)
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg(0)
            .arg(&delivery.id)
            .arg("JUSTID");

        let _: Value = cmd
            .query_async(self.conn()?)
            .await
            .map_err(|e| BusError::Command(format!("XCLAIM {}: {e}", delivery.id)))?;
        tracing::trace!(id = %delivery.id, "refreshed pending entry");
        Ok(())
    }

    fn touch_interval(&self) -> Option<Duration> {
        Some(touch_interval_for(self.settings.redelivery))
    }

    async fn close(&mut self) {
        if self.conn.take().is_some() {
            tracing::info!("closed Redis connection");
        }
    }
}

/// A third of the redelivery window, so two refreshes can be late before the
/// entry becomes claimable.
fn touch_interval_for(redelivery: Duration) -> Duration {
    (redelivery / 3).max(MIN_TOUCH_INTERVAL)
}

// ─────────────────────────────────────────────────────────────────────────────
// Response parsers
// ─────────────────────────────────────────────────────────────────────────────

/// Parse an `XREADGROUP` reply. Empty on a `BLOCK` timeout (nil reply).
pub fn parse_xreadgroup_response(val: Value) -> Vec<Delivery> {
    // Array[Array[stream_name, Array[entry...]]], or a map under RESP3.
    let streams: Vec<Value> = match val {
        Value::Array(streams) => streams
            .into_iter()
            .filter_map(|stream| match stream {
                Value::Array(mut parts) if parts.len() >= 2 => Some(parts.swap_remove(1)),
                _ => None,
            })
            .collect(),
        Value::Map(pairs) => pairs.into_iter().map(|(_, entries)| entries).collect(),
        _ => return Vec::new(),
    };

    streams
        .iter()
        .flat_map(|entries| parse_entries(entries, false))
        .collect()
}

/// Parse an `XAUTOCLAIM` reply into the next cursor and the claimed entries.
pub fn parse_xautoclaim_response(val: Value) -> Result<(String, Vec<Delivery>), BusError> {
    // Array[next_cursor, Array[entry...], (Redis 7+) Array[deleted_id...]]
    let parts = match val {
        Value::Array(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(BusError::Payload(format!(
                "unexpected XAUTOCLAIM reply: {other:?}"
            )))
        }
    };
    let cursor = value_to_string(&parts[0])
        .ok_or_else(|| BusError::Payload("XAUTOCLAIM reply without cursor".into()))?;
    Ok((cursor, parse_entries(&parts[1], true)))
}

/// Parse `Array[Array[id, Array[field, value, ...]]]` stream entries.
///
/// Entries without a `data` field are still returned, with an empty payload,
/// so the job loop rejects them like any other undecodable job.
fn parse_entries(entries: &Value, redelivered: bool) -> Vec<Delivery> {
    let Value::Array(entries) = entries else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| {
            let Value::Array(parts) = entry else {
                return None;
            };
            let id = value_to_string(parts.first()?)?;
            let payload = match parts.get(1) {
                Some(Value::Array(fields)) => extract_payload(fields),
                _ => {
                    tracing::debug!(id = %id, "skipping deleted stream entry");
                    return None;
                }
            };
            Some(Delivery {
                id,
                payload: payload.unwrap_or_default(),
                redelivered,
            })
        })
        .collect()
}

/// Value of the `data` field in a flat `[field, value, ...]` list.
fn extract_payload(fields: &[Value]) -> Option<String> {
    fields
        .chunks_exact(2)
        .find(|pair| value_to_string(&pair[0]).as_deref() == Some(PAYLOAD_FIELD))
        .and_then(|pair| value_to_string(&pair[1]))
}

fn value_to_string(val: &Value) -> Option<String> {
    match val {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
