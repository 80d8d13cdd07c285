use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;
use uuid::Uuid;

use crate::ids;
use crate::kv::{KvStore, MemoryKv};

pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_QUEUE_TTL: Duration = Duration::from_secs(300);

/// Registry entry for one client, keyed under `clients:<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: String,
    pub instance_id: String,
    /// Wall-clock millis of the first registration; preserved across
    /// reconnects and never rewound.
    pub connection_timestamp: u64,
    pub last_seen: u64,
    pub reconnection_count: u32,
    pub last_reconnect_time: Option<u64>,
    pub is_controller: bool,
}

/// The single active-controller record at `leadership:active`. Semantically
/// expired once `now - timestamp` exceeds the heartbeat timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerRecord {
    pub id: String,
    pub timestamp: u64,
    pub instance_id: String,
}

/// Published at `leadership:notify` whenever leadership changes. Readers
/// dedup on `notification_id`; timestamps alone are not authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub controller_id: Option<String>,
    pub notification_id: String,
    pub timestamp: u64,
}

impl ChangeNotification {
    pub fn new(controller_id: Option<String>) -> Self {
        Self {
            controller_id,
            notification_id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
        }
    }
}

/// Session record the external auth layer writes under
/// `auth:sessions:<token>`; expiry is the key's TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub controller_id: String,
}

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Typed layer over the shared KV: every cross-instance structure the core
/// uses lives behind one of these methods. Queue keys get ULIDs from a
/// monotonic generator so same-millisecond enqueues keep FIFO order per
/// recipient.
pub struct Storage {
    kv: Arc<dyn KvStore>,
    client_ttl: Duration,
    queue_ttl: Duration,
    ulids: Mutex<ulid::Generator>,
}

impl Storage {
    pub fn new(kv: Arc<dyn KvStore>, client_ttl: Duration, queue_ttl: Duration) -> Self {
        Self {
            kv,
            client_ttl,
            queue_ttl,
            ulids: Mutex::new(ulid::Generator::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryKv::new()),
            DEFAULT_CLIENT_TTL,
            DEFAULT_QUEUE_TTL,
        )
    }

    fn next_ulid(&self) -> Ulid {
        let mut generator = self.ulids.lock();
        generator.generate().unwrap_or_else(|_| Ulid::new())
    }

    // ---- client records -------------------------------------------------

    pub async fn put_client_record(&self, record: &ClientRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.kv
            .set(&["clients", &record.id], value, Some(self.client_ttl))
            .await
            .context("writing client record")?;
        Ok(())
    }

    pub async fn get_client_record(&self, id: &str) -> Result<Option<ClientRecord>> {
        let value = self
            .kv
            .get(&["clients", id])
            .await
            .context("reading client record")?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn delete_client_record(&self, id: &str) -> Result<()> {
        self.kv
            .delete(&["clients", id])
            .await
            .context("deleting client record")?;
        Ok(())
    }

    pub async fn list_client_records(&self) -> Result<Vec<ClientRecord>> {
        let listed = self.kv.list(&["clients"]).await.context("listing clients")?;
        Ok(listed
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect())
    }

    // ---- controller directory ------------------------------------------

    /// Small marker record so every instance can enumerate controllers
    /// without scanning the full client prefix.
    pub async fn put_controller_entry(&self, id: &str, instance_id: &str) -> Result<()> {
        let value = serde_json::json!({ "id": id, "instanceId": instance_id });
        self.kv
            .set(&["controllers", id], value, Some(self.client_ttl))
            .await
            .context("writing controller directory entry")?;
        Ok(())
    }

    pub async fn delete_controller_entry(&self, id: &str) -> Result<()> {
        self.kv
            .delete(&["controllers", id])
            .await
            .context("deleting controller directory entry")?;
        Ok(())
    }

    pub async fn list_controller_ids(&self) -> Result<Vec<String>> {
        let listed = self
            .kv
            .list(&["controllers"])
            .await
            .context("listing controllers")?;
        Ok(listed
            .into_iter()
            .filter_map(|(_, v)| {
                v.get("id")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string())
            })
            .collect())
    }

    // ---- per-recipient message queues ----------------------------------

    pub async fn enqueue_message(&self, recipient: &str, frame: Value) -> Result<String> {
        let ulid = self.next_ulid().to_string();
        self.kv
            .set(&["messages", recipient, &ulid], frame, Some(self.queue_ttl))
            .await
            .context("enqueueing message")?;
        Ok(ulid)
    }

    /// Pending frames for a recipient in enqueue order, keyed by ULID.
    pub async fn list_queued(&self, recipient: &str) -> Result<Vec<(String, Value)>> {
        let listed = self
            .kv
            .list(&["messages", recipient])
            .await
            .context("listing queued messages")?;
        Ok(listed
            .into_iter()
            .filter_map(|(key, value)| {
                key.rsplit(':').next().map(|ulid| (ulid.to_string(), value))
            })
            .collect())
    }

    pub async fn delete_queued(&self, recipient: &str, ulid: &str) -> Result<()> {
        self.kv
            .delete(&["messages", recipient, ulid])
            .await
            .context("deleting queued message")?;
        Ok(())
    }

    // ---- leadership -----------------------------------------------------

    pub async fn get_controller_record(&self) -> Result<Option<ControllerRecord>> {
        let value = self
            .kv
            .get(&["leadership", "active"])
            .await
            .context("reading controller record")?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn put_controller_record(&self, record: &ControllerRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.kv
            .set(&["leadership", "active"], value, None)
            .await
            .context("writing controller record")?;
        Ok(())
    }

    pub async fn delete_controller_record(&self) -> Result<()> {
        self.kv
            .delete(&["leadership", "active"])
            .await
            .context("deleting controller record")?;
        Ok(())
    }

    pub async fn get_change_notification(&self) -> Result<Option<ChangeNotification>> {
        let value = self
            .kv
            .get(&["leadership", "notify"])
            .await
            .context("reading change notification")?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    pub async fn put_change_notification(&self, notification: &ChangeNotification) -> Result<()> {
        let value = serde_json::to_value(notification)?;
        self.kv
            .set(&["leadership", "notify"], value, None)
            .await
            .context("writing change notification")?;
        Ok(())
    }

    // ---- minted client ids ---------------------------------------------

    pub async fn reserve_client_id(&self, id: &str) -> Result<()> {
        let value = serde_json::json!({ "id": id, "mintedAt": now_ms() });
        self.kv
            .set(&["client-ids", id], value, Some(self.client_ttl))
            .await
            .context("reserving client id")?;
        Ok(())
    }

    pub async fn client_id_exists(&self, id: &str) -> Result<bool> {
        // A minted-but-unused id and a registered client both count.
        if self.kv.get(&["client-ids", id]).await?.is_some() {
            return Ok(true);
        }
        Ok(self.kv.get(&["clients", id]).await?.is_some())
    }

    // ---- auth sessions --------------------------------------------------

    pub async fn get_auth_session(&self, token: &str) -> Result<Option<AuthSession>> {
        let value = self
            .kv
            .get(&["auth", "sessions", token])
            .await
            .context("reading auth session")?;
        Ok(value.and_then(|v| serde_json::from_value(v).ok()))
    }

    /// Written by the external auth layer in production; exposed here so an
    /// in-process deployment (and the test suite) can seed sessions.
    pub async fn put_auth_session(
        &self,
        token: &str,
        session: &AuthSession,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(session)?;
        self.kv
            .set(&["auth", "sessions", token], value, ttl)
            .await
            .context("writing auth session")?;
        Ok(())
    }
}

impl ClientRecord {
    /// Fresh record for a first-time registration.
    pub fn new(id: &str, instance_id: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            instance_id: instance_id.to_string(),
            connection_timestamp: now,
            last_seen: now,
            reconnection_count: 0,
            last_reconnect_time: None,
            is_controller: ids::is_controller_id(id),
        }
    }

    /// Carry forward a prior record through a re-registration: the original
    /// `connection_timestamp` survives, the reconnection counter advances.
    pub fn reconnected(prior: &ClientRecord, instance_id: &str, now: u64) -> Self {
        Self {
            id: prior.id.clone(),
            instance_id: instance_id.to_string(),
            connection_timestamp: prior.connection_timestamp,
            last_seen: now,
            reconnection_count: prior.reconnection_count + 1,
            last_reconnect_time: Some(now),
            is_controller: prior.is_controller,
        }
    }
}
