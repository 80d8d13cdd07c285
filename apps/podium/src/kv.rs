use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

/// Error surface for KV backends. Transient backend failures are logged by
/// callers and surfaced as 500s on HTTP paths; WebSocket paths swallow them
/// and continue.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// Minimal contract the coordination core needs from the shared store: point
/// reads/writes with per-write TTL and ordered prefix listing. Keys are
/// ordered string tuples; backends join them with `:`. All writes are
/// single-key, last-writer-wins.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &[&str]) -> Result<Option<Value>, KvError>;

    /// Overwriting a key resets its TTL.
    async fn set(&self, key: &[&str], value: Value, ttl: Option<Duration>) -> Result<(), KvError>;

    async fn delete(&self, key: &[&str]) -> Result<(), KvError>;

    /// All live entries whose key starts with `prefix`, sorted by full key.
    async fn list(&self, prefix: &[&str]) -> Result<Vec<(String, Value)>, KvError>;
}

pub fn join_key(parts: &[&str]) -> String {
    parts.join(":")
}

struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// BTreeMap-backed store for tests and single-instance development. Range
/// scans give ordered prefix listing for free; expired entries are evicted
/// lazily on read.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &[&str]) -> Result<Option<Value>, KvError> {
        let joined = join_key(key);
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(&joined) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&joined);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &[&str], value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        let entry = MemoryEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.lock().await.insert(join_key(key), entry);
        Ok(())
    }

    async fn delete(&self, key: &[&str]) -> Result<(), KvError> {
        self.entries.lock().await.remove(&join_key(key));
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<(String, Value)>, KvError> {
        let start = format!("{}:", join_key(prefix));
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let mut expired = Vec::new();
        let mut out = Vec::new();
        for (key, entry) in entries.range(start.clone()..) {
            if !key.starts_with(&start) {
                break;
            }
            if entry.live(now) {
                out.push((key.clone(), entry.value.clone()));
            } else {
                expired.push(key.clone());
            }
        }
        for key in expired {
            entries.remove(&key);
        }
        Ok(out)
    }
}
