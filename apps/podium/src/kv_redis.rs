use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde_json::Value;
use tracing::warn;

use crate::kv::{join_key, KvError, KvStore};

/// Redis-backed store shared by all server instances. Values are JSON
/// strings; TTLs map to SETEX/EXPIRE. SCAN order is unspecified, so prefix
/// listings are sorted client-side.
#[derive(Clone)]
pub struct RedisKv {
    redis: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(to_kv_err)?;
        let redis = ConnectionManager::new(client).await.map_err(to_kv_err)?;
        Ok(Self { redis })
    }
}

fn to_kv_err(err: redis::RedisError) -> KvError {
    KvError::Backend(err.to_string())
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &[&str]) -> Result<Option<Value>, KvError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(join_key(key)).await.map_err(to_kv_err)?;
        match raw {
            Some(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    warn!(key = %join_key(key), %err, "discarding unparseable kv entry");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &[&str], value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.redis.clone();
        let joined = join_key(key);
        let json = value.to_string();
        match ttl {
            Some(ttl) => {
                let secs = ttl.as_secs().max(1);
                conn.set_ex::<_, _, ()>(joined, json, secs)
                    .await
                    .map_err(to_kv_err)?;
            }
            None => {
                conn.set::<_, _, ()>(joined, json).await.map_err(to_kv_err)?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &[&str]) -> Result<(), KvError> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(join_key(key)).await.map_err(to_kv_err)?;
        Ok(())
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<(String, Value)>, KvError> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", join_key(prefix));
        let mut cursor: u64 = 0;
        let mut out = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await
                .map_err(to_kv_err)?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(to_kv_err)?;
                for (key, raw) in keys.into_iter().zip(values) {
                    let Some(json) = raw else { continue };
                    match serde_json::from_str(&json) {
                        Ok(value) => out.push((key, value)),
                        Err(err) => {
                            warn!(%key, %err, "skipping unparseable kv entry in listing")
                        }
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}
