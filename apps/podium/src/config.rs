use std::env;

use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub kv_backend: KvBackend,
    pub redis_url: String,
    pub instance_id: String,
    pub client_ttl_seconds: u64,
    pub queue_ttl_seconds: u64,
    pub log_filter: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PODIUM_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            kv_backend: KvBackend::from_env(),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            instance_id: instance_id_from_env(),
            client_ttl_seconds: env::var("PODIUM_CLIENT_TTL_SECONDS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(600),
            queue_ttl_seconds: env::var("PODIUM_QUEUE_TTL_SECONDS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(300),
            log_filter: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        }
    }
}

/// Deployment platforms expose an instance identifier; fall back to a fresh
/// UUID so cross-instance attribution still works in ad-hoc runs.
fn instance_id_from_env() -> String {
    env::var("PODIUM_INSTANCE_ID")
        .or_else(|_| env::var("DENO_DEPLOYMENT_ID"))
        .unwrap_or_else(|_| Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvBackend {
    Redis,
    Memory,
}

impl KvBackend {
    fn from_env() -> Self {
        match env::var("PODIUM_KV_BACKEND")
            .unwrap_or_else(|_| "redis".into())
            .as_str()
        {
            "memory" => KvBackend::Memory,
            _ => KvBackend::Redis,
        }
    }
}
