pub mod auth;
pub mod cli;
pub mod config;
pub mod handlers;
pub mod ids;
pub mod kv;
pub mod kv_redis;
pub mod leadership;
pub mod messages;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod websocket;
