use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use podium::{
    cli::{Cli, Commands},
    config::{Config, KvBackend},
    handlers,
    kv::{KvStore, MemoryKv},
    kv_redis::RedisKv,
    leadership,
    state::AppState,
    storage::Storage,
    telemetry, websocket,
};

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    telemetry::init_tracing(&config.log_filter);

    let cli = Cli::parse();
    if let Some(Commands::Debug { url, command }) = cli.command {
        if let Err(err) = podium::cli::run_debug_client(url, command).await {
            error!("debug client error: {err}");
            std::process::exit(1);
        }
        return;
    }

    info!(
        port = config.port,
        instance = %config.instance_id,
        "starting podium coordination server"
    );

    let kv: Arc<dyn KvStore> = match config.kv_backend {
        KvBackend::Redis => {
            info!(redis = %config.redis_url, "using redis kv backend");
            match RedisKv::connect(&config.redis_url).await {
                Ok(kv) => Arc::new(kv),
                Err(err) => {
                    error!("failed to connect to redis: {err}");
                    std::process::exit(1);
                }
            }
        }
        KvBackend::Memory => {
            warn!("using in-memory kv backend; cross-instance delivery is disabled");
            Arc::new(MemoryKv::new())
        }
    };

    let storage = Arc::new(Storage::new(
        kv,
        Duration::from_secs(config.client_ttl_seconds),
        Duration::from_secs(config.queue_ttl_seconds),
    ));
    let state = AppState::new(storage, config.instance_id.clone());

    let prometheus_handle = install_metrics_recorder();

    // Leadership changes written by other instances reach local synths
    // through this poller.
    tokio::spawn(leadership::run_notification_poller(state.clone()));

    let api_routes = Router::new()
        .route("/client-id", post(handlers::mint_client_id))
        .route("/client-id/:id", get(handlers::client_id_status))
        .route("/controller/status", get(handlers::controller_status))
        .route(
            "/controller/lock",
            post(handlers::lock_acquire)
                .get(handlers::lock_status)
                .delete(handlers::lock_release),
        )
        .route("/controller/clear", get(handlers::controller_clear))
        .route("/ice-servers", get(handlers::ice_servers))
        .route("/health", get(handlers::health_check))
        .route("/signal", get(websocket::signal_handler))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(prometheus_handle);

    let app = Router::new()
        .merge(api_routes)
        .merge(metrics_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("podium listening on {addr}");

    axum::serve(listener, app).await.expect("server error");
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
