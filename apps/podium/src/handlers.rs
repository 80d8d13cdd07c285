use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::error;

use crate::auth;
use crate::ids::{self, ClientKind};
use crate::leadership;
use crate::state::AppState;
use crate::storage::now_ms;

/// Error responses carry a status and a small JSON body; the taxonomy is
/// 401 unauthorized, 400 validation, 404 not found, 500 KV transient.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn internal(err: anyhow::Error) -> Self {
        error!(%err, "request failed on kv access");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct MintClientIdRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MintClientIdResponse {
    pub success: bool,
    pub client_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

/// POST /client-id - mint a fresh client id for the requested role.
pub async fn mint_client_id(
    State(state): State<AppState>,
    Json(payload): Json<MintClientIdRequest>,
) -> Result<Json<MintClientIdResponse>, ApiError> {
    let Some(kind) = ClientKind::parse(&payload.kind) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("unknown client type: {}", payload.kind),
        ));
    };

    let client_id = ids::mint_client_id(kind);
    state
        .storage
        .reserve_client_id(&client_id)
        .await
        .map_err(ApiError::internal)?;
    counter!("podium_client_ids_minted_total", 1, "type" => kind.as_str());

    Ok(Json(MintClientIdResponse {
        success: true,
        client_id,
        kind: kind.as_str(),
    }))
}

/// GET /client-id/:id - whether an id is known (minted or registered).
pub async fn client_id_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let exists = state
        .storage
        .client_id_exists(&id)
        .await
        .map_err(ApiError::internal)?;
    if exists {
        Ok(Json(json!({ "exists": true })).into_response())
    } else {
        Ok((StatusCode::NOT_FOUND, Json(json!({ "exists": false }))).into_response())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatusResponse {
    pub active_controller: Option<String>,
    pub timestamp: Option<u64>,
    pub timeout_ms: u64,
}

/// GET /controller/status - current leader, unauthenticated.
pub async fn controller_status(
    State(state): State<AppState>,
) -> Result<Json<ControllerStatusResponse>, ApiError> {
    let record = leadership::get_active(&state)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(ControllerStatusResponse {
        active_controller: record.as_ref().map(|r| r.id.clone()),
        timestamp: record.map(|r| r.timestamp),
        timeout_ms: leadership::HEARTBEAT_TIMEOUT_MS,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub controller_id: String,
    #[serde(default)]
    pub heartbeat: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub is_active: bool,
    pub active_controller: Option<String>,
    pub changed: bool,
    pub timeout_ms: u64,
}

/// POST /controller/lock - acquire or heartbeat the controller lock. On
/// heartbeat only the current leader is refreshed; everyone else learns the
/// leader from `activeController`.
pub async fn lock_acquire(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LockRequest>,
) -> Result<Json<LockResponse>, ApiError> {
    if auth::session_from_headers(&state.storage, &headers)
        .await
        .is_none()
    {
        return Err(ApiError::unauthorized());
    }

    let controller_id = ids::normalize_controller_id(&payload.controller_id);
    let outcome = leadership::set_active(&state, &controller_id, payload.heartbeat)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(LockResponse {
        is_active: outcome.active.as_deref() == Some(controller_id.as_str()),
        active_controller: outcome.active,
        changed: outcome.changed,
        timeout_ms: leadership::HEARTBEAT_TIMEOUT_MS,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LockStatusQuery {
    pub health: Option<String>,
}

/// GET /controller/lock - lock status for the caller, or a consistency
/// report with `?health=check`.
pub async fn lock_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LockStatusQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.health.as_deref() == Some("check") {
        return lock_health_report(&state).await;
    }

    let record = leadership::get_active(&state)
        .await
        .map_err(ApiError::internal)?;
    let session = auth::session_from_headers(&state.storage, &headers).await;
    let active = record.as_ref().map(|r| r.id.clone());
    let is_owner = match (&session, &active) {
        (Some(session), Some(active)) => {
            ids::normalize_controller_id(&session.controller_id) == *active
        }
        _ => false,
    };
    let remaining = record
        .as_ref()
        .map(|r| leadership::remaining_ms(r, now_ms()))
        .unwrap_or(0);

    Ok(Json(json!({
        "locked": active.is_some(),
        "isOwner": is_owner,
        "activeController": active,
        "remainingTimeMs": remaining,
    })))
}

/// Compares the raw leadership record with the latest change notification:
/// the two converge within a poll interval when the system is healthy.
async fn lock_health_report(state: &AppState) -> Result<Json<Value>, ApiError> {
    let now = now_ms();
    let record = state
        .storage
        .get_controller_record()
        .await
        .map_err(ApiError::internal)?;
    let notification = state
        .storage
        .get_change_notification()
        .await
        .map_err(ApiError::internal)?;

    let live = record
        .as_ref()
        .filter(|r| !leadership::is_expired(r, now))
        .map(|r| r.id.clone());
    let notified = notification.as_ref().and_then(|n| n.controller_id.clone());
    let expired = record
        .as_ref()
        .map(|r| leadership::is_expired(r, now))
        .unwrap_or(false);

    Ok(Json(json!({
        "healthy": live == notified || expired,
        "activeController": live,
        "recordExpired": expired,
        "notifiedController": notified,
        "notificationAgeMs": notification.map(|n| now.saturating_sub(n.timestamp)),
        "checkedAt": now,
    })))
}

/// DELETE /controller/lock - release, permitted only to the current leader.
pub async fn lock_release(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let Some(session) = auth::session_from_headers(&state.storage, &headers).await else {
        return Err(ApiError::unauthorized());
    };

    let controller_id = ids::normalize_controller_id(&session.controller_id);
    let released = leadership::clear(&state, &controller_id)
        .await
        .map_err(ApiError::internal)?;
    let active = leadership::get_active(&state)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(json!({
        "released": released,
        "activeController": active.map(|r| r.id),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ClearQuery {
    pub admin_mode: Option<String>,
}

/// GET /controller/clear?admin_mode=true - administrative leadership reset.
pub async fn controller_clear(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> Result<Json<Value>, ApiError> {
    if query.admin_mode.as_deref() != Some("true") {
        return Err(ApiError::unauthorized());
    }
    leadership::force_reset(&state)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(json!({ "success": true })))
}

/// GET /ice-servers - STUN/TURN configuration for WebRTC peers. Reads
/// `PODIUM_ICE_SERVERS` (a JSON array) with a static STUN fallback.
pub async fn ice_servers() -> Json<Value> {
    Json(json!({ "iceServers": configured_ice_servers() }))
}

fn configured_ice_servers() -> Vec<Value> {
    if let Ok(raw) = std::env::var("PODIUM_ICE_SERVERS") {
        if let Ok(servers) = serde_json::from_str::<Vec<Value>>(&raw) {
            if !servers.is_empty() {
                return servers;
            }
        }
        error!("PODIUM_ICE_SERVERS is set but not a JSON array; using STUN fallback");
    }
    vec![json!({ "urls": "stun:stun.l.google.com:19302" })]
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "instanceId": state.instance_id }))
}

/// GET /metrics - Prometheus scrape endpoint.
pub async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_ice_servers_point_at_stun() {
        let servers = configured_ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0]["urls"]
            .as_str()
            .unwrap()
            .starts_with("stun:"));
    }

    #[test]
    fn api_errors_render_status_and_body() {
        let response = ApiError::unauthorized().into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = ApiError::new(StatusCode::BAD_REQUEST, "unknown client type").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
