use std::collections::BTreeMap;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::{
    models::{
        AcceptedResponse, ConnectivityRequest, HealthResponse, IdentityRequest, NotifyRequest,
        StateResponse, VisibilityRequest,
    },
    state::AppState,
};
use crate::api::error::ApiError;
use crate::ledger::CreditLedger;
use crate::persist::{PersistedStore, store_prefix};
use crate::sync::TaskState;

/// Push notification endpoint (POST /notify)
///
/// The server (or a relay in front of it) calls this when something changed
/// on its side. Every polling tier runs immediately; the reply is sent
/// before the passes finish. An empty body is accepted as a bare ping.
pub async fn notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let body_bytes = read_body(body, state.max_payload_bytes).await?;
    let request: NotifyRequest = if body_bytes.is_empty() {
        NotifyRequest::default()
    } else {
        require_json(&headers)?;
        serde_json::from_slice(&body_bytes)?
    };

    info!(reason = request.reason.as_deref().unwrap_or("-"), "Push notification");
    state.context.notify();

    let response = AcceptedResponse {
        accepted: true,
        reason: request.reason,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Foreground/background report (POST /visibility)
pub async fn visibility(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let request: VisibilityRequest = read_json(&headers, body, state.max_payload_bytes).await?;
    state.context.set_foreground(request.foreground);

    Ok(Json(AcceptedResponse {
        accepted: true,
        reason: None,
    }))
}

/// Network reachability report (POST /connectivity)
///
/// Going offline pauses every tier; coming back runs them all at once.
pub async fn connectivity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let request: ConnectivityRequest = read_json(&headers, body, state.max_payload_bytes).await?;
    state.context.set_online(request.online);

    Ok(Json(AcceptedResponse {
        accepted: true,
        reason: None,
    }))
}

/// Identity change (POST /identity)
///
/// Only available when the daemon owns its identity provider. The change is
/// published on the provider and picked up by the engine's watcher, so the
/// reply may arrive before the purge/reload has run.
pub async fn set_identity(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let provider = state
        .identity
        .as_ref()
        .ok_or_else(|| ApiError::Conflict("identity is managed by the host".to_string()))?;
    let request: IdentityRequest = read_json(&headers, body, state.max_payload_bytes).await?;

    match request.identity.filter(|id| !id.is_empty()) {
        Some(identity) => provider.sign_in(identity),
        None => provider.sign_out(),
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            accepted: true,
            reason: None,
        }),
    ))
}

/// Snapshot of what the user sees (GET /state)
pub async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    let context = &state.context;
    let credits = context.credit_snapshot().await;
    let active_jobs = context.active_jobs().await;

    let response = StateResponse {
        identity: context.current_identity().await,
        balance: credits.balance,
        pending_deductions: credits.pending_deductions,
        last_server_sync: credits.last_server_sync,
        any_active: !active_jobs.is_empty(),
        active_jobs,
        online: context.is_online(),
        foreground: context.is_foreground(),
        polling: context.poll_states().await,
    };

    Json(response)
}

/// Single job record (GET /jobs/{job_id})
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .context
        .job(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("job {job_id}")))?;

    Ok(Json(job))
}

/// Cancel a job and refund what it was charged (POST /jobs/{job_id}/cancel)
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.context.cancel_job(&job_id).await?;
    Ok(Json(job))
}

/// Undismissed sync errors, oldest first (GET /sync-log)
pub async fn sync_log(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.context.sync_log().visible())
}

/// POST /sync-log/{id}/dismiss
pub async fn dismiss_sync_log(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.context.sync_log().dismiss(id) {
        return Err(ApiError::NotFound(format!("sync log entry {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.context.metrics())
}

/// Health check endpoint (GET /health)
///
/// Reports local components plus the result of the last remote health poll:
/// - api: this HTTP server
/// - store: the key-value backend answers a prefix scan
/// - polling: whether the poll tasks are scheduled (idle between ticks counts)
/// - remote: last coarse server status, `unknown` before the first poll
///
/// Returns 503 Service Unavailable if a local component is unhealthy. A
/// degraded remote is reported but does not fail the check.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let context = &state.context;
    let mut components = BTreeMap::new();

    components.insert("api".to_string(), "healthy".to_string());

    let probe = store_prefix(CreditLedger::STORE_NAME);
    let store = match context.gateway().kv().keys_with_prefix(&probe) {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    components.insert("store".to_string(), store.to_string());

    let polling = context.poll_states().await;
    let running = polling
        .values()
        .any(|state| *state != TaskState::Stopped);
    components.insert(
        "polling".to_string(),
        if running { "running" } else { "stopped" }.to_string(),
    );

    let remote = context.health().await;
    let remote_status = match &remote {
        Some(report) if report.status.is_healthy() => "healthy",
        Some(_) => "degraded",
        None => "unknown",
    };
    components.insert("remote".to_string(), remote_status.to_string());

    let all_healthy = components.values().all(|status| status != "unhealthy");
    let (overall_status, status_code) = if all_healthy {
        ("healthy", StatusCode::OK)
    } else {
        ("unhealthy", StatusCode::SERVICE_UNAVAILABLE)
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        remote,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;

    super::utils::ensure_json(content_type)
}

async fn read_json<T: DeserializeOwned>(
    headers: &HeaderMap,
    body: Body,
    max_size: usize,
) -> Result<T, ApiError> {
    require_json(headers)?;
    let body_bytes = read_body(body, max_size).await?;
    Ok(serde_json::from_slice(&body_bytes)?)
}

/// Reads request body and validates size
///
/// Decompression is handled by `RequestDecompressionLayer`, so the limit
/// applies to the decoded payload.
async fn read_body(body: Body, max_size: usize) -> Result<Bytes, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes();

    super::utils::validate_body_size(&data, max_size)?;
    debug!(size = data.len(), "Request body read");

    Ok(data)
}
