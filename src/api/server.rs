use std::future::Future;
use std::net::SocketAddr;

use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::info;

use super::{
    services::{
        cancel_job, connectivity, dismiss_sync_log, get_job, get_state, health, metrics, notify,
        set_identity, sync_log, visibility,
    },
    state::AppState,
};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/notify", post(notify))
        .route("/visibility", post(visibility))
        .route("/connectivity", post(connectivity))
        .route("/identity", post(set_identity))
        .route("/state", get(get_state))
        .route("/jobs/{job_id}", get(get_job))
        .route("/jobs/{job_id}/cancel", post(cancel_job))
        .route("/sync-log", get(sync_log))
        .route("/sync-log/{id}/dismiss", post(dismiss_sync_log))
        .route("/metrics", get(metrics))
        .with_state(state)
        // Push relays may gzip their bodies
        .layer(RequestDecompressionLayer::new())
}

/// Serve the control API until `shutdown` resolves
pub async fn run<F>(state: AppState, address: SocketAddr, shutdown: F) -> Result<(), AnyError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let listener = TcpListener::bind(address).await?;
    info!(%address, "Control API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
