/**
 * API HTTP SENSORLINK - Vue en lecture seule de l'état du collector
 *
 * RÔLE :
 * Expose les snapshots du registry et de l'historique pour les
 * collaborateurs de présentation (dashboard, scripts, debug).
 *
 * ROUTES :
 * - GET /health            : liveness du process
 * - GET /system/health     : compteurs (clients, connexions, frames invalides)
 * - GET /clients           : tous les clients, online et offline
 * - GET /clients/{id}      : un client (404 si inconnu)
 * - GET /history?limit=N   : historique des lectures, du plus ancien au plus récent
 */

use crate::health::{CollectorHealth, HealthTracker};
use crate::history::HistoryEntry;
use crate::hub::SharedHub;
use crate::models::ClientView;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub hub: SharedHub,
    pub health: HealthTracker,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/clients", get(get_clients))
        .route("/clients/{id}", get(get_client))
        .route("/history", get(get_history))
        .with_state(state)
}

/// Sert l'API jusqu'à l'annulation du token
pub async fn serve(listener: TcpListener, state: ApiState, shutdown: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("[collector] http api listening on http://{addr}");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn get_system_health(State(state): State<ApiState>) -> Json<CollectorHealth> {
    Json(state.health.get_health(&state.hub))
}

async fn get_clients(State(state): State<ApiState>) -> Json<Vec<ClientView>> {
    Json(state.hub.lock().clients())
}

async fn get_client(State(state): State<ApiState>, Path(id): Path<String>) -> Result<Json<ClientView>, StatusCode> {
    state.hub.lock().client(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn get_history(State(state): State<ApiState>, Query(params): Query<HistoryParams>) -> Json<Vec<HistoryEntry>> {
    let hub = state.hub.lock();
    let entries = match params.limit {
        Some(limit) => hub.history_tail(limit),
        None => hub.history(),
    };
    Json(entries)
}
