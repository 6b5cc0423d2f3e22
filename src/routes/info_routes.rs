use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::state::app_state::AppState;

pub fn health_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(info_check))
        .route("/stop", get(stop_process))
        .with_state(state)
}

#[derive(Serialize)]
pub struct HealthStatus {
    status: String,
    pending_records: usize,
}

async fn health_check(State(state): State<AppState>) -> Response {
    let stats = state.stats().await;
    Json(HealthStatus {
        status: "ok".to_owned(),
        pending_records: stats.pending,
    })
    .into_response()
}

pub async fn info_check() -> Response {
    match crate::utils::conf_helper::get_cached_config() {
        Some(config) => {
            debug!("{} requested", config.name);
            Json(config).into_response()
        }
        None => {
            error!("Info requested before config was loaded");
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Stops the receiver the same way a termination signal does, so the open
/// batch is flushed before exit.
async fn stop_process(State(state): State<AppState>) -> impl IntoResponse {
    info!("Stop endpoint called, shutting down");
    state.shutdown.cancel();
    StatusCode::OK
}
