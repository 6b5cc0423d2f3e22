use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::routes::ws_handler::handle_ws_fragments;
use crate::state::app_state::AppState;
use tsdf_relay::core::format::SampleRecord;

#[derive(Serialize, Debug, Default, PartialEq, Deserialize)]
pub struct IngestSummary {
    pub records: usize,
    pub invalid: usize,
    pub batches_written: usize,
    /// Accepted samples whose batch could not be written yet; they stay
    /// pending and must not be resent.
    pub write_failures: usize,
}

/// Body of `POST /api/data`: a wrapped batch or a single sample.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum SamplesPayload {
    Batch { samples: Vec<SampleRecord> },
    Single(SampleRecord),
}

/// =======================
/// ROUTER
/// =======================

pub fn ingest_routes(state: AppState) -> Router {
    Router::new()
        .route("/fragment", post(post_fragment))
        .route("/ws/fragments", get(ws_fragments))
        .route("/api/data", post(post_samples))
        .route("/stats", get(stats))
        .with_state(state)
}

/// =======================
/// HANDLERS
/// =======================

async fn post_fragment(State(state): State<AppState>, body: Bytes) -> Response {
    debug!("Fragment received: {} bytes", body.len());

    match state.ingest_fragment(&body).await {
        Ok(report) => Json(IngestSummary {
            records: report.records,
            invalid: report.invalid,
            batches_written: report.batches.len(),
            write_failures: 0,
        })
        .into_response(),
        Err(e) => {
            error!("Fragment ingest failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ws_fragments(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_fragments(socket, state))
}

async fn post_samples(State(state): State<AppState>, Json(payload): Json<SamplesPayload>) -> Response {
    let samples = match payload {
        SamplesPayload::Batch { samples } => samples,
        SamplesPayload::Single(sample) => vec![sample],
    };
    info!("Received {} samples", samples.len());

    let mut summary = IngestSummary::default();
    for sample in samples {
        match state.ingest_record(sample).await {
            Ok(batch) => {
                summary.records += 1;
                if batch.is_some() {
                    summary.batches_written += 1;
                }
            }
            Err(e) if e.is_rejected_input() => {
                warn!("Rejected sample: {}", e);
                summary.invalid += 1;
            }
            Err(e) => {
                error!("Sample accepted but batch write failed: {}", e);
                summary.records += 1;
                summary.write_failures += 1;
            }
        }
    }

    Json(summary).into_response()
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.stats().await)
}
