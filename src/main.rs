use anyhow::{bail, Context};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber;

mod client;
mod models;
mod routes;
mod state;
mod utils;

use crate::client::ingest::HttpIngestClient;
use crate::models::relay_model::RelayConfig;
use crate::state::app_state::AppState;
use crate::utils::conf_helper::{bind_listener, init_config, read_patient_id, write_patient_id};
use tsdf_relay::core::aggregator::Aggregator;
use tsdf_relay::core::reassembler::Reassembler;
use tsdf_relay::core::uploader::Uploader;

const USAGE: &str = "usage: tsdf-relay <reassemble | aggregate | upload | set-patient-id <id>>";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let stage = args.first().map(String::as_str).unwrap_or_default();

    let config = init_config().await.context("CRITICAL INIT FAILURE")?;

    if stage == "set-patient-id" {
        let Some(patient_id) = args.get(1).filter(|id| !id.trim().is_empty()) else {
            bail!("{}", USAGE);
        };
        return write_patient_id(&config.patient_config, patient_id.trim()).await;
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    match stage {
        "reassemble" => run_reassembler(config, cancel).await,
        "aggregate" => run_aggregator(config, cancel).await,
        "upload" => run_uploader(config, cancel).await,
        other => bail!("unknown stage {:?}; {}", other, USAGE),
    }
}

async fn run_reassembler(config: &'static RelayConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let layout = config.paths.layout();
    layout.ensure()?;
    let reassembler = Reassembler::open(&layout, config.reassembler_settings())?;
    let state = AppState::new(reassembler, cancel.clone());

    let listener = bind_listener(config).await?;
    info!(
        "Server initialized on {}:{}",
        config.reassembler.connection.ip, config.reassembler.connection.port
    );

    let app = Router::new()
        .merge(routes::info_routes::health_routes(state.clone()))
        .merge(routes::ingest_routes::ingest_routes(state.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    if let Some(path) = state.flush().await? {
        info!("Flushed open batch to {}", path.display());
    }
    info!("Fragment receiver stopped");
    Ok(())
}

async fn run_aggregator(config: &'static RelayConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let patient_id = read_patient_id(&config.patient_config).await?;
    match &patient_id {
        Some(id) => info!("Segments will carry subject {}", id),
        None => info!("No patient file, using subject {}", config.metadata.subject_id),
    }

    let aggregator = Aggregator::open(config.paths.layout(), config.aggregator_settings(patient_id))?;
    info!("Aggregator starting at segment {}", aggregator.next_index());
    aggregator.run_loop(config.aggregator_interval(), cancel).await;
    Ok(())
}

async fn run_uploader(config: &'static RelayConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let client = HttpIngestClient::new(&config.endpoint)?;
    let uploader = Uploader::open(config.paths.layout(), config.uploader_settings(), client)?;
    info!("Uploader shipping to {}", config.endpoint.destination_url());
    uploader.run_loop(config.uploader_interval(), cancel).await;
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown requested");
    cancel.cancel();
}
