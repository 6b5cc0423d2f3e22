use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::fs;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::models::relay_model::{PatientConfig, RelayConfig};

static CONFIG_CACHE: OnceLock<RelayConfig> = OnceLock::new();

pub const CONFIG_ENV: &str = "TSDF_RELAY_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "relay.json";

pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Reads the settings file; a missing file means all defaults.
pub async fn load_config(path: &Path) -> Result<RelayConfig> {
    match fs::read_to_string(path).await {
        Ok(data) => serde_json::from_str(&data)
            .with_context(|| format!("JSON parse error in {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No config at {}, using defaults", path.display());
            Ok(RelayConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("File read error: {}", path.display())),
    }
}

/// Loads the configuration once for the lifetime of the process.
pub async fn init_config() -> Result<&'static RelayConfig> {
    let path = config_path();
    let config = load_config(&path).await?;

    CONFIG_CACHE
        .set(config)
        .map_err(|_| anyhow::anyhow!("Config already initialized"))?;

    info!("Config initialized from {}", path.display());
    get_cached_config().context("Config not initialized")
}

pub fn get_cached_config() -> Option<&'static RelayConfig> {
    CONFIG_CACHE.get()
}

pub async fn bind_listener(config: &RelayConfig) -> Result<TcpListener> {
    let bind_addr = format!(
        "{}:{}",
        config.reassembler.connection.ip, config.reassembler.connection.port
    );

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Bind failed: {}", bind_addr))?;

    let actual_port = listener.local_addr().context("Addr error")?.port();
    info!("Fragment receiver bound on port {}", actual_port);

    Ok(listener)
}

pub async fn read_patient_id(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(data) => {
            let patient: PatientConfig = serde_json::from_str(&data)
                .with_context(|| format!("JSON parse error in {}", path.display()))?;
            Ok(Some(patient.patient_id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("File read error: {}", path.display())),
    }
}

pub async fn write_patient_id(path: &Path, patient_id: &str) -> Result<()> {
    let patient = PatientConfig {
        patient_id: patient_id.to_string(),
    };
    let data = serde_json::to_vec(&patient)?;
    tsdf_relay::core::queue::write_atomic(path, &data)
        .with_context(|| format!("Cannot write {}", path.display()))?;
    info!("Patient ID updated to: {}", patient_id);
    Ok(())
}
