use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::models::relay_model::Endpoint;
use tsdf_relay::core::error::{RelayError, Result};
use tsdf_relay::core::uploader::{Destination, IngestClient};

#[derive(Serialize)]
struct DestinationRequest<'a> {
    client_id: &'a str,
}

#[derive(Deserialize)]
struct DestinationResponse {
    url: Option<String>,
    key: Option<String>,
}

/// Ingestion service reached over HTTP: destinations are requested with a
/// JSON POST and archives are PUT to the returned URL.
pub struct HttpIngestClient {
    client: Client,
    destination_url: String,
}

impl HttpIngestClient {
    pub fn new(endpoint: &Endpoint) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(endpoint.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            destination_url: endpoint.destination_url(),
        })
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    async fn request_destination(&self, client_id: &str) -> Result<Option<Destination>> {
        debug!("Requesting upload destination from {}", self.destination_url);

        let resp = self
            .client
            .post(&self.destination_url)
            .json(&DestinationRequest { client_id })
            .send()
            .await
            .map_err(|e| RelayError::Remote(format!("HTTP Error: {}", e)))?;

        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| RelayError::Remote(format!("Server returned error: {}", e)))?;

        let body: DestinationResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Remote(format!("Bad destination response: {}", e)))?;

        Ok(match body.url {
            Some(url) if !url.is_empty() => Some(Destination {
                key: body.key.unwrap_or_else(|| url.clone()),
                handle: url,
            }),
            _ => None,
        })
    }

    async fn write_archive(&self, destination: &Destination, bytes: &[u8]) -> Result<()> {
        let resp = self
            .client
            .put(&destination.handle)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| RelayError::Remote(format!("HTTP Error: {}", e)))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(RelayError::Remote(format!("Upload rejected: {}", resp.status())))
        }
    }
}
