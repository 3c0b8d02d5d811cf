/*!
 * HTTP firmware download for MeshFlow.
 *
 * Files are fetched from `<base_url>/<filename>` and written to a temporary
 * file next to the destination, which is renamed into place only once the
 * whole body has arrived, so a partial download never looks like a file
 * that is already present.
 */
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use meshflow_core::config::FirmwareConfig;

use crate::error::{DriverError, Result};
use crate::protocol::FirmwareFetcher;

/// Downloads firmware files over HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpFirmwareFetcher {
    http: reqwest::Client,
    base_url: String,
}

impl HttpFirmwareFetcher {
    /// Create a fetcher with a default client
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .user_agent(concat!("meshflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DriverError::download(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http, base_url))
    }

    /// Create a fetcher with a pre-built `reqwest::Client`
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    /// Create a fetcher for the configured firmware server
    pub fn from_config(config: &FirmwareConfig) -> Result<Self> {
        Self::new(config.base_url.clone())
    }

    /// URL a file is fetched from
    pub fn url_for(&self, filename: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), filename)
    }
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

#[async_trait]
impl FirmwareFetcher for HttpFirmwareFetcher {
    async fn fetch(&self, filename: &str, destination: &Path) -> anyhow::Result<()> {
        let url = self.url_for(filename);
        debug!("GET {}", url);

        let body = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("{} returned an error status", url))?
            .bytes()
            .await
            .with_context(|| format!("failed to read body of {}", url))?;

        let partial = partial_path(destination);
        tokio::fs::write(&partial, &body)
            .await
            .with_context(|| format!("failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, destination)
            .await
            .with_context(|| format!("failed to move {} into place", partial.display()))?;

        debug!("Wrote {} bytes to {}", body.len(), destination.display());
        Ok(())
    }
}
