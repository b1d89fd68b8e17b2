use crate::models::HealthScheme;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::{net::SocketAddr, time::Duration};
use tracing::debug;
use url::Url;

/// Answers "is this endpoint reachable right now?" for a single backend.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: SocketAddr, path: &str, scheme: HealthScheme) -> Result<()>;
}

/// Liveness probe over HTTP(S). Any response counts, whatever its status;
/// only connection-level failures mark the backend down.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        // control-plane endpoints usually serve self-signed certificates
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .danger_accept_invalid_certs(true)
            .no_proxy()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, target: SocketAddr, path: &str, scheme: HealthScheme) -> Result<()> {
        let url = probe_url(scheme, target, path)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        debug!(status = %response.status(), "Probe {} answered", url);
        Ok(())
    }
}

pub fn probe_url(scheme: HealthScheme, target: SocketAddr, path: &str) -> Result<Url> {
    Url::parse(&format!("{}://{}{}", scheme, target, path))
        .with_context(|| format!("Invalid probe URL for {}", target))
}
