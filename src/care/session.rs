use super::{HttpProber, Prober, Reconciler};
use crate::ipvs::{Balancer, IpvsHandle};
use crate::models::CareConfig;

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

/// Entry point of a run: optional cleanup, one immediate pass, then either
/// exit or the periodic loop.
pub struct SessionController {
    config: Arc<CareConfig>,
    balancer: Arc<Balancer>,
    reconciler: Reconciler,
}

impl SessionController {
    pub fn new(config: CareConfig, handle: Arc<dyn IpvsHandle>) -> Result<Self> {
        let prober = HttpProber::new(config.probe_timeout)?;
        Ok(Self::with_prober(config, handle, Arc::new(prober)))
    }

    pub fn with_prober(config: CareConfig, handle: Arc<dyn IpvsHandle>, prober: Arc<dyn Prober>) -> Self {
        let config = Arc::new(config);
        let balancer = Arc::new(Balancer::new(handle, prober, &config));
        let reconciler = Reconciler::new(config.clone(), balancer.clone());

        Self {
            config,
            balancer,
            reconciler,
        }
    }

    pub async fn run(&self) -> Result<()> {
        if self.config.cleanup_before_start {
            self.cleanup().await;
        }

        self.reconciler.pass().await;
        info!(
            "Initial pass applied to {} with {} real servers",
            self.config.virtual_server,
            self.config.real_servers.len()
        );

        if self.config.run_once {
            return Ok(());
        }

        tokio::select! {
            _ = self.reconciler.run() => Ok(()),
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
                Ok(())
            }
        }
    }

    /// Best effort: a leftover service from a crashed run is removed, a
    /// missing one is fine, anything else is only logged.
    async fn cleanup(&self) {
        let vs = &self.config.virtual_server;
        if let Err(e) = self.balancer.delete_virtual_server(vs, false).await {
            warn!("Failed to clean up virtual server {}: {}", vs, e);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
