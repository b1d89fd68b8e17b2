use crate::ipvs::{Balancer, CareErrors, LbError};
use crate::models::{CareConfig, HealthState};

use std::sync::Arc;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

/// Periodic reconciliation of one virtual server against backend health.
pub struct Reconciler {
    config: Arc<CareConfig>,
    balancer: Arc<Balancer>,
}

impl Reconciler {
    pub fn new(config: Arc<CareConfig>, balancer: Arc<Balancer>) -> Self {
        Self { config, balancer }
    }

    /// One pass: the virtual server first, then real server membership.
    /// Failures are collected in order; none of them stops the pass.
    pub async fn tick(&self) -> Result<(), CareErrors> {
        let mut errors = CareErrors::default();

        // members cannot be touched while the service is missing
        if let Err(e) = self.ensure_virtual_server().await {
            errors.push(e);
            return errors.into_result();
        }

        if let Err(e) = self
            .balancer
            .check_real_servers(&self.config.health_path, self.config.health_scheme)
            .await
        {
            errors.extend(e);
        }

        let snapshot = self.balancer.health_snapshot();
        let healthy = snapshot
            .iter()
            .filter(|(_, state)| *state == HealthState::Healthy)
            .count();
        debug!(
            healthy,
            total = snapshot.len(),
            errors = errors.len(),
            "Reconciled {}",
            self.config.virtual_server
        );

        errors.into_result()
    }

    async fn ensure_virtual_server(&self) -> Result<(), LbError> {
        let vs = &self.config.virtual_server;
        if self.balancer.is_virtual_server_available(vs).await {
            self.balancer.correct_drift(vs).await
        } else {
            self.balancer.create_virtual_server(vs, false).await
        }
    }

    /// Runs a tick and logs its aggregated failures.
    pub async fn pass(&self) {
        if let Err(e) = self.tick().await {
            error!("Reconciliation of {} finished with {}", self.config.virtual_server, e);
        }
    }

    /// Ticks forever at the configured interval. The first tick fires one
    /// interval from now; ticks never overlap.
    pub async fn run(&self) {
        let period = self.config.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Caring for {} every {:?} ({} real servers)",
            self.config.virtual_server,
            period,
            self.config.real_servers.len()
        );

        loop {
            ticker.tick().await;
            self.pass().await;
        }
    }
}
