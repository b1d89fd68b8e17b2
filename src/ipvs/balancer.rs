use super::{CareErrors, IpvsHandle, LbError, retry};
use crate::care::Prober;
use crate::models::{CareConfig, HealthScheme, HealthState, RealServer, VirtualServer};

use futures_util::future::join_all;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, sync::Mutex, time::Duration};
use tracing::{debug, info, warn};

const CREATE_ATTEMPTS: u32 = 3;
const CREATE_DELAY: Duration = Duration::from_millis(100);
const REPAIR_ATTEMPTS: u32 = 2;
const REPAIR_DELAY: Duration = Duration::from_millis(50);

/// The kernel load-balancer capabilities the care loop relies on, for one
/// virtual server and its configured real servers.
pub struct Balancer {
    handle: Arc<dyn IpvsHandle>,
    prober: Arc<dyn Prober>,
    virtual_server: VirtualServer,
    real_servers: Vec<RealServer>,
    graceful_drain: bool,
    health: Mutex<HashMap<SocketAddr, HealthState>>,
}

impl Balancer {
    pub fn new(handle: Arc<dyn IpvsHandle>, prober: Arc<dyn Prober>, config: &CareConfig) -> Self {
        Self {
            handle,
            prober,
            virtual_server: config.virtual_server.clone(),
            real_servers: config.real_servers.clone(),
            graceful_drain: config.graceful_drain,
            health: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create_virtual_server(
        &self,
        vs: &VirtualServer,
        fail_if_exists: bool,
    ) -> Result<(), LbError> {
        let handle = &self.handle;
        match retry(CREATE_ATTEMPTS, CREATE_DELAY, move || handle.add_virtual_server(vs)).await {
            Ok(()) => {
                info!("Created virtual server {} ({})", vs, vs.scheduler);
                Ok(())
            }
            Err(LbError::AlreadyExists(_)) if !fail_if_exists => {
                debug!("Virtual server {} already exists", vs);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn delete_virtual_server(
        &self,
        vs: &VirtualServer,
        fail_if_missing: bool,
    ) -> Result<(), LbError> {
        match self.handle.delete_virtual_server(vs).await {
            Ok(()) => {
                info!("Deleted virtual server {}", vs);
                Ok(())
            }
            Err(LbError::NotFound(_)) if !fail_if_missing => {
                debug!("Virtual server {} was not present", vs);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn is_virtual_server_available(&self, vs: &VirtualServer) -> bool {
        match self.handle.get_virtual_server(vs).await {
            Ok(applied) => applied.is_some(),
            Err(e) => {
                warn!("Failed to query virtual server {}: {}", vs, e);
                false
            }
        }
    }

    /// Brings an existing service back to the desired scheduler and
    /// persistence settings without deleting it.
    pub async fn correct_drift(&self, vs: &VirtualServer) -> Result<(), LbError> {
        let Some(applied) = self.handle.get_virtual_server(vs).await? else {
            return self.create_virtual_server(vs, false).await;
        };
        if !vs.drifted_from(&applied) {
            return Ok(());
        }

        warn!(
            "Virtual server {} changed ({} -> {}), updating",
            vs,
            applied.settings(),
            vs.settings()
        );
        let handle = &self.handle;
        retry(CREATE_ATTEMPTS, CREATE_DELAY, move || handle.update_virtual_server(vs)).await
    }

    pub async fn create_real_server(&self, rs: &RealServer, fail_if_exists: bool) -> Result<(), LbError> {
        let handle = &self.handle;
        let vs = &self.virtual_server;
        match retry(CREATE_ATTEMPTS, CREATE_DELAY, move || handle.add_real_server(vs, rs)).await {
            Ok(()) => {
                info!("Added real server {} to {}", rs, vs);
                Ok(())
            }
            Err(LbError::AlreadyExists(_)) if !fail_if_exists => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Probes every configured real server and corrects kernel membership:
    /// healthy servers are added (or restored to their weight), unhealthy
    /// ones are drained or removed. Configuration is never forgotten.
    pub async fn check_real_servers(
        &self,
        health_path: &str,
        health_scheme: HealthScheme,
    ) -> Result<(), CareErrors> {
        let probes = self.real_servers.iter().map(|rs| async move {
            let state = match self.prober.probe(rs.endpoint(), health_path, health_scheme).await {
                Ok(()) => HealthState::Healthy,
                Err(e) => {
                    debug!(real_server = %rs, "Probe failed: {:#}", e);
                    HealthState::Unhealthy
                }
            };
            (rs, state)
        });
        let results = join_all(probes).await;
        self.record_health(&results);

        let mut errors = CareErrors::default();
        let members = match self.handle.list_real_servers(&self.virtual_server).await {
            Ok(members) => members,
            Err(e) => {
                errors.push(e);
                return errors.into_result();
            }
        };

        for (rs, state) in results {
            let member = members.iter().find(|m| m.endpoint() == rs.endpoint());
            if let Err(e) = self.repair(rs, state, member).await {
                errors.push(e);
            }
        }
        errors.into_result()
    }

    async fn repair(
        &self,
        rs: &RealServer,
        state: HealthState,
        member: Option<&RealServer>,
    ) -> Result<(), LbError> {
        let handle = &self.handle;
        let vs = &self.virtual_server;

        match (state, member) {
            (HealthState::Healthy, None) => self.create_real_server(rs, false).await,
            (HealthState::Healthy, Some(applied)) if applied.weight != rs.weight => {
                info!("Restoring weight of {} to {}", rs, rs.weight);
                retry(REPAIR_ATTEMPTS, REPAIR_DELAY, move || handle.update_real_server(vs, rs)).await
            }
            (HealthState::Unhealthy, Some(applied)) if self.graceful_drain && applied.weight != 0 => {
                info!("Draining real server {} (weight 0)", rs);
                let drained = applied.clone().with_weight(0);
                let target = &drained;
                retry(REPAIR_ATTEMPTS, REPAIR_DELAY, move || handle.update_real_server(vs, target)).await
            }
            (HealthState::Unhealthy, Some(applied)) => {
                info!("Removing real server {} from {}", rs, vs);
                match retry(REPAIR_ATTEMPTS, REPAIR_DELAY, move || handle.delete_real_server(vs, applied)).await {
                    Err(LbError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            _ => Ok(()),
        }
    }

    fn record_health(&self, results: &[(&RealServer, HealthState)]) {
        let mut health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        for (rs, state) in results {
            let previous = health.insert(rs.endpoint(), *state).unwrap_or_default();
            match (previous, *state) {
                (HealthState::Unhealthy, HealthState::Healthy) => info!("Real server {} recovered", rs),
                (HealthState::Unknown, HealthState::Healthy) => info!("Real server {} is healthy", rs),
                (prev, HealthState::Unhealthy) if prev != HealthState::Unhealthy => {
                    warn!("Real server {} is unhealthy", rs)
                }
                _ => debug!("Real server {} is still {}", rs, state),
            }
        }
    }

    /// Last observed state of every configured real server, in configuration
    /// order.
    pub fn health_snapshot(&self) -> Vec<(SocketAddr, HealthState)> {
        let health = self.health.lock().unwrap_or_else(|e| e.into_inner());
        self.real_servers
            .iter()
            .map(|rs| {
                let endpoint = rs.endpoint();
                (endpoint, health.get(&endpoint).copied().unwrap_or_default())
            })
            .collect()
    }
}
