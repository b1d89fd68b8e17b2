use super::{IpvsHandle, LbError};
use crate::models::{Protocol, RealServer, VirtualServer};

use async_trait::async_trait;
use std::{collections::HashMap, net::IpAddr, sync::Mutex};
#[cfg(test)]
use std::{collections::HashSet, net::SocketAddr};

type ServiceKey = (IpAddr, u16, Protocol);

fn key(vs: &VirtualServer) -> ServiceKey {
    (vs.address, vs.port, vs.protocol)
}

#[derive(Debug)]
struct Service {
    spec: VirtualServer,
    dests: Vec<RealServer>,
}

/// Kernel table kept in process memory. Used for `--dry-run`, where the agent
/// has no privileges to touch IPVS.
#[derive(Debug, Default)]
pub struct MemoryTable {
    services: Mutex<HashMap<ServiceKey, Service>>,
    #[cfg(test)]
    failing: Mutex<HashSet<SocketAddr>>,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_service<T>(
        &self,
        vs: &VirtualServer,
        f: impl FnOnce(&mut Service) -> Result<T, LbError>,
    ) -> Result<T, LbError> {
        let mut services = self.services.lock().map_err(poisoned)?;
        match services.get_mut(&key(vs)) {
            Some(service) => f(service),
            None => Err(LbError::NotFound(vs.to_string())),
        }
    }

    #[cfg(test)]
    fn check_injected(&self, rs: &RealServer) -> Result<(), LbError> {
        let failing = self.failing.lock().map_err(poisoned)?;
        if failing.contains(&rs.endpoint()) {
            return Err(LbError::rejected(format!("add real server {}", rs), "injected failure"));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_injected(&self, _rs: &RealServer) -> Result<(), LbError> {
        Ok(())
    }

    /// Makes every add/update of `endpoint` fail until cleared.
    #[cfg(test)]
    pub fn fail_real_server(&self, endpoint: SocketAddr, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(endpoint);
        } else {
            set.remove(&endpoint);
        }
    }

    #[cfg(test)]
    pub fn members(&self, vs: &VirtualServer) -> Vec<RealServer> {
        let services = self.services.lock().unwrap();
        services
            .get(&key(vs))
            .map(|s| s.dests.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn member_endpoints(&self, vs: &VirtualServer) -> HashSet<SocketAddr> {
        self.members(vs).iter().map(|rs| rs.endpoint()).collect()
    }

    #[cfg(test)]
    pub fn service(&self, vs: &VirtualServer) -> Option<VirtualServer> {
        let services = self.services.lock().unwrap();
        services.get(&key(vs)).map(|s| s.spec.clone())
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> LbError {
    LbError::rejected("memory table", "lock poisoned")
}

#[async_trait]
impl IpvsHandle for MemoryTable {
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>, LbError> {
        let services = self.services.lock().map_err(poisoned)?;
        Ok(services.get(&key(vs)).map(|s| s.spec.clone()))
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        let mut services = self.services.lock().map_err(poisoned)?;
        if services.contains_key(&key(vs)) {
            return Err(LbError::AlreadyExists(vs.to_string()));
        }
        services.insert(
            key(vs),
            Service {
                spec: vs.clone(),
                dests: Vec::new(),
            },
        );
        Ok(())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        self.with_service(vs, |service| {
            service.spec = vs.clone();
            Ok(())
        })
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError> {
        let mut services = self.services.lock().map_err(poisoned)?;
        services
            .remove(&key(vs))
            .map(|_| ())
            .ok_or_else(|| LbError::NotFound(vs.to_string()))
    }

    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, LbError> {
        self.with_service(vs, |service| Ok(service.dests.clone()))
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        self.check_injected(rs)?;
        self.with_service(vs, |service| {
            if service.dests.iter().any(|d| d.endpoint() == rs.endpoint()) {
                return Err(LbError::AlreadyExists(format!("real server {}", rs)));
            }
            service.dests.push(rs.clone());
            Ok(())
        })
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        self.check_injected(rs)?;
        self.with_service(vs, |service| {
            match service.dests.iter_mut().find(|d| d.endpoint() == rs.endpoint()) {
                Some(dest) => {
                    dest.weight = rs.weight;
                    Ok(())
                }
                None => Err(LbError::NotFound(format!("real server {}", rs))),
            }
        })
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError> {
        self.with_service(vs, |service| {
            let before = service.dests.len();
            service.dests.retain(|d| d.endpoint() != rs.endpoint());
            if service.dests.len() == before {
                return Err(LbError::NotFound(format!("real server {}", rs)));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vip() -> VirtualServer {
        VirtualServer::new("10.10.10.10:6443".parse().unwrap(), Protocol::Tcp, "rr")
    }

    fn rs(addr: &str) -> RealServer {
        RealServer::new(addr.parse().unwrap())
    }

    #[tokio::test]
    async fn test_reports_already_exists_and_not_found() {
        let table = MemoryTable::new();
        let vs = vip();

        assert!(matches!(
            table.delete_virtual_server(&vs).await,
            Err(LbError::NotFound(_))
        ));
        table.add_virtual_server(&vs).await.unwrap();
        assert!(matches!(
            table.add_virtual_server(&vs).await,
            Err(LbError::AlreadyExists(_))
        ));

        table.add_real_server(&vs, &rs("192.168.0.2:6443")).await.unwrap();
        assert!(matches!(
            table.add_real_server(&vs, &rs("192.168.0.2:6443")).await,
            Err(LbError::AlreadyExists(_))
        ));
        assert!(matches!(
            table.delete_real_server(&vs, &rs("192.168.0.3:6443")).await,
            Err(LbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_protocol_is_part_of_identity() {
        let table = MemoryTable::new();
        let tcp = vip();
        let mut udp = vip();
        udp.protocol = Protocol::Udp;

        table.add_virtual_server(&tcp).await.unwrap();
        assert!(table.get_virtual_server(&udp).await.unwrap().is_none());
        table.add_virtual_server(&udp).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_real_server_weight() {
        let table = MemoryTable::new();
        let vs = vip();
        table.add_virtual_server(&vs).await.unwrap();
        table.add_real_server(&vs, &rs("192.168.0.2:6443")).await.unwrap();

        table
            .update_real_server(&vs, &rs("192.168.0.2:6443").with_weight(0))
            .await
            .unwrap();
        assert_eq!(table.members(&vs)[0].weight, 0);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let table = MemoryTable::new();
        let vs = vip();
        table.add_virtual_server(&vs).await.unwrap();
        table.fail_real_server("192.168.0.2:6443".parse().unwrap(), true);

        let err = table
            .add_real_server(&vs, &rs("192.168.0.2:6443"))
            .await
            .unwrap_err();
        assert!(!err.is_idempotent());
        assert!(table.members(&vs).is_empty());
    }
}
