// ============================================================================
// Configuration and CLI
// ============================================================================

use crate::care::prober::probe_url;
use crate::models::{CareConfig, HealthScheme, Protocol, RealServer, VirtualServer};

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{collections::HashSet, net::SocketAddr, time::Duration};
use tracing::warn;

/// Largest weight the kernel accepts for a destination.
const MAX_WEIGHT: u32 = u16::MAX as u32;

#[derive(Parser, Debug)]
#[command(name = "vipcare", about = "Keeps a local IPVS virtual server in sync with healthy backends")]
pub struct Config {
    /// Virtual server address, e.g. 10.10.10.10:6443
    #[arg(long = "vs", env = "VIRTUAL_SERVER")]
    virtual_server: String,

    /// Real server addresses; repeat the flag or pass a comma-separated list
    #[arg(long = "rs", env = "REAL_SERVERS", value_delimiter = ',')]
    real_servers: Vec<String>,

    /// Path requested by the health probe
    #[arg(long, env = "HEALTH_PATH", default_value = "/healthz")]
    health_path: String,

    /// Scheme used by the health probe
    #[arg(
        long = "health-schem",
        alias = "health-scheme",
        env = "HEALTH_SCHEME",
        value_enum,
        default_value = "https"
    )]
    health_scheme: HealthScheme,

    /// Reconciliation interval (seconds)
    #[arg(long, env = "CARE_INTERVAL", default_value = "5")]
    interval: u64,

    /// Timeout of a single health probe (seconds)
    #[arg(long, env = "PROBE_TIMEOUT", default_value = "3")]
    probe_timeout: u64,

    /// IPVS scheduler: rr, wrr, lc, wlc, sh, dh, etc.
    #[arg(long, env = "IPVS_SCHEDULER", default_value = "rr")]
    scheduler: String,

    /// Virtual server protocol
    #[arg(long, env = "IPVS_PROTOCOL", value_enum, default_value = "tcp")]
    protocol: Protocol,

    /// Make the virtual server persistent with this timeout (seconds)
    #[arg(long, env = "PERSISTENCE_TIMEOUT")]
    persistence_timeout: Option<u32>,

    /// Weight given to every real server
    #[arg(long, env = "REAL_SERVER_WEIGHT", default_value = "1")]
    weight: u32,

    /// Apply the configuration once and exit
    #[arg(long, env = "RUN_ONCE")]
    run_once: bool,

    /// Delete the virtual server left by a previous run before starting
    #[arg(long = "clean", env = "CLEAN_BEFORE_START")]
    cleanup_before_start: bool,

    /// Drop unhealthy members to weight 0 before removing them
    #[arg(long, env = "GRACEFUL_DRAIN")]
    graceful_drain: bool,

    /// Keep the table in memory instead of programming the kernel
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Path to the ipvsadm binary
    #[arg(long = "ipvsadm", env = "IPVSADM_PATH", default_value = "ipvsadm")]
    pub ipvsadm: String,
}

impl Config {
    /// Validates the flags and freezes them into the run's desired state.
    /// Nothing here touches the kernel table.
    pub fn care_config(&self) -> Result<CareConfig> {
        let vs_endpoint = parse_endpoint(&self.virtual_server)
            .with_context(|| format!("Invalid virtual server '{}'", self.virtual_server))?;

        if self.real_servers.is_empty() {
            bail!("No real servers specified");
        }

        if self.weight > MAX_WEIGHT {
            bail!("Weight {} is out of range (0..={})", self.weight, MAX_WEIGHT);
        }

        let mut seen = HashSet::new();
        let mut real_servers = Vec::with_capacity(self.real_servers.len());
        for raw in &self.real_servers {
            let endpoint = parse_endpoint(raw)
                .with_context(|| format!("Invalid real server '{}'", raw))?;
            if endpoint.is_ipv4() != vs_endpoint.is_ipv4() {
                bail!(
                    "Real server {} and virtual server {} use different address families",
                    endpoint,
                    vs_endpoint
                );
            }
            if !seen.insert(endpoint) {
                warn!("Ignoring duplicate real server {}", endpoint);
                continue;
            }
            real_servers.push(RealServer::new(endpoint).with_weight(self.weight));
        }

        if self.scheduler.trim().is_empty() {
            bail!("Scheduler must not be empty");
        }
        if self.interval == 0 {
            bail!("Interval must be greater than zero");
        }
        if self.probe_timeout == 0 {
            bail!("Probe timeout must be greater than zero");
        }
        if self.persistence_timeout == Some(0) {
            bail!("Persistence timeout must be greater than zero");
        }

        let health_path = normalize_health_path(&self.health_path);
        probe_url(self.health_scheme, real_servers[0].endpoint(), &health_path)
            .with_context(|| format!("Invalid health path '{}'", self.health_path))?;

        let mut virtual_server =
            VirtualServer::new(vs_endpoint, self.protocol, self.scheduler.trim());
        if let Some(timeout) = self.persistence_timeout {
            virtual_server = virtual_server.with_persistence(timeout);
        }

        Ok(CareConfig {
            virtual_server,
            real_servers,
            health_path,
            health_scheme: self.health_scheme,
            interval: Duration::from_secs(self.interval),
            probe_timeout: Duration::from_secs(self.probe_timeout),
            run_once: self.run_once,
            cleanup_before_start: self.cleanup_before_start,
            graceful_drain: self.graceful_drain,
        })
    }
}

/// Parses an `ip:port` literal. Hostnames are rejected since the kernel
/// table only holds addresses.
fn parse_endpoint(raw: &str) -> Result<SocketAddr> {
    raw.trim()
        .parse::<SocketAddr>()
        .with_context(|| format!("'{}' is not an ip:port pair", raw.trim()))
}

fn normalize_health_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CareConfig> {
        let mut argv = vec!["vipcare"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv)?.care_config()
    }

    #[test]
    fn test_scenario_flags() {
        let config = parse(&[
            "--vs",
            "10.10.10.10:6443",
            "--rs",
            "192.168.0.2:6443",
            "--rs",
            "192.168.0.4:6443",
            "--rs",
            "192.168.0.3:6443",
            "--health-path",
            "/healthz",
            "--health-schem",
            "https",
            "--run-once",
        ])
        .unwrap();

        assert_eq!(config.virtual_server.to_string(), "TCP 10.10.10.10:6443");
        assert_eq!(config.virtual_server.scheduler, "rr");
        assert_eq!(config.real_servers.len(), 3);
        assert_eq!(config.real_servers[1].to_string(), "192.168.0.4:6443");
        assert_eq!(config.health_scheme, HealthScheme::Https);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(config.run_once);
        assert!(!config.cleanup_before_start);
    }

    #[test]
    fn test_comma_separated_real_servers_and_alias() {
        let config = parse(&[
            "--vs",
            "10.10.10.10:6443",
            "--rs",
            "192.168.0.2:6443,192.168.0.3:6443",
            "--health-scheme",
            "http",
            "--health-path",
            "livez",
        ])
        .unwrap();

        assert_eq!(config.real_servers.len(), 2);
        assert_eq!(config.health_scheme, HealthScheme::Http);
        assert_eq!(config.health_path, "/livez");
    }

    #[test]
    fn test_missing_port_is_fatal() {
        let err = parse(&["--vs", "10.10.10.10", "--rs", "192.168.0.2:6443"]).unwrap_err();
        assert!(err.to_string().contains("Invalid virtual server"));
    }

    #[test]
    fn test_hostname_is_rejected() {
        let err = parse(&["--vs", "10.10.10.10:6443", "--rs", "master0:6443"]).unwrap_err();
        assert!(err.to_string().contains("Invalid real server 'master0:6443'"));
    }

    #[test]
    fn test_requires_real_servers() {
        let err = parse(&["--vs", "10.10.10.10:6443"]).unwrap_err();
        assert!(err.to_string().contains("No real servers"));
    }

    #[test]
    fn test_rejects_mixed_address_families() {
        let err = parse(&["--vs", "10.10.10.10:6443", "--rs", "[fd00::2]:6443"]).unwrap_err();
        assert!(err.to_string().contains("different address families"));
    }

    #[test]
    fn test_duplicates_are_collapsed() {
        let config = parse(&[
            "--vs",
            "10.10.10.10:6443",
            "--rs",
            "192.168.0.2:6443,192.168.0.2:6443,192.168.0.3:6443",
        ])
        .unwrap();
        assert_eq!(config.real_servers.len(), 2);
    }

    #[test]
    fn test_zero_interval_is_fatal() {
        assert!(
            parse(&["--vs", "10.10.10.10:6443", "--rs", "192.168.0.2:6443", "--interval", "0"])
                .is_err()
        );
    }

    #[test]
    fn test_persistence_and_weight() {
        let config = parse(&[
            "--vs",
            "10.10.10.10:6443",
            "--rs",
            "192.168.0.2:6443",
            "--persistence-timeout",
            "600",
            "--weight",
            "3",
            "--scheduler",
            "wlc",
        ])
        .unwrap();
        assert!(config.virtual_server.is_persistent());
        assert_eq!(config.virtual_server.timeout, 600);
        assert_eq!(config.virtual_server.scheduler, "wlc");
        assert_eq!(config.real_servers[0].weight, 3);
    }

    #[test]
    fn test_zero_persistence_timeout_is_fatal() {
        let err = parse(&[
            "--vs",
            "10.10.10.10:6443",
            "--rs",
            "192.168.0.2:6443",
            "--persistence-timeout",
            "0",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("Persistence timeout"));
    }

    #[test]
    fn test_weight_out_of_range_is_fatal() {
        let err = parse(&["--vs", "10.10.10.10:6443", "--rs", "192.168.0.2:6443", "--weight", "70000"])
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));

        let config = parse(&["--vs", "10.10.10.10:6443", "--rs", "192.168.0.2:6443", "--weight", "65535"])
            .unwrap();
        assert_eq!(config.real_servers[0].weight, 65535);
    }
}
