use clap::ValueEnum;
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

// ============================================================================
// Domain Models
// ============================================================================

/// IPVS service flag marking a persistent virtual server.
pub const SVC_F_PERSISTENT: u32 = 0x1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HealthScheme {
    Http,
    Https,
}

impl HealthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthScheme::Http => "http",
            HealthScheme::Https => "https",
        }
    }
}

impl fmt::Display for HealthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the most recent reachability probe. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthState::Unknown => f.write_str("unknown"),
            HealthState::Healthy => f.write_str("healthy"),
            HealthState::Unhealthy => f.write_str("unhealthy"),
        }
    }
}

/// A load-balanced service endpoint in the kernel table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualServer {
    pub address: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: String,
    pub flags: u32,
    pub timeout: u32,
}

impl VirtualServer {
    pub fn new(endpoint: SocketAddr, protocol: Protocol, scheduler: impl Into<String>) -> Self {
        Self {
            address: endpoint.ip(),
            port: endpoint.port(),
            protocol,
            scheduler: scheduler.into(),
            flags: 0,
            timeout: 0,
        }
    }

    /// Marks the service persistent with the given timeout in seconds.
    pub fn with_persistence(mut self, timeout: u32) -> Self {
        self.flags |= SVC_F_PERSISTENT;
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & SVC_F_PERSISTENT != 0
    }

    /// Identity of the service in the kernel table: (address, port, protocol).
    pub fn same_service(&self, other: &VirtualServer) -> bool {
        self.address == other.address && self.port == other.port && self.protocol == other.protocol
    }

    /// True when `applied` is the same service but carries different settings.
    pub fn drifted_from(&self, applied: &VirtualServer) -> bool {
        self.same_service(applied)
            && (self.scheduler != applied.scheduler
                || self.flags != applied.flags
                || self.timeout != applied.timeout)
    }

    /// Scheduler and persistence settings, for drift reports.
    pub fn settings(&self) -> String {
        if self.is_persistent() {
            format!("{} persistent {}s (flags {:#x})", self.scheduler, self.timeout, self.flags)
        } else {
            format!("{} (flags {:#x})", self.scheduler, self.flags)
        }
    }
}

impl fmt::Display for VirtualServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.protocol, self.endpoint())
    }
}

/// One backend endpoint behind the virtual server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealServer {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
}

impl RealServer {
    pub fn new(endpoint: SocketAddr) -> Self {
        Self {
            address: endpoint.ip(),
            port: endpoint.port(),
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for RealServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Immutable desired state for one run of the agent.
#[derive(Debug, Clone)]
pub struct CareConfig {
    pub virtual_server: VirtualServer,
    pub real_servers: Vec<RealServer>,
    pub health_path: String,
    pub health_scheme: HealthScheme,
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub run_once: bool,
    pub cleanup_before_start: bool,
    pub graceful_drain: bool,
}
