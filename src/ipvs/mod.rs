pub mod balancer;
pub mod ipvsadm;
pub mod memory;

use crate::models::{RealServer, VirtualServer};

use async_trait::async_trait;
use std::{fmt, future::Future, time::Duration};
use tokio::time::sleep;
use tracing::debug;

pub use balancer::Balancer;
pub use ipvsadm::Ipvsadm;
pub use memory::MemoryTable;

#[derive(Debug, thiserror::Error)]
pub enum LbError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{op} rejected: {reason}")]
    Rejected { op: String, reason: String },

    #[error("kernel table I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl LbError {
    pub fn rejected(op: impl Into<String>, reason: impl Into<String>) -> Self {
        LbError::Rejected {
            op: op.into(),
            reason: reason.into(),
        }
    }

    /// Outcomes that mean the table already looks the way the caller wants.
    pub fn is_idempotent(&self) -> bool {
        matches!(self, LbError::AlreadyExists(_) | LbError::NotFound(_))
    }
}

/// Ordered list of the failures collected during one pass.
#[derive(Debug, Default)]
pub struct CareErrors(pub Vec<LbError>);

impl CareErrors {
    pub fn push(&mut self, err: LbError) {
        self.0.push(err);
    }

    pub fn extend(&mut self, other: CareErrors) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), CareErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for CareErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s): ", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CareErrors {}

/// Primitive operations on the kernel load-balancer table.
///
/// Implementations report "already exists" and "not found" through the
/// matching [`LbError`] variants so callers can decide what is idempotent.
#[async_trait]
pub trait IpvsHandle: Send + Sync {
    /// Returns the service as currently applied, if present.
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>, LbError>;

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError>;

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError>;

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<(), LbError>;

    /// Current members of the service, with their applied weights.
    async fn list_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>, LbError>;

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError>;

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError>;

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<(), LbError>;
}

/// Runs `op` up to `attempts` times. Idempotency outcomes are returned as-is
/// without retrying.
pub async fn retry<T, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T, LbError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LbError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_idempotent() || attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, "Kernel table call failed, retrying: {}", e);
                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}
