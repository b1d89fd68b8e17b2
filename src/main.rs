mod care;
mod config_cli;
mod ipvs;
mod models;

use care::SessionController;
use config_cli::Config;
use ipvs::{IpvsHandle, Ipvsadm, MemoryTable};

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let care_config = config.care_config()?;

    let handle: Arc<dyn IpvsHandle> = if config.dry_run {
        warn!("Dry run: the kernel table is only simulated in memory");
        Arc::new(MemoryTable::new())
    } else {
        Arc::new(Ipvsadm::new(&config.ipvsadm))
    };

    let session = SessionController::new(care_config, handle)?;
    session.run().await
}
