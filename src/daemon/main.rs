mod config;

use std::sync::Arc;

use anyhow::Result;
use flint::{
    api::{ApiServer, ApiServerConfig},
    machinery::store::Store,
    machines::MachineOrchestrator,
    utils::tracing::init_tracing,
    vmm::{firecracker::FirecrackerRuntime, net::IpRange},
};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = DaemonConfig::from_env();

    let store = Arc::new(Store::new(&config.data_dir).await?);

    let vm_range = IpRange::from_cidr(&config.vm_cidr)?;
    let runtime = Arc::new(FirecrackerRuntime::new(vm_range));

    let orchestrator = MachineOrchestrator::new(store, runtime);

    let api_server = ApiServer::new(
        orchestrator,
        ApiServerConfig {
            host: config.http_host,
            port: config.http_port,
        },
    );

    api_server.start().await?;

    Ok(())
}
