pub mod firecracker;
pub mod net;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::{error::Result, resources::machine::MachineConfig};

/// Boots hypervisor instances. The adapter keeps no record of which handles
/// exist; that bookkeeping belongs to the registry.
#[async_trait]
pub trait VmRuntime: Send + Sync + 'static {
    /// Boot a new instance for `id` and return the handle bound to the live
    /// hypervisor process, with its guest address already allocated.
    async fn start(&self, id: &str, config: &MachineConfig) -> Result<Box<dyn VmHandle>>;
}

/// Opaque reference to one live hypervisor instance.
#[async_trait]
pub trait VmHandle: Send + Sync + 'static {
    fn ip(&self) -> Ipv4Addr;

    /// Resume a previously started instance.
    async fn restart(&self) -> Result<()>;

    /// Gracefully stop the instance.
    async fn shutdown(&self) -> Result<()>;
}
