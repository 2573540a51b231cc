use std::net::Ipv4Addr;
use std::sync::Arc;

use papaya::HashMap;
use tokio::{sync::Mutex, task::JoinHandle};

use crate::vmm::VmHandle;

/// In-process binding of one live machine: the opaque hypervisor handle,
/// its guest address, and the supervisor task slot. Exclusively owned by the
/// registry entry for its id; dropped when the entry is removed.
pub struct RuntimeHandle {
    pub id: String,
    pub ip: Ipv4Addr,
    vm: Box<dyn VmHandle>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl RuntimeHandle {
    pub fn new(id: String, ip: Ipv4Addr, vm: Box<dyn VmHandle>) -> Self {
        Self {
            id,
            ip,
            vm,
            supervisor: Mutex::new(None),
        }
    }

    pub fn vm(&self) -> &dyn VmHandle {
        self.vm.as_ref()
    }

    pub async fn attach_supervisor(&self, task: JoinHandle<()>) {
        *self.supervisor.lock().await = Some(task);
    }

    /// Abort the supervisor task, if one is still attached. Stop and delete
    /// call this first so no probe outlives an operator decision.
    pub async fn cancel_supervisor(&self) {
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
    }
}

/// Index from machine id to its live runtime handle. All operations are
/// atomic with respect to each other; entries are only ever added or
/// removed, never partially updated.
pub struct Registry {
    machines: HashMap<String, Arc<RuntimeHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            machines: HashMap::new(),
        }
    }

    pub fn put(&self, id: &str, handle: Arc<RuntimeHandle>) {
        let machines = self.machines.pin();
        machines.insert(id.to_string(), handle);
    }

    pub fn get(&self, id: &str) -> Option<Arc<RuntimeHandle>> {
        let machines = self.machines.pin();
        machines.get(id).cloned()
    }

    /// Removing a missing id is a no-op, not an error.
    pub fn remove(&self, id: &str) {
        let machines = self.machines.pin();
        machines.remove(id);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
