use std::time::Duration;

pub const HEALTH_CHECK_MAX_RETRIES: u32 = 6;
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Port the in-guest agent listens on for /health and /run.
pub const GUEST_AGENT_PORT: u16 = 8081;

pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on machine creations in flight at once. Each creation spawns
/// one hypervisor process and one supervisor task.
pub const MAX_CONCURRENT_CREATES: usize = 8;

pub const MACHINE_ID_PREFIX: &str = "m";

pub const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
pub const DEFAULT_HTTP_PORT: u16 = 1323;
pub const DEFAULT_DATA_DIR: &str = "data";
pub const DEFAULT_VM_CIDR: &str = "172.16.0.0/24";

// Read at machine-creation time, not at daemon startup.
pub const ROOTFS_PATH_ENV: &str = "ROOTFS_PATH";
pub const KERNEL_IMAGE_PATH_ENV: &str = "KERNEL_IMAGE_PATH";
pub const FIRECRACKER_BIN_ENV: &str = "FIRECRACKER_BINARY";
