use std::path::PathBuf;

use tracing::warn;

use flint::constants::{DEFAULT_DATA_DIR, DEFAULT_HTTP_HOST, DEFAULT_HTTP_PORT, DEFAULT_VM_CIDR};

/// Daemon configuration, read from the environment once at startup. The
/// hypervisor paths (rootfs, kernel, binary) are deliberately not here:
/// those are read at machine-creation time.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub http_host: String,
    pub http_port: u16,
    pub data_dir: PathBuf,
    pub vm_cidr: String,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let http_host =
            std::env::var("FLINT_HTTP_HOST").unwrap_or_else(|_| DEFAULT_HTTP_HOST.to_string());

        let http_port = match std::env::var("FLINT_HTTP_PORT") {
            Ok(port) => port.parse().unwrap_or_else(|_| {
                warn!("invalid FLINT_HTTP_PORT {:?}, using {}", port, DEFAULT_HTTP_PORT);
                DEFAULT_HTTP_PORT
            }),
            Err(_) => DEFAULT_HTTP_PORT,
        };

        let data_dir = std::env::var("FLINT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));

        let vm_cidr =
            std::env::var("FLINT_VM_CIDR").unwrap_or_else(|_| DEFAULT_VM_CIDR.to_string());

        Self {
            http_host,
            http_port,
            data_dir,
            vm_cidr,
        }
    }
}
