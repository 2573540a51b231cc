// Firecracker process lifecycle. Each machine gets its own process, API
// socket, rootfs image, and console log; configuration happens over the
// API socket once the process is up.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    constants::{FIRECRACKER_BIN_ENV, KERNEL_IMAGE_PATH_ENV, ROOTFS_PATH_ENV},
    error::{Error, Result},
    resources::machine::MachineConfig,
    vmm::{
        VmHandle, VmRuntime,
        net::{IpAllocator, IpRange, mac_for_ip},
    },
};

const PROCESS_START_DELAY: Duration = Duration::from_millis(100);
const API_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);
const API_SOCKET_POLL_ATTEMPTS: usize = 50;
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_POLL_ATTEMPTS: usize = 20;

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

mod api {
    use serde::Serialize;

    #[derive(Serialize)]
    pub struct BootSource {
        pub kernel_image_path: String,
        pub boot_args: String,
    }

    #[derive(Serialize)]
    pub struct Drive {
        pub drive_id: String,
        pub path_on_host: String,
        pub is_root_device: bool,
        pub is_read_only: bool,
    }

    #[derive(Serialize)]
    pub struct MachineConfig {
        pub vcpu_count: i64,
        pub mem_size_mib: i64,
    }

    #[derive(Serialize)]
    pub struct NetworkInterface {
        pub iface_id: String,
        pub guest_mac: String,
        pub host_dev_name: String,
    }

    #[derive(Serialize)]
    pub struct InstanceActionInfo {
        pub action_type: String,
    }
}

/// Host paths the runtime needs to boot one machine. Read from the
/// environment at machine-creation time.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub rootfs_template: PathBuf,
    pub kernel_image: PathBuf,
    pub firecracker_bin: PathBuf,
}

impl RuntimePaths {
    pub fn from_env() -> Result<Self> {
        let rootfs_template = env_path(ROOTFS_PATH_ENV)?;
        let kernel_image = env_path(KERNEL_IMAGE_PATH_ENV)?;
        let firecracker_bin = env_path(FIRECRACKER_BIN_ENV)?;

        Ok(Self {
            rootfs_template,
            kernel_image,
            firecracker_bin,
        })
    }
}

fn env_path(var: &str) -> Result<PathBuf> {
    std::env::var(var)
        .map(PathBuf::from)
        .map_err(|_| Error::runtime_start(format!("{} is not set", var)))
}

fn verify_binary(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)
        .map_err(|e| Error::runtime_start(format!("binary {:?} does not exist: {}", path, e)))?;

    if meta.is_dir() {
        return Err(Error::runtime_start(format!(
            "binary {:?} is a directory",
            path
        )));
    }

    if meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::runtime_start(format!(
            "binary {:?} is not executable",
            path
        )));
    }

    Ok(())
}

fn socket_path(id: &str) -> PathBuf {
    std::env::temp_dir().join(format!(".flint.sock-{}-{}", std::process::id(), id))
}

fn rootfs_path(id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rootfs-{}.ext4", id))
}

fn console_log_path(id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("firecracker-{}.log", id))
}

fn boot_args(ip: Ipv4Addr, gateway: Ipv4Addr, netmask: Ipv4Addr) -> String {
    format!(
        "{} ip={}::{}:{}::eth0:off",
        BASE_BOOT_ARGS, ip, gateway, netmask
    )
}

pub struct FirecrackerRuntime {
    allocator: Arc<IpAllocator>,
}

impl FirecrackerRuntime {
    pub fn new(range: IpRange) -> Self {
        Self {
            allocator: Arc::new(IpAllocator::new(range)),
        }
    }
}

#[async_trait]
impl VmRuntime for FirecrackerRuntime {
    async fn start(&self, id: &str, config: &MachineConfig) -> Result<Box<dyn VmHandle>> {
        let paths = RuntimePaths::from_env()?;
        verify_binary(&paths.firecracker_bin)?;

        if !paths.kernel_image.exists() {
            return Err(Error::runtime_start(format!(
                "kernel image {:?} does not exist",
                paths.kernel_image
            )));
        }
        if !paths.rootfs_template.exists() {
            return Err(Error::runtime_start(format!(
                "rootfs template {:?} does not exist",
                paths.rootfs_template
            )));
        }

        let rootfs = rootfs_path(id);
        tokio::fs::copy(&paths.rootfs_template, &rootfs)
            .await
            .map_err(|e| Error::runtime_start(format!("failed to copy rootfs: {}", e)))?;

        let api_socket = socket_path(id);
        if api_socket.exists() {
            let _ = std::fs::remove_file(&api_socket);
        }

        let console_log = console_log_path(id);
        let log_file = std::fs::File::create(&console_log)
            .map_err(|e| Error::runtime_start(format!("failed to create console log: {}", e)))?;
        let log_file_stderr = log_file
            .try_clone()
            .map_err(|e| Error::runtime_start(format!("failed to clone log handle: {}", e)))?;

        info!(machine = %id, socket = %api_socket.display(), "starting firecracker");

        let mut process = Command::new(&paths.firecracker_bin)
            .arg("--api-sock")
            .arg(&api_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::runtime_start(format!("failed to spawn firecracker: {}", e)))?;

        sleep(PROCESS_START_DELAY).await;

        if let Ok(Some(status)) = process.try_wait() {
            let log_head = std::fs::read_to_string(&console_log)
                .map(|s| s.lines().take(10).collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            return Err(Error::runtime_start(format!(
                "firecracker exited immediately with {}: {}",
                status, log_head
            )));
        }

        for _ in 0..API_SOCKET_POLL_ATTEMPTS {
            if api_socket.exists() {
                break;
            }
            sleep(API_SOCKET_POLL_INTERVAL).await;
        }

        if !api_socket.exists() {
            let _ = process.kill().await;
            return Err(Error::runtime_start("API socket not created".to_string()));
        }

        let ip = self.allocator.allocate()?;

        let handle = FirecrackerHandle {
            id: id.to_string(),
            ip,
            api_socket,
            rootfs,
            process: Mutex::new(process),
            allocator: self.allocator.clone(),
        };

        if let Err(e) = handle.configure(config, &paths).await {
            let mut process = handle.process.lock().await;
            let _ = process.kill().await;
            return Err(e);
        }

        handle.instance_start().await?;

        info!(machine = %id, ip = %ip, "firecracker instance started");

        Ok(Box::new(handle))
    }
}

pub struct FirecrackerHandle {
    id: String,
    ip: Ipv4Addr,
    api_socket: PathBuf,
    rootfs: PathBuf,
    process: Mutex<Child>,
    allocator: Arc<IpAllocator>,
}

impl FirecrackerHandle {
    async fn api_request(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> std::result::Result<(), String> {
        let client: Client<UnixConnector, Full<Bytes>> = Client::unix();
        let url: hyper::Uri = Uri::new(&self.api_socket, path).into();

        let request = Request::builder()
            .method(method)
            .uri(url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| format!("failed to build request: {}", e))?;

        debug!(machine = %self.id, "firecracker api {} {}", request.method(), path);

        let response = client
            .request(request)
            .await
            .map_err(|e| format!("API request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .collect()
                .await
                .map_err(|e| format!("failed to read response: {}", e))?
                .to_bytes();
            return Err(format!(
                "API returned {}: {}",
                status,
                String::from_utf8_lossy(&body)
            ));
        }

        Ok(())
    }

    async fn configure(&self, config: &MachineConfig, paths: &RuntimePaths) -> Result<()> {
        let range = self.allocator.range();
        let boot_source = api::BootSource {
            kernel_image_path: paths.kernel_image.display().to_string(),
            boot_args: boot_args(self.ip, range.gateway(), range.netmask()),
        };
        self.put("/boot-source", &boot_source).await?;

        let drive = api::Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: self.rootfs.display().to_string(),
            is_root_device: true,
            is_read_only: false,
        };
        self.put("/drives/rootfs", &drive).await?;

        let machine = api::MachineConfig {
            vcpu_count: config.machine_type.cpus,
            mem_size_mib: config.machine_type.memory_mb,
        };
        self.put("/machine-config", &machine).await?;

        let iface = api::NetworkInterface {
            iface_id: "eth0".to_string(),
            guest_mac: mac_for_ip(self.ip),
            host_dev_name: format!("tap-{}", self.id),
        };
        self.put("/network-interfaces/eth0", &iface).await?;

        Ok(())
    }

    async fn put<B: serde::Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_string(body)?;
        self.api_request(Method::PUT, path, Some(body))
            .await
            .map_err(Error::runtime_start)
    }

    async fn instance_start(&self) -> Result<()> {
        let action = api::InstanceActionInfo {
            action_type: "InstanceStart".to_string(),
        };
        self.put("/actions", &action).await
    }
}

#[async_trait]
impl VmHandle for FirecrackerHandle {
    fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    async fn restart(&self) -> Result<()> {
        self.instance_start().await
    }

    async fn shutdown(&self) -> Result<()> {
        let action = api::InstanceActionInfo {
            action_type: "SendCtrlAltDel".to_string(),
        };
        let body = serde_json::to_string(&action)?;
        if let Err(e) = self.api_request(Method::PUT, "/actions", Some(body)).await {
            warn!(machine = %self.id, "graceful shutdown request failed: {}", e);
        }

        let mut process = self.process.lock().await;
        for _ in 0..SHUTDOWN_POLL_ATTEMPTS {
            match process.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => sleep(SHUTDOWN_POLL_INTERVAL).await,
                Err(e) => {
                    return Err(Error::runtime_shutdown(format!(
                        "failed to poll firecracker process: {}",
                        e
                    )));
                }
            }
        }

        if let Ok(None) = process.try_wait() {
            process
                .kill()
                .await
                .map_err(|e| Error::runtime_shutdown(format!("failed to kill process: {}", e)))?;
        }

        let _ = std::fs::remove_file(&self.api_socket);
        let _ = std::fs::remove_file(&self.rootfs);

        Ok(())
    }
}

impl Drop for FirecrackerHandle {
    fn drop(&mut self) {
        self.allocator.release(self.ip);
    }
}
