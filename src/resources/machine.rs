use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Declarative description of a machine, supplied at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineConfig {
    pub app_name: String,
    pub image: String,
    pub machine_type: MachineType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineType {
    pub cpu_kind: String,
    pub cpus: i64,
    pub gpu_kind: String,
    pub memory_mb: i64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            app_name: "crunchy_new_app".to_string(),
            image: "default_image".to_string(),
            machine_type: MachineType {
                cpu_kind: "default_cpu".to_string(),
                cpus: 1,
                gpu_kind: "default_gpu".to_string(),
                memory_mb: 256,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    /// Terminal, reserved for workload-completion signaling. Nothing in the
    /// orchestration core produces it.
    Completed,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineStatus::Pending => "pending",
            MachineStatus::Running => "running",
            MachineStatus::Stopped => "stopped",
            MachineStatus::Failed => "failed",
            MachineStatus::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// The durable projection of a machine. Exactly one record exists per id for
/// the lifetime of the machine, and it is the sole source of truth for
/// external queries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineRecord {
    pub id: String,
    pub status: MachineStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    pub config: MachineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatusResponse {
    pub id: String,
    pub status: MachineStatus,
}

/// Body forwarded to a machine's in-guest agent for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub id: String,
    pub code: String,
    pub language: String,
    pub variant: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    pub message: String,
    pub error: String,
    pub stdout: String,
    pub stderr: String,
    pub exec_duration: i64,
    pub mem_usage: i64,
}
