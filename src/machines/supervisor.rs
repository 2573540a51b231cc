//! The health-check supervisor. One task per machine creation, confirming
//! liveness without blocking the creation response.

use std::net::Ipv4Addr;
use std::sync::Weak;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    constants::{HEALTH_CHECK_INTERVAL, HEALTH_CHECK_MAX_RETRIES},
    machines::MachineOrchestrator,
};

#[derive(Debug, Clone)]
pub struct HealthCheckPolicy {
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            max_retries: HEALTH_CHECK_MAX_RETRIES,
            interval: HEALTH_CHECK_INTERVAL,
        }
    }
}

/// Probe the machine's health endpoint until it answers or the retry budget
/// runs out, then commit the outcome. Individual probe failures are
/// swallowed; only the final outcome reaches the state machine.
///
/// Holds only a weak reference to the orchestrator: if the machine (or the
/// whole plane) is torn down mid-probe, the task quietly ends.
pub(crate) async fn supervise(
    orchestrator: Weak<MachineOrchestrator>,
    id: String,
    ip: Ipv4Addr,
    guest_port: u16,
    policy: HealthCheckPolicy,
) {
    let url = format!("http://{}:{}/health", ip, guest_port);
    let client = reqwest::Client::new();

    for attempt in 1..=policy.max_retries {
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!(machine = %id, ip = %ip, "machine is healthy");
                let Some(orchestrator) = orchestrator.upgrade() else {
                    return;
                };
                if let Err(e) = orchestrator.commit_health_success(&id, ip).await {
                    warn!(machine = %id, "failed to record healthy machine: {}", e);
                }
                return;
            }
            Ok(response) => {
                warn!(
                    machine = %id,
                    status = %response.status(),
                    attempt,
                    "machine is not ready, retrying"
                );
            }
            Err(e) => {
                warn!(machine = %id, attempt, "health probe failed: {}", e);
            }
        }

        if attempt < policy.max_retries {
            sleep(policy.interval).await;
        }
    }

    error!(
        machine = %id,
        retries = policy.max_retries,
        "machine failed to become healthy, marking failed"
    );

    let Some(orchestrator) = orchestrator.upgrade() else {
        return;
    };
    if let Err(e) = orchestrator.commit_health_exhausted(&id).await {
        warn!(machine = %id, "failed to record unhealthy machine: {}", e);
    }
}
