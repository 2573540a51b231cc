pub mod lifecycle;
pub mod registry;
pub mod store;
pub mod supervisor;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};
use tracing::{error, info, warn};

use crate::{
    constants::{
        GUEST_AGENT_PORT, MACHINE_ID_PREFIX, MAX_CONCURRENT_CREATES, WAIT_POLL_INTERVAL,
        WAIT_TIMEOUT,
    },
    error::{Error, Result},
    machinery::store::Store,
    machines::{
        registry::{Registry, RuntimeHandle},
        store::MachineStore,
        supervisor::{HealthCheckPolicy, supervise},
    },
    resources::machine::{MachineConfig, MachineRecord, MachineStatus, RunRequest, RunResponse},
    utils::id::short_id_with_prefix,
    vmm::VmRuntime,
};

/// What a status commit does to the stored address.
enum IpPatch {
    Keep,
    Set(Ipv4Addr),
    Clear,
}

/// The orchestration facade. Composes the registry, the status store, the
/// runtime adapter, and the health-check supervisor into the user-facing
/// operations.
///
/// All status-mutating operations for one machine id are serialized through
/// a per-id lock, and every status write goes through the validated commit
/// path. Creations pass an admission gate sized to host resource limits.
pub struct MachineOrchestrator {
    registry: Registry,
    store: MachineStore,
    runtime: Arc<dyn VmRuntime>,
    health: HealthCheckPolicy,
    guest_port: u16,
    client: reqwest::Client,
    create_gate: Semaphore,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MachineOrchestrator {
    pub fn new(store: Arc<Store>, runtime: Arc<dyn VmRuntime>) -> Arc<Self> {
        Self::with_policy(store, runtime, HealthCheckPolicy::default(), GUEST_AGENT_PORT)
    }

    pub fn with_policy(
        store: Arc<Store>,
        runtime: Arc<dyn VmRuntime>,
        health: HealthCheckPolicy,
        guest_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            store: MachineStore::new(store),
            runtime,
            health,
            guest_port,
            client: reqwest::Client::new(),
            create_gate: Semaphore::new(MAX_CONCURRENT_CREATES),
            locks: Mutex::new(HashMap::new()),
        })
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// The single path for status writes. Callers must hold the machine's
    /// per-id lock.
    fn commit_locked(
        &self,
        id: &str,
        status: MachineStatus,
        ip: IpPatch,
        config: Option<&MachineConfig>,
    ) -> Result<MachineRecord> {
        let current = self.store.read(id)?;
        lifecycle::validate(current.as_ref().map(|r| r.status), status)?;

        let record = MachineRecord {
            id: id.to_string(),
            status,
            ip: match ip {
                IpPatch::Keep => current.as_ref().and_then(|r| r.ip),
                IpPatch::Set(ip) => Some(ip),
                IpPatch::Clear => None,
            },
            config: match config {
                Some(config) => config.clone(),
                None => current.map(|r| r.config).unwrap_or_default(),
            },
        };

        self.store.write(&record)?;
        info!(machine = %id, status = %record.status, "status committed");
        Ok(record)
    }

    /// Boot a machine and return its record without waiting for health
    /// confirmation. The response carries the allocated address; the stored
    /// record gains it only once the supervisor confirms liveness.
    pub async fn create(self: &Arc<Self>, config: Option<MachineConfig>) -> Result<MachineRecord> {
        let _permit = self
            .create_gate
            .acquire()
            .await
            .map_err(|_| Error::runtime_start("admission gate closed"))?;

        let config = config.unwrap_or_default();
        let id = short_id_with_prefix(MACHINE_ID_PREFIX);

        info!(machine = %id, app = %config.app_name, "creating machine");

        let vm = match self.runtime.start(&id, &config).await {
            Ok(vm) => vm,
            Err(e) => {
                error!(machine = %id, "failed to boot machine: {}", e);
                let lock = self.id_lock(&id).await;
                let _guard = lock.lock().await;
                if let Err(we) =
                    self.commit_locked(&id, MachineStatus::Failed, IpPatch::Clear, Some(&config))
                {
                    error!(machine = %id, "failed to record boot failure: {}", we);
                }
                return Err(e);
            }
        };

        let ip = vm.ip();
        let handle = Arc::new(RuntimeHandle::new(id.clone(), ip, vm));
        self.registry.put(&id, handle.clone());

        let committed = {
            let lock = self.id_lock(&id).await;
            let _guard = lock.lock().await;
            self.commit_locked(&id, MachineStatus::Pending, IpPatch::Clear, Some(&config))
        };
        if let Err(e) = committed {
            warn!(machine = %id, "failed to persist pending record: {}", e);
            self.registry.remove(&id);
            if let Err(se) = handle.vm().shutdown().await {
                warn!(machine = %id, "failed to tear down unrecorded machine: {}", se);
            }
            return Err(e);
        }

        let task = tokio::spawn(supervise(
            Arc::downgrade(self),
            id.clone(),
            ip,
            self.guest_port,
            self.health.clone(),
        ));
        handle.attach_supervisor(task).await;

        Ok(MachineRecord {
            id,
            status: MachineStatus::Pending,
            ip: Some(ip),
            config,
        })
    }

    /// Re-confirm or resume a machine. The stored status is only touched
    /// after the runtime acknowledges.
    pub async fn start(&self, id: &str) -> Result<()> {
        let Some(handle) = self.registry.get(id) else {
            return Err(Error::not_found(id));
        };

        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let current = self.store.read(id)?.ok_or_else(|| Error::not_found(id))?;
        lifecycle::validate(Some(current.status), MachineStatus::Running)?;

        handle.vm().restart().await?;
        self.commit_locked(id, MachineStatus::Running, IpPatch::Keep, None)?;
        Ok(())
    }

    /// Shut a machine down. The stored status is only touched after the
    /// runtime acknowledges, so a failed shutdown never fakes a stop.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let Some(handle) = self.registry.get(id) else {
            return Err(Error::not_found(id));
        };

        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;

        let current = self.store.read(id)?.ok_or_else(|| Error::not_found(id))?;
        lifecycle::validate(Some(current.status), MachineStatus::Stopped)?;

        handle.cancel_supervisor().await;
        handle.vm().shutdown().await?;
        self.commit_locked(id, MachineStatus::Stopped, IpPatch::Keep, None)?;
        Ok(())
    }

    /// Tear down a machine and forget it. Idempotent: deleting an unknown or
    /// already-deleted id succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if let Some(handle) = self.registry.get(id) {
            handle.cancel_supervisor().await;

            let lock = self.id_lock(id).await;
            let _guard = lock.lock().await;

            if let Err(e) = handle.vm().shutdown().await {
                warn!(machine = %id, "shutdown during delete failed: {}", e);
            }
            self.registry.remove(id);
            self.store.delete(id)?;
            info!(machine = %id, "machine deleted");
        } else {
            let lock = self.id_lock(id).await;
            let _guard = lock.lock().await;
            self.store.delete(id)?;
        }

        self.locks.lock().await.remove(id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<MachineRecord> {
        self.store.read(id)?.ok_or_else(|| Error::not_found(id))
    }

    pub async fn list(&self) -> Result<Vec<MachineRecord>> {
        self.store.list_all()
    }

    /// Block until the machine's status settles (anything but pending) or
    /// the wait ceiling passes, then return the last-seen record. A timeout
    /// is not an error; the caller gets the current snapshot.
    pub async fn wait(&self, id: &str) -> Result<MachineRecord> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let record = self.get(id).await?;
            if lifecycle::is_settled(record.status) || Instant::now() >= deadline {
                return Ok(record);
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Forward an execution request to the machine's in-guest agent.
    pub async fn run(&self, id: &str, request: RunRequest) -> Result<RunResponse> {
        let record = self.get(id).await?;

        let ip = match (record.status, record.ip) {
            (MachineStatus::Running, Some(ip)) => ip,
            _ => return Err(Error::invalid_request("machine is not running")),
        };

        let url = format!("http://{}:{}/run", ip, self.guest_port);
        let response = self.client.post(&url).json(&request).send().await?;
        let body = response.json::<RunResponse>().await?;
        Ok(body)
    }

    pub(crate) async fn commit_health_success(&self, id: &str, ip: Ipv4Addr) -> Result<()> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;
        self.commit_locked(id, MachineStatus::Running, IpPatch::Set(ip), None)?;
        Ok(())
    }

    pub(crate) async fn commit_health_exhausted(&self, id: &str) -> Result<()> {
        let lock = self.id_lock(id).await;
        let _guard = lock.lock().await;
        self.commit_locked(id, MachineStatus::Failed, IpPatch::Clear, None)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{Json, Router, extract::State, routing::get, routing::post};
    use hyper::StatusCode;

    use crate::vmm::VmHandle;

    struct FakeVm {
        ip: Ipv4Addr,
        restarts: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_shutdown: bool,
    }

    #[async_trait]
    impl VmHandle for FakeVm {
        fn ip(&self) -> Ipv4Addr {
            self.ip
        }

        async fn restart(&self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            if self.fail_shutdown {
                return Err(Error::runtime_shutdown("injected shutdown failure"));
            }
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        fail_start: bool,
        fail_shutdown: bool,
        restarts: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl VmRuntime for FakeRuntime {
        async fn start(&self, _id: &str, _config: &MachineConfig) -> Result<Box<dyn VmHandle>> {
            if self.fail_start {
                return Err(Error::runtime_start("injected boot failure"));
            }
            Ok(Box::new(FakeVm {
                ip: Ipv4Addr::LOCALHOST,
                restarts: self.restarts.clone(),
                shutdowns: self.shutdowns.clone(),
                fail_shutdown: self.fail_shutdown,
            }))
        }
    }

    async fn plane(
        runtime: FakeRuntime,
        health: HealthCheckPolicy,
        guest_port: u16,
    ) -> (Arc<MachineOrchestrator>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let store = Arc::new(
            Store::new(dir.path())
                .await
                .expect("failed to create store"),
        );
        let orchestrator =
            MachineOrchestrator::with_policy(store, Arc::new(runtime), health, guest_port);
        (orchestrator, dir)
    }

    /// A policy slow enough that no probe outcome lands during the test.
    fn idle_policy() -> HealthCheckPolicy {
        HealthCheckPolicy {
            max_retries: 2,
            interval: Duration::from_secs(30),
        }
    }

    fn quick_policy(max_retries: u32, interval_ms: u64) -> HealthCheckPolicy {
        HealthCheckPolicy {
            max_retries,
            interval: Duration::from_millis(interval_ms),
        }
    }

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server failed");
        });
        addr
    }

    async fn healthy_guest() -> SocketAddr {
        serve(Router::new().route("/health", get(|| async { StatusCode::OK }))).await
    }

    async fn unhealthy_guest(hits: Arc<AtomicUsize>) -> SocketAddr {
        let app = Router::new()
            .route(
                "/health",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::INTERNAL_SERVER_ERROR
                }),
            )
            .with_state(hits);
        serve(app).await
    }

    async fn poll_status(
        orchestrator: &Arc<MachineOrchestrator>,
        id: &str,
        wanted: MachineStatus,
    ) -> MachineRecord {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let record = orchestrator.get(id).await.expect("get failed");
            if record.status == wanted {
                return record;
            }
            assert!(
                Instant::now() < deadline,
                "machine never reached {wanted}, stuck at {}",
                record.status
            );
            sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_create_then_get_is_pending() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let created = orchestrator.create(None).await.expect("create failed");
        assert_eq!(created.status, MachineStatus::Pending);
        assert_eq!(created.ip, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(created.config, MachineConfig::default());

        let fetched = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(fetched.status, MachineStatus::Pending);
        // the stored record gains an address only once the machine is healthy
        assert_eq!(fetched.ip, None);

        let all = orchestrator.list().await.expect("list failed");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, created.id);
    }

    #[tokio::test]
    async fn test_create_echoes_config() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let mut config = MachineConfig::default();
        config.machine_type.cpus = 2;
        config.machine_type.memory_mb = 512;

        let created = orchestrator
            .create(Some(config.clone()))
            .await
            .expect("create failed");
        assert_eq!(created.config, config);

        let fetched = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(fetched.config, config);
    }

    #[tokio::test]
    async fn test_boot_failure_is_recorded() {
        let runtime = FakeRuntime {
            fail_start: true,
            ..Default::default()
        };
        let (orchestrator, _dir) = plane(runtime, idle_policy(), 1).await;

        let err = orchestrator.create(None).await.unwrap_err();
        assert!(matches!(err, Error::RuntimeStart(_)));

        let all = orchestrator.list().await.expect("list failed");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, MachineStatus::Failed);
        assert_eq!(all[0].ip, None);
    }

    #[tokio::test]
    async fn test_get_unknown_machine() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let err = orchestrator.get("m-unknown").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_supervisor_promotes_to_running() {
        let guest = healthy_guest().await;
        let (orchestrator, _dir) =
            plane(FakeRuntime::default(), quick_policy(5, 50), guest.port()).await;

        let created = orchestrator.create(None).await.expect("create failed");
        let record = poll_status(&orchestrator, &created.id, MachineStatus::Running).await;
        assert_eq!(record.ip, Some(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_supervisor_exhaustion_marks_failed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let guest = unhealthy_guest(hits.clone()).await;
        let retries = 4;
        let interval_ms = 30;
        let (orchestrator, _dir) = plane(
            FakeRuntime::default(),
            quick_policy(retries, interval_ms),
            guest.port(),
        )
        .await;

        let started = Instant::now();
        let created = orchestrator.create(None).await.expect("create failed");
        let record = poll_status(&orchestrator, &created.id, MachineStatus::Failed).await;

        // no address on a machine that never became healthy
        assert_eq!(record.ip, None);
        // the probe ran exactly its budget, spaced by the interval
        assert_eq!(hits.load(Ordering::SeqCst), retries as usize);
        assert!(
            started.elapsed() >= Duration::from_millis((retries as u64 - 1) * interval_ms),
            "exhaustion settled too early"
        );
    }

    #[tokio::test]
    async fn test_stop_and_restart_running_machine() {
        let guest = healthy_guest().await;
        let runtime = FakeRuntime::default();
        let restarts = runtime.restarts.clone();
        let shutdowns = runtime.shutdowns.clone();
        let (orchestrator, _dir) = plane(runtime, quick_policy(5, 50), guest.port()).await;

        let created = orchestrator.create(None).await.expect("create failed");
        poll_status(&orchestrator, &created.id, MachineStatus::Running).await;

        orchestrator.stop(&created.id).await.expect("stop failed");
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        let record = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(record.status, MachineStatus::Stopped);

        orchestrator.start(&created.id).await.expect("start failed");
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        let record = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(record.status, MachineStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_pending_machine_is_rejected() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let created = orchestrator.create(None).await.expect("create failed");
        let err = orchestrator.stop(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let record = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(record.status, MachineStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_shutdown_leaves_status_untouched() {
        let guest = healthy_guest().await;
        let runtime = FakeRuntime {
            fail_shutdown: true,
            ..Default::default()
        };
        let (orchestrator, _dir) = plane(runtime, quick_policy(5, 50), guest.port()).await;

        let created = orchestrator.create(None).await.expect("create failed");
        poll_status(&orchestrator, &created.id, MachineStatus::Running).await;

        let err = orchestrator.stop(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::RuntimeShutdown(_)));

        let record = orchestrator.get(&created.id).await.expect("get failed");
        assert_eq!(record.status, MachineStatus::Running);
    }

    #[tokio::test]
    async fn test_start_unknown_machine() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let err = orchestrator.start("m-unknown").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = orchestrator.stop("m-unknown").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let created = orchestrator.create(None).await.expect("create failed");
        orchestrator.delete(&created.id).await.expect("delete failed");

        let err = orchestrator.get(&created.id).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(orchestrator.list().await.expect("list failed").is_empty());

        // repeated delete is success, as is deleting something never created
        orchestrator.delete(&created.id).await.expect("delete failed");
        orchestrator.delete("m-unknown").await.expect("delete failed");
    }

    #[tokio::test]
    async fn test_delete_cancels_supervisor() {
        let hits = Arc::new(AtomicUsize::new(0));
        let guest = unhealthy_guest(hits.clone()).await;
        let (orchestrator, _dir) = plane(
            FakeRuntime::default(),
            quick_policy(1000, 50),
            guest.port(),
        )
        .await;

        let created = orchestrator.create(None).await.expect("create failed");
        sleep(Duration::from_millis(120)).await;
        orchestrator.delete(&created.id).await.expect("delete failed");

        // let any in-flight probe land before sampling the counter
        sleep(Duration::from_millis(100)).await;
        let probes_after_delete = hits.load(Ordering::SeqCst);
        sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), probes_after_delete);
    }

    #[tokio::test]
    async fn test_wait_returns_settled_record() {
        let guest = healthy_guest().await;
        let (orchestrator, _dir) =
            plane(FakeRuntime::default(), quick_policy(5, 50), guest.port()).await;

        let created = orchestrator.create(None).await.expect("create failed");
        let record = orchestrator.wait(&created.id).await.expect("wait failed");
        assert_eq!(record.status, MachineStatus::Running);

        let err = orchestrator.wait("m-unknown").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_run_requires_running_machine() {
        let (orchestrator, _dir) = plane(FakeRuntime::default(), idle_policy(), 1).await;

        let request = RunRequest {
            id: "m-1".to_string(),
            code: "print(42)".to_string(),
            language: "python".to_string(),
            variant: "3.11".to_string(),
        };

        let err = orchestrator
            .run("m-unknown", request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let created = orchestrator.create(None).await.expect("create failed");
        let err = orchestrator.run(&created.id, request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_run_proxies_to_guest() {
        let app = Router::new()
            .route("/health", get(|| async { StatusCode::OK }))
            .route(
                "/run",
                post(|| async {
                    Json(RunResponse {
                        message: "ok".to_string(),
                        stdout: "42".to_string(),
                        ..Default::default()
                    })
                }),
            );
        let guest = serve(app).await;
        let (orchestrator, _dir) =
            plane(FakeRuntime::default(), quick_policy(5, 50), guest.port()).await;

        let created = orchestrator.create(None).await.expect("create failed");
        poll_status(&orchestrator, &created.id, MachineStatus::Running).await;

        let request = RunRequest {
            id: created.id.clone(),
            code: "print(42)".to_string(),
            language: "python".to_string(),
            variant: "3.11".to_string(),
        };
        let response = orchestrator
            .run(&created.id, request)
            .await
            .expect("run failed");
        assert_eq!(response.message, "ok");
        assert_eq!(response.stdout, "42");
    }
}
