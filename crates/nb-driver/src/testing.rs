//! In-memory collaborators for exercising the driver without an IaaS,
//! Docker daemons or nginx.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use nb_infra::types::{AddressData, HostSpec, ProvisionedHost, ServerId};
use nb_infra::{CloudProvider, ProviderName};

use crate::config::BackendConfig;
use crate::docker::{ContainerSpec, ContainerSummary, DockerApi, DockerConnector, DockerError, PortMapping};
use crate::driver::{Collaborators, DriverSettings, PoolDriver};
use crate::host::Host;
use crate::lock::MemoryPoolLock;
use crate::placer::{AppProfile, ProxySettings, SessionRequest};
use crate::policy::PoolPolicy;
use crate::prepare::{HostPreparer, PrepareError};
use crate::proxy::{ProxyError, ProxyOptions, ProxyRouter};
use crate::store::MemoryRecordStore;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Cloud ───────────────────────────────────────────────────────────

/// Hands out servers `srv-N` with private address `10.0.0.N`.
#[derive(Default)]
pub struct FakeCloud {
    next: AtomicU32,
    fail_next: AtomicBool,
    provisioned: Mutex<Vec<HostSpec>>,
    deprovisioned: Mutex<Vec<(ServerId, bool)>>,
}

impl FakeCloud {
    pub fn fail_next_provision(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn provisioned(&self) -> Vec<HostSpec> {
        locked(&self.provisioned).clone()
    }

    /// Deprovisioned servers with their `delete_attached_volumes` flag.
    pub fn deprovisioned(&self) -> Vec<(ServerId, bool)> {
        locked(&self.deprovisioned).clone()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn provision(&self, spec: &HostSpec) -> Result<ProvisionedHost, nb_infra::Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(nb_infra::Error::Provisioning(format!("{}: quota exceeded", spec.display_name)));
        }
        let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        locked(&self.provisioned).push(spec.clone());
        Ok(ProvisionedHost {
            server_id: ServerId(format!("srv-{n}")),
            address_data: AddressData {
                private_ip: format!("10.0.0.{n}"),
                public_ip: None,
            },
        })
    }

    async fn deprovision(&self, server_id: &ServerId, delete_attached_volumes: bool) -> Result<(), nb_infra::Error> {
        locked(&self.deprovisioned).push((server_id.clone(), delete_attached_volumes));
        Ok(())
    }

    fn name(&self) -> ProviderName {
        ProviderName::OpenStack
    }
}

// ── Docker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FakeContainer {
    id: String,
    name: String,
    labels: HashMap<String, String>,
    host_port: u16,
    running: bool,
    logs: String,
}

/// One fake daemon.
pub struct FakeDocker {
    containers: Mutex<Vec<FakeContainer>>,
    loaded_images: Mutex<Vec<PathBuf>>,
    next_id: AtomicU32,
    next_port: AtomicU16,
    bindings_per_port: AtomicUsize,
    unreachable: AtomicBool,
    removal_status: Mutex<Option<u16>>,
}

impl Default for FakeDocker {
    fn default() -> Self {
        Self {
            containers: Mutex::default(),
            loaded_images: Mutex::default(),
            next_id: AtomicU32::new(1),
            next_port: AtomicU16::new(32768),
            bindings_per_port: AtomicUsize::new(1),
            unreachable: AtomicBool::new(false),
            removal_status: Mutex::default(),
        }
    }
}

impl FakeDocker {
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_bindings_per_port(&self, n: usize) {
        self.bindings_per_port.store(n, Ordering::SeqCst);
    }

    /// Make removals fail with an API error of `status`.
    pub fn fail_removals_with(&self, status: u16) {
        *locked(&self.removal_status) = Some(status);
    }

    /// Put a running container on the daemon directly.
    pub fn add_container(&self, name: &str, labels: HashMap<String, String>) {
        let id = self.container_id();
        locked(&self.containers).push(FakeContainer {
            id,
            name: name.to_string(),
            labels,
            host_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            running: true,
            logs: String::new(),
        });
    }

    /// Host port handed to the next container.
    pub fn set_next_port(&self, port: u16) {
        self.next_port.store(port, Ordering::SeqCst);
    }

    /// Replace the log output of container `name`.
    pub fn set_logs(&self, name: &str, logs: &str) {
        if let Some(c) = locked(&self.containers).iter_mut().find(|c| c.name == name) {
            c.logs = logs.to_string();
        }
    }

    pub fn container_names(&self) -> Vec<String> {
        locked(&self.containers).iter().map(|c| c.name.clone()).collect()
    }

    pub fn loaded_images(&self) -> Vec<PathBuf> {
        locked(&self.loaded_images).clone()
    }

    fn container_id(&self) -> String {
        format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn reachable(&self) -> Result<(), DockerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(DockerError::Transient("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DockerApi for FakeDocker {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        self.reachable()?;
        let mut containers = locked(&self.containers);
        if containers.iter().any(|c| c.name == spec.name) {
            return Err(DockerError::Api {
                status: 409,
                message: format!("name {} already in use", spec.name),
            });
        }
        let id = self.container_id();
        containers.push(FakeContainer {
            id: id.clone(),
            name: spec.name.clone(),
            labels: spec.labels.clone(),
            host_port: self.next_port.fetch_add(1, Ordering::SeqCst),
            running: false,
            logs: String::new(),
        });
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DockerError> {
        self.reachable()?;
        let mut containers = locked(&self.containers);
        let container = containers
            .iter_mut()
            .find(|c| c.id == container_id)
            .ok_or_else(|| DockerError::NotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn port(&self, container_id: &str, _internal_port: u16) -> Result<Vec<PortMapping>, DockerError> {
        self.reachable()?;
        let containers = locked(&self.containers);
        let container = containers
            .iter()
            .find(|c| c.id == container_id)
            .ok_or_else(|| DockerError::NotFound(container_id.to_string()))?;
        let n = self.bindings_per_port.load(Ordering::SeqCst);
        Ok((0..n)
            .map(|i| PortMapping {
                host_ip: Some("0.0.0.0".into()),
                host_port: container.host_port + i as u16,
            })
            .collect())
    }

    async fn containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        self.reachable()?;
        Ok(locked(&self.containers)
            .iter()
            .filter(|c| c.running)
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn remove_container(&self, name: &str, _force: bool) -> Result<(), DockerError> {
        self.reachable()?;
        if let Some(status) = *locked(&self.removal_status) {
            return Err(DockerError::Api {
                status,
                message: "removal refused".into(),
            });
        }
        let mut containers = locked(&self.containers);
        let before = containers.len();
        containers.retain(|c| c.name != name);
        if containers.len() == before {
            return Err(DockerError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String, DockerError> {
        self.reachable()?;
        locked(&self.containers)
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.logs.clone())
            .ok_or_else(|| DockerError::NotFound(name.to_string()))
    }

    async fn load_image(&self, archive: &Path) -> Result<(), DockerError> {
        self.reachable()?;
        locked(&self.loaded_images).push(archive.to_path_buf());
        Ok(())
    }
}

/// Fake daemons keyed by `docker_url`, created on first connect.
#[derive(Default)]
pub struct FakeDockerHosts {
    daemons: Mutex<HashMap<String, Arc<FakeDocker>>>,
}

impl FakeDockerHosts {
    pub fn daemon(&self, docker_url: &str) -> Arc<FakeDocker> {
        locked(&self.daemons)
            .entry(docker_url.to_string())
            .or_default()
            .clone()
    }
}

impl DockerConnector for FakeDockerHosts {
    fn connect(&self, docker_url: &str) -> Result<Arc<dyn DockerApi>, DockerError> {
        if !docker_url.starts_with("https://") {
            return Err(DockerError::InvalidUrl(docker_url.to_string()));
        }
        Ok(self.daemon(docker_url))
    }
}

// ── Preparer ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePreparer {
    failures_left: AtomicU32,
    prepared: Mutex<Vec<String>>,
}

impl FakePreparer {
    /// Fail the next `n` preparations.
    pub fn fail_times(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Ids of hosts prepared successfully.
    pub fn prepared(&self) -> Vec<String> {
        locked(&self.prepared).clone()
    }
}

#[async_trait]
impl HostPreparer for FakePreparer {
    async fn prepare(&self, host: &Host, _config: &BackendConfig) -> Result<(), PrepareError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PrepareError::Failed {
                status: Some(2),
                stderr_tail: format!("UNREACHABLE! {}", host.private_ip),
            });
        }
        locked(&self.prepared).push(host.id.clone());
        Ok(())
    }
}

// ── Proxy ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingProxy {
    routes: Mutex<BTreeMap<String, (String, ProxyOptions)>>,
    add_delay: Mutex<Duration>,
}

impl RecordingProxy {
    /// Make every `add_route` sleep first.
    pub fn delay_adds(&self, delay: Duration) {
        *locked(&self.add_delay) = delay;
    }

    pub fn routes(&self) -> BTreeMap<String, (String, ProxyOptions)> {
        locked(&self.routes).clone()
    }
}

#[async_trait]
impl ProxyRouter for RecordingProxy {
    async fn add_route(&self, route_key: &str, target: &str, options: &ProxyOptions) -> Result<(), ProxyError> {
        let delay = *locked(&self.add_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        locked(&self.routes).insert(route_key.to_string(), (target.to_string(), options.clone()));
        Ok(())
    }

    async fn remove_route(&self, route_key: &str) -> Result<bool, ProxyError> {
        Ok(locked(&self.routes).remove(route_key).is_some())
    }
}

// ── Assembled pool ──────────────────────────────────────────────────

/// Small pool config: 4-slot and 16-slot flavors, target 4, at most 4
/// hosts, starting in shutdown mode like a fresh install.
pub fn test_config() -> BackendConfig {
    BackendConfig {
        free_slot_target: 4,
        max_hosts: 4,
        shutdown_mode: true,
        host_image: "CentOS-7".into(),
        host_flavor_name_small: "small".into(),
        host_flavor_slots_small: 4,
        host_flavor_name_large: "large".into(),
        host_flavor_slots_large: 16,
        host_master_sg: "pb_server".into(),
        host_extra_sgs: "sg-a sg-b".into(),
        host_root_volume_size: 0,
        host_data_volume_factor: 4,
        host_data_volume_type: String::new(),
        host_data_volume_device: "/dev/vdb".into(),
        host_network: "auto".into(),
    }
}

pub fn session_request(session_id: &str, name: &str) -> SessionRequest {
    SessionRequest {
        session_id: session_id.into(),
        name: name.into(),
        profile: AppProfile {
            image: "jupyter/minimal-notebook".into(),
            internal_port: 8888,
            memory_limit: "256m".into(),
            consumed_slots: 1,
            launch_command: None,
            environment_vars: String::new(),
            proxy_options: ProxySettings::default(),
            show_password: false,
        },
    }
}

/// A [`PoolDriver`] wired to fakes, with handles to every fake.
pub struct TestPool {
    pub driver: Arc<PoolDriver>,
    pub cloud: Arc<FakeCloud>,
    pub docker: Arc<FakeDockerHosts>,
    pub preparer: Arc<FakePreparer>,
    pub proxy: Arc<RecordingProxy>,
    pub store: Arc<MemoryRecordStore>,
    pub lock: Arc<MemoryPoolLock>,
    _runtime_dir: tempfile::TempDir,
}

impl TestPool {
    /// Host lifetime 900 s, instant waits, [`test_config`] stored.
    pub async fn new() -> Self {
        let policy = PoolPolicy {
            host_lifetime: 900,
            ..PoolPolicy::immediate()
        };
        Self::with_policy(policy).await
    }

    pub async fn with_policy(policy: PoolPolicy) -> Self {
        let runtime_dir = tempfile::tempdir().expect("create runtime dir");
        let cloud = Arc::new(FakeCloud::default());
        let docker = Arc::new(FakeDockerHosts::default());
        let preparer = Arc::new(FakePreparer::default());
        let proxy = Arc::new(RecordingProxy::default());
        let store = Arc::new(MemoryRecordStore::new());
        let lock = Arc::new(MemoryPoolLock::new());

        let driver = Arc::new(PoolDriver::new(
            Collaborators {
                cloud: cloud.clone(),
                docker: docker.clone(),
                preparer: preparer.clone(),
                proxy: proxy.clone(),
                store: store.clone(),
                lock: lock.clone(),
            },
            DriverSettings {
                policy,
                public_ipv4: "192.0.2.10".into(),
                external_https_port: 8443,
                timezone: "UTC".into(),
                ssh_public_key: "ssh-ed25519 AAAA test".into(),
                runtime_dir: runtime_dir.path().to_path_buf(),
            },
        ));
        driver
            .records()
            .save_config(&test_config())
            .await
            .expect("store test config");

        Self {
            driver,
            cloud,
            docker,
            preparer,
            proxy,
            store,
            lock,
            _runtime_dir: runtime_dir,
        }
    }

    pub async fn set_config(&self, edit: impl FnOnce(&mut BackendConfig)) {
        let mut config = self.driver.records().load_config().await.expect("load config");
        edit(&mut config);
        self.driver.records().save_config(&config).await.expect("save config");
    }

    pub async fn hosts(&self) -> Vec<Host> {
        self.driver.records().load_hosts().await.expect("load hosts")
    }

    pub async fn host(&self, id: &str) -> Host {
        self.hosts()
            .await
            .into_iter()
            .find(|h| h.id == id)
            .unwrap_or_else(|| panic!("host {id} not stored"))
    }

    /// Tick at `now` to spawn a host and at `now + 60` to activate it.
    pub async fn spawn_and_activate(&self, now: i64) -> String {
        use crate::scheduler::HousekeepAction;

        let spawned = self.driver.housekeep_at(now).await.expect("spawn tick");
        let Some(HousekeepAction::Spawned { host_id, .. }) = spawned else {
            panic!("expected a spawn, got {spawned:?}");
        };
        let activated = self.driver.housekeep_at(now + 60).await.expect("activate tick");
        assert_eq!(
            activated,
            Some(HousekeepAction::Activated {
                host_id: host_id.clone()
            })
        );
        host_id
    }
}
