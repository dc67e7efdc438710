use std::path::PathBuf;
use std::sync::Arc;

use nb_infra::CloudProvider;
use uuid::Uuid;

use crate::docker::DockerConnector;
use crate::lock::{HeldLock, PoolLock};
use crate::policy::{POOL_LOCK_ID, PoolPolicy};
use crate::prepare::HostPreparer;
use crate::proxy::ProxyRouter;
use crate::store::{PoolRecords, RecordStore};

/// External systems the driver talks to.
pub struct Collaborators {
    pub cloud: Arc<dyn CloudProvider>,
    pub docker: Arc<dyn DockerConnector>,
    pub preparer: Arc<dyn HostPreparer>,
    pub proxy: Arc<dyn ProxyRouter>,
    pub store: Arc<dyn RecordStore>,
    pub lock: Arc<dyn PoolLock>,
}

/// Deployment values the driver needs besides the backend config.
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub policy: PoolPolicy,
    /// Public address of the proxy, used in session endpoints.
    pub public_ipv4: String,
    pub external_https_port: u16,
    /// `TZ` passed to session containers.
    pub timezone: String,
    /// Authorized on new hosts for the preparer.
    pub ssh_public_key: String,
    /// Holds the local housekeeping lock file.
    pub runtime_dir: PathBuf,
}

pub struct PoolDriver {
    pub(crate) cloud: Arc<dyn CloudProvider>,
    pub(crate) docker: Arc<dyn DockerConnector>,
    pub(crate) preparer: Arc<dyn HostPreparer>,
    pub(crate) proxy: Arc<dyn ProxyRouter>,
    pub(crate) records: PoolRecords,
    pub(crate) lock: Arc<dyn PoolLock>,
    pub(crate) settings: DriverSettings,
    instance_id: String,
}

impl PoolDriver {
    pub fn new(collaborators: Collaborators, settings: DriverSettings) -> Self {
        Self {
            cloud: collaborators.cloud,
            docker: collaborators.docker,
            preparer: collaborators.preparer,
            proxy: collaborators.proxy,
            records: PoolRecords::new(collaborators.store),
            lock: collaborators.lock,
            settings,
            instance_id: Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn records(&self) -> &PoolRecords {
        &self.records
    }

    pub fn pool_lock(&self) -> &Arc<dyn PoolLock> {
        &self.lock
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Lock owner tag for one operation of this process.
    pub(crate) fn owner(&self, operation: &str) -> String {
        format!("{}/{operation}", self.instance_id)
    }

    /// Run `op` while holding the pool lock. The lock is released whatever
    /// `op` returns, and also when the caller drops this future mid-way.
    pub(crate) async fn with_pool_lock<T, F>(&self, owner: &str, op: F) -> crate::Result<T>
    where
        F: Future<Output = crate::Result<T>>,
    {
        let held = HeldLock::acquire(
            self.lock.clone(),
            POOL_LOCK_ID,
            owner,
            self.settings.policy.lock_retry_interval,
        )
        .await?;
        let result = op.await;
        held.release().await;
        result
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
