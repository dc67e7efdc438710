//! Host-pool scheduler and provisioning driver.
//!
//! Keeps a fleet of Docker hosts on an IaaS sized to a free-slot target,
//! places session containers on them and tears sessions down again. All
//! pool mutations happen under one distributed lock.

pub mod config;
pub mod docker;
pub mod driver;
pub mod host;
pub mod lock;
pub mod placer;
pub mod policy;
pub mod prepare;
pub mod proxy;
pub mod reaper;
pub mod scheduler;
pub mod store;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::BackendConfig;
pub use driver::{Collaborators, DriverSettings, PoolDriver};
pub use host::{Host, HostState};
pub use placer::{AppProfile, Placement, ProxySettings, SessionRequest};
pub use policy::PoolPolicy;
pub use reaper::ReapRequest;
pub use scheduler::{HousekeepAction, InactivationReason, PoolStatus};

use docker::DockerError;
use lock::LockError;
use proxy::ProxyError;
use store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cloud provider error: {0}")]
    Cloud(#[from] nb_infra::Error),

    #[error("docker error: {0}")]
    Docker(#[from] DockerError),

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("no capacity left for {requested} slots")]
    NoCapacity { requested: u32 },

    #[error("backend is in shutdown mode")]
    ShuttingDown,

    #[error("port mapping: {0}")]
    PortMapping(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Whether the caller should requeue the request and try again later.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NoCapacity { .. } | Self::ShuttingDown | Self::Docker(DockerError::Transient(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
