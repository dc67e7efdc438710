pub mod hetzner;
pub mod openstack;
pub mod types;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{HostSpec, ProvisionedHost, ServerId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openstack error: {0}")]
    OpenStack(#[from] openstack_api::Error),

    #[error("hetzner api error: {0}")]
    HetznerApi(String),

    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("timed out waiting for {what} {id}")]
    Timeout { what: &'static str, id: String },

    #[error("invalid credentials: {0}")]
    Credentials(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Known IaaS backends for pool hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderName {
    OpenStack,
    Hetzner,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenStack => "openstack",
            Self::Hetzner => "hetzner",
        }
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "openstack" => Ok(Self::OpenStack),
            "hetzner" => Ok(Self::Hetzner),
            other => Err(Error::UnknownProvider(other.to_string())),
        }
    }
}

/// Backend-agnostic interface for creating and destroying pool hosts.
///
/// Each provider owns its own credentials, loaded from the environment at
/// construction. Errors are returned, never encoded in a success value.
#[async_trait]
pub trait CloudProvider: Send + Sync + 'static {
    /// Boot a host and wait until it has a reachable private address.
    async fn provision(&self, spec: &HostSpec) -> Result<ProvisionedHost>;

    /// Destroy a host. A host that no longer exists is not an error.
    async fn deprovision(&self, id: &ServerId, delete_attached_volumes: bool) -> Result<()>;

    /// Provider identifier.
    fn name(&self) -> ProviderName;
}

/// Build the provider selected by `CLOUD_PROVIDER` (default `openstack`).
pub fn build_provider() -> Result<Arc<dyn CloudProvider>> {
    dotenvy::dotenv().ok();

    let name: ProviderName = std::env::var("CLOUD_PROVIDER")
        .unwrap_or_else(|_| "openstack".into())
        .parse()?;

    let provider: Arc<dyn CloudProvider> = match name {
        ProviderName::OpenStack => Arc::new(openstack::OpenStackProvider::from_env()?),
        ProviderName::Hetzner => Arc::new(hetzner::HetznerProvider::from_env()?),
    };

    tracing::info!(provider = %name, "registered cloud provider");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_round_trip_through_strings() {
        for name in [ProviderName::OpenStack, ProviderName::Hetzner] {
            assert_eq!(name.as_str().parse::<ProviderName>().unwrap(), name);
        }
        assert!(matches!(
            "aws".parse::<ProviderName>(),
            Err(Error::UnknownProvider(p)) if p == "aws"
        ));
    }
}
