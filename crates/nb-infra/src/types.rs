use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque provider-side server identifier (OpenStack UUID or Hetzner server ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(pub String);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which network a new host is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkChoice {
    Auto,
    Id(String),
}

impl FromStr for NetworkChoice {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Infallible> {
        match s.trim() {
            "" | "auto" => Ok(Self::Auto),
            id => Ok(Self::Id(id.to_string())),
        }
    }
}

/// Everything a provider needs to boot one pool host.
#[derive(Debug, Clone)]
pub struct HostSpec {
    /// Used as server, security group and keypair name.
    pub display_name: String,
    pub image: String,
    pub flavor: String,
    pub public_key: String,
    pub master_sg: Option<String>,
    pub extra_sgs: Vec<String>,
    pub allocate_public_ip: bool,
    /// GiB; 0 boots from the image directly.
    pub root_volume_size: u32,
    /// GiB; 0 means no data volume.
    pub data_volume_size: u32,
    pub data_volume_type: Option<String>,
    pub network: NetworkChoice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressData {
    pub private_ip: String,
    pub public_ip: Option<String>,
}

/// Result of a successful provision.
#[derive(Debug, Clone)]
pub struct ProvisionedHost {
    pub server_id: ServerId,
    pub address_data: AddressData,
}
