use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identity ───────────────────────────────────────────────────────

/// Password credentials for Keystone v3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    #[serde(default = "default_domain")]
    pub project_domain_name: String,
    #[serde(default)]
    pub region: Option<String>,
}

fn default_domain() -> String {
    "Default".into()
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: TokenBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenBody {
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

// ── Images / flavors ───────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageList {
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Flavor {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub vcpus: u32,
    #[serde(default)]
    pub ram: u64,
    #[serde(default)]
    pub disk: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FlavorList {
    pub flavors: Vec<Flavor>,
}

// ── Keypairs ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub(crate) struct CreateKeypairBody<'a> {
    pub keypair: NewKeypair<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewKeypair<'a> {
    pub name: &'a str,
    pub public_key: &'a str,
}

// ── Servers ────────────────────────────────────────────────────────

/// Network selection for a new server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Networks {
    /// Let Nova pick (`"networks": "auto"`).
    Auto,
    /// Attach to one specific network.
    Id(String),
}

impl Serialize for Networks {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Auto => s.serialize_str("auto"),
            Self::Id(uuid) => {
                #[derive(Serialize)]
                struct Net<'a> {
                    uuid: &'a str,
                }
                [Net { uuid }].serialize(s)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityGroupRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockDeviceMapping {
    pub boot_index: i32,
    pub uuid: String,
    pub source_type: String,
    pub destination_type: String,
    pub delete_on_termination: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    #[serde(rename = "imageRef", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(rename = "flavorRef")]
    pub flavor_ref: String,
    pub key_name: String,
    pub security_groups: Vec<SecurityGroupRef>,
    pub networks: Networks,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub block_device_mapping_v2: Vec<BlockDeviceMapping>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateServerBody<'a> {
    pub server: &'a CreateServerRequest,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerEnvelope {
    pub server: Server,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerAddress {
    pub addr: String,
    #[serde(default)]
    pub version: u8,
    #[serde(rename = "OS-EXT-IPS:type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachedVolume {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub addresses: HashMap<String, Vec<ServerAddress>>,
    #[serde(rename = "os-extended-volumes:volumes_attached", default)]
    pub volumes_attached: Vec<AttachedVolume>,
}

impl Server {
    pub fn is_active(&self) -> bool {
        self.status.as_deref() == Some("ACTIVE")
    }

    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("ERROR")
    }

    /// First fixed IPv4 address on any network.
    pub fn fixed_ipv4(&self) -> Option<&str> {
        self.addresses
            .values()
            .flatten()
            .find(|a| a.version == 4 && a.kind.as_deref() != Some("floating"))
            .map(|a| a.addr.as_str())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct AttachVolumeBody<'a> {
    #[serde(rename = "volumeAttachment")]
    pub volume_attachment: AttachVolume<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct AttachVolume<'a> {
    #[serde(rename = "volumeId")]
    pub volume_id: &'a str,
}

// ── Volumes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size: u32,
    #[serde(rename = "imageRef", skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateVolumeBody<'a> {
    pub volume: &'a CreateVolumeRequest,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VolumeEnvelope {
    pub volume: Volume,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Volume {
    pub id: String,
    pub status: String,
}

// ── Networking ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupList {
    pub security_groups: Vec<SecurityGroup>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupEnvelope {
    pub security_group: SecurityGroup,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateSecurityGroupBody<'a> {
    pub security_group: NewSecurityGroup<'a>,
}

#[derive(Debug, Serialize)]
pub(crate) struct NewSecurityGroup<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

/// Ingress rule allowing traffic from members of another group.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityGroupRule {
    pub security_group_id: String,
    pub direction: String,
    pub ethertype: String,
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_group_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct CreateRuleBody<'a> {
    pub security_group_rule: &'a SecurityGroupRule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Port {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortList {
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkList {
    pub networks: Vec<Network>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    pub floating_ip_address: String,
    #[serde(default)]
    pub port_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloatingIpList {
    pub floatingips: Vec<FloatingIp>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FloatingIpEnvelope {
    pub floatingip: FloatingIp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn networks_serialize_as_auto_or_list() {
        assert_eq!(serde_json::to_value(Networks::Auto).unwrap(), "auto");
        assert_eq!(
            serde_json::to_value(Networks::Id("net-1".into())).unwrap(),
            serde_json::json!([{ "uuid": "net-1" }])
        );
    }

    #[test]
    fn fixed_ipv4_skips_floating_addresses() {
        let server: Server = serde_json::from_value(serde_json::json!({
            "id": "srv",
            "status": "ACTIVE",
            "addresses": {
                "private": [
                    { "addr": "86.50.1.2", "version": 4, "OS-EXT-IPS:type": "floating" },
                    { "addr": "fe80::1", "version": 6, "OS-EXT-IPS:type": "fixed" },
                    { "addr": "192.168.1.10", "version": 4, "OS-EXT-IPS:type": "fixed" }
                ]
            }
        }))
        .unwrap();
        assert!(server.is_active());
        assert_eq!(server.fixed_ipv4(), Some("192.168.1.10"));
    }
}
