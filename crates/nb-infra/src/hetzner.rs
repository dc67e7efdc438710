use std::time::Duration;

use async_trait::async_trait;
use hcloud::apis::configuration::Configuration;
use hcloud::apis::servers_api;
use hcloud::models;
use tracing::{info, warn};

use crate::types::{AddressData, HostSpec, NetworkChoice, ProvisionedHost, ServerId};
use crate::{CloudProvider, Error, ProviderName, Result};

const ADDRESS_POLL_INTERVAL: Duration = Duration::from_secs(5);
const ADDRESS_POLL_ATTEMPTS: u32 = 60;

/// Hetzner Cloud provider using the `hcloud` crate.
///
/// Flavors map to server types and security groups to numeric firewall
/// IDs. Hetzner server types carry local disk, so root and data volume
/// sizes are ignored. Pool hosts must sit on a private network, which is
/// taken from the host spec or `HETZNER_NETWORK_ID`.
pub struct HetznerProvider {
    config: Configuration,
    location: String,
    default_network_id: Option<i64>,
}

impl HetznerProvider {
    /// Create from env vars:
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_LOCATION` (default: `"fsn1"`)
    /// - `HETZNER_NETWORK_ID` (optional, integer)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| Error::MissingEnv("HETZNER_API_TOKEN".into()))?;

        let mut config = Configuration::new();
        config.bearer_access_token = Some(token);

        let location = std::env::var("HETZNER_LOCATION").unwrap_or_else(|_| "fsn1".into());

        let default_network_id = std::env::var("HETZNER_NETWORK_ID")
            .ok()
            .and_then(|s| s.parse::<i64>().ok());

        Ok(Self {
            config,
            location,
            default_network_id,
        })
    }

    /// Cloud-init user data that authorizes the control plane's key for
    /// the preparation user.
    fn cloud_init_user_data(public_key: &str) -> String {
        format!(
            r#"#cloud-config
users:
  - name: cloud-user
    sudo: ALL=(ALL) NOPASSWD:ALL
    shell: /bin/bash
    ssh_authorized_keys:
      - {}
"#,
            public_key.trim()
        )
    }

    fn network_id(&self, choice: &NetworkChoice) -> Result<i64> {
        match choice {
            NetworkChoice::Id(raw) => Self::parse_id(raw),
            NetworkChoice::Auto => self
                .default_network_id
                .ok_or_else(|| Error::MissingEnv("HETZNER_NETWORK_ID".into())),
        }
    }

    /// Extract the private IP from a server's private_net list.
    fn private_ip(server: &models::Server) -> Option<String> {
        server
            .private_net
            .first()
            .and_then(|net| net.ip.clone())
    }

    fn parse_id(raw: &str) -> Result<i64> {
        raw.trim()
            .parse::<i64>()
            .map_err(|_| Error::InvalidId(raw.to_string()))
    }

    fn create_request(
        &self,
        spec: &HostSpec,
        network_id: i64,
        firewalls: Vec<models::CreateServerRequestFirewalls>,
    ) -> models::CreateServerRequest {
        models::CreateServerRequest {
            name: spec.display_name.clone(),
            server_type: spec.flavor.clone(),
            image: spec.image.clone(),
            location: Some(self.location.clone()),
            user_data: Some(Self::cloud_init_user_data(&spec.public_key)),
            networks: Some(vec![network_id]),
            firewalls: (!firewalls.is_empty()).then_some(firewalls),
            ssh_keys: None,
            volumes: None,
            start_after_create: Some(true),
            automount: None,
            datacenter: None,
            labels: None,
            placement_group: None,
            public_net: None,
        }
    }

    async fn wait_private_ip(&self, server_id: i64) -> Result<String> {
        for _ in 0..ADDRESS_POLL_ATTEMPTS {
            let resp = servers_api::get_server(
                &self.config,
                servers_api::GetServerParams { id: server_id },
            )
            .await
            .map_err(|e| Error::HetznerApi(format!("get server: {e}")))?;

            if let Some(ip) = resp.server.as_ref().and_then(|s| Self::private_ip(s)) {
                return Ok(ip);
            }
            tokio::time::sleep(ADDRESS_POLL_INTERVAL).await;
        }
        Err(Error::Timeout {
            what: "server address",
            id: server_id.to_string(),
        })
    }
}

#[async_trait]
impl CloudProvider for HetznerProvider {
    async fn provision(&self, spec: &HostSpec) -> Result<ProvisionedHost> {
        if spec.root_volume_size > 0 || spec.data_volume_size > 0 {
            warn!(name = %spec.display_name, "hetzner: volume sizes ignored, server type disk is used");
        }
        if spec.allocate_public_ip {
            warn!(name = %spec.display_name, "hetzner: public IP allocation not supported, skipping");
        }

        let network_id = self.network_id(&spec.network)?;

        let firewalls = spec
            .master_sg
            .iter()
            .chain(spec.extra_sgs.iter())
            .map(|sg| Self::parse_id(sg).map(|firewall| models::CreateServerRequestFirewalls { firewall }))
            .collect::<Result<Vec<_>>>()?;

        let resp = servers_api::create_server(
            &self.config,
            servers_api::CreateServerParams {
                create_server_request: self.create_request(spec, network_id, firewalls),
            },
        )
        .await
        .map_err(|e| Error::HetznerApi(format!("create server: {e}")))?;

        let server = resp.server;
        info!(server_id = server.id, name = %spec.display_name, "hetzner: server created");

        let private_ip = match Self::private_ip(&server) {
            Some(ip) => ip,
            None => self.wait_private_ip(server.id).await?,
        };

        Ok(ProvisionedHost {
            server_id: ServerId(server.id.to_string()),
            address_data: AddressData {
                private_ip,
                public_ip: None,
            },
        })
    }

    async fn deprovision(&self, id: &ServerId, _delete_attached_volumes: bool) -> Result<()> {
        let server_id = Self::parse_id(&id.0)?;

        if let Err(e) = servers_api::delete_server(
            &self.config,
            servers_api::DeleteServerParams { id: server_id },
        )
        .await
        {
            let msg = format!("{e}");
            if msg.contains("404") {
                warn!(server_id = %id, "hetzner: server already destroyed");
                return Ok(());
            }
            return Err(Error::HetznerApi(format!("delete server: {e}")));
        }

        info!(server_id = %id, "hetzner: server destroyed");
        Ok(())
    }

    fn name(&self) -> ProviderName {
        ProviderName::Hetzner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(default_network_id: Option<i64>) -> HetznerProvider {
        HetznerProvider {
            config: Configuration::new(),
            location: "fsn1".into(),
            default_network_id,
        }
    }

    #[test]
    fn auto_network_falls_back_to_env_default() {
        assert_eq!(provider(Some(42)).network_id(&NetworkChoice::Auto).unwrap(), 42);
        assert!(matches!(
            provider(None).network_id(&NetworkChoice::Auto),
            Err(Error::MissingEnv(_))
        ));
        assert!(matches!(
            provider(None).network_id(&NetworkChoice::Id("net-a".into())),
            Err(Error::InvalidId(_))
        ));
    }

    #[test]
    fn create_request_names_image_type_and_network() {
        let spec = HostSpec {
            display_name: "nb_pool_abc".into(),
            image: "ubuntu-24.04".into(),
            flavor: "cx32".into(),
            public_key: "ssh-ed25519 AAAA pool".into(),
            master_sg: Some("101".into()),
            extra_sgs: vec![],
            allocate_public_ip: false,
            root_volume_size: 0,
            data_volume_size: 0,
            data_volume_type: None,
            network: NetworkChoice::Auto,
        };
        let firewalls = vec![models::CreateServerRequestFirewalls { firewall: 101 }];
        let request = provider(Some(7)).create_request(&spec, 7, firewalls);

        assert_eq!(request.image, "ubuntu-24.04");
        assert_eq!(request.server_type, "cx32");
        assert_eq!(request.networks, Some(vec![7]));
        assert_eq!(request.firewalls.map(|f| f.len()), Some(1));
        assert_eq!(request.location.as_deref(), Some("fsn1"));
    }

    #[test]
    fn cloud_init_authorizes_key_for_cloud_user() {
        let data = HetznerProvider::cloud_init_user_data("ssh-ed25519 AAAA pool\n");
        assert!(data.starts_with("#cloud-config"));
        assert!(data.contains("name: cloud-user"));
        assert!(data.contains("- ssh-ed25519 AAAA pool\n"));
    }
}
