use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use openstack_api::{
    BlockDeviceMapping, CreateServerRequest, CreateVolumeRequest, Credentials, Networks,
    OpenStackClient, SecurityGroupRef, SecurityGroupRule,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::types::{AddressData, HostSpec, NetworkChoice, ProvisionedHost, ServerId};
use crate::{CloudProvider, Error, ProviderName, Result};

const SECURITY_GROUP_DESCRIPTION: &str = "Security group generated by nbpool";

/// Poll budget for resources that become ready asynchronously.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            attempts: 10,
        }
    }
}

/// Credential file layout shared with the OpenStack CLI `openrc` names.
#[derive(Debug, Deserialize)]
struct CredentialStore {
    #[serde(rename = "OS_USERNAME")]
    username: String,
    #[serde(rename = "OS_PASSWORD")]
    password: String,
    #[serde(rename = "OS_AUTH_URL")]
    auth_url: String,
    #[serde(rename = "OS_PROJECT_NAME", alias = "OS_TENANT_NAME")]
    project_name: String,
    #[serde(rename = "OS_USER_DOMAIN_NAME", default)]
    user_domain_name: Option<String>,
    #[serde(rename = "OS_PROJECT_DOMAIN_NAME", default)]
    project_domain_name: Option<String>,
    #[serde(rename = "OS_REGION_NAME", default)]
    region: Option<String>,
}

impl From<CredentialStore> for Credentials {
    fn from(s: CredentialStore) -> Self {
        Self {
            auth_url: s.auth_url,
            username: s.username,
            password: s.password,
            project_name: s.project_name,
            user_domain_name: s.user_domain_name.unwrap_or_else(|| "Default".into()),
            project_domain_name: s.project_domain_name.unwrap_or_else(|| "Default".into()),
            region: s.region,
        }
    }
}

/// Load credentials from a JSON credential store file.
pub fn credentials_from_file(path: &Path) -> Result<Credentials> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))?;
    let store: CredentialStore = serde_json::from_str(&raw)
        .map_err(|e| Error::Credentials(format!("{}: {e}", path.display())))?;
    Ok(store.into())
}

fn credentials_from_env() -> Result<Credentials> {
    let var = |key: &str| std::env::var(key).map_err(|_| Error::MissingEnv(key.into()));

    Ok(Credentials {
        auth_url: var("OS_AUTH_URL")?,
        username: var("OS_USERNAME")?,
        password: var("OS_PASSWORD")?,
        project_name: var("OS_PROJECT_NAME").or_else(|_| var("OS_TENANT_NAME"))?,
        user_domain_name: var("OS_USER_DOMAIN_NAME").unwrap_or_else(|_| "Default".into()),
        project_domain_name: var("OS_PROJECT_DOMAIN_NAME").unwrap_or_else(|_| "Default".into()),
        region: var("OS_REGION_NAME").ok(),
    })
}

/// Resources created so far during one provision, for revert.
#[derive(Debug, Default)]
struct Created {
    keypair: Option<String>,
    security_group: Option<String>,
    volumes: Vec<String>,
    server: Option<String>,
}

/// OpenStack provider backed by `openstack-api`.
pub struct OpenStackProvider {
    client: OpenStackClient,
    poll: PollPolicy,
}

impl OpenStackProvider {
    pub fn new(client: OpenStackClient, poll: PollPolicy) -> Self {
        Self { client, poll }
    }

    /// Create from env vars:
    ///
    /// - `M2M_CREDENTIAL_STORE` (path to a JSON file with `OS_*` keys), or
    /// - `OS_AUTH_URL`, `OS_USERNAME`, `OS_PASSWORD`, `OS_PROJECT_NAME`
    ///   (or `OS_TENANT_NAME`), optional domain and region names
    /// - `OPENSTACK_POLL_INTERVAL_SECS` (default: 30)
    /// - `OPENSTACK_POLL_ATTEMPTS` (default: 10)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let credentials = match std::env::var("M2M_CREDENTIAL_STORE") {
            Ok(path) if !path.is_empty() => credentials_from_file(Path::new(&path))?,
            _ => credentials_from_env()?,
        };

        let mut poll = PollPolicy::default();
        if let Some(secs) = std::env::var("OPENSTACK_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            poll.interval = Duration::from_secs(secs);
        }
        if let Some(n) = std::env::var("OPENSTACK_POLL_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
        {
            poll.attempts = n;
        }

        Ok(Self::new(OpenStackClient::new(credentials), poll))
    }

    async fn wait_for<T, F, Fut>(&self, what: &'static str, id: &str, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        for attempt in 0..self.poll.attempts {
            if let Some(v) = probe().await? {
                return Ok(v);
            }
            debug!(what, id, attempt, "waiting");
            tokio::time::sleep(self.poll.interval).await;
        }
        Err(Error::Timeout {
            what,
            id: id.to_string(),
        })
    }

    async fn wait_volume_available(&self, volume_id: &str) -> Result<()> {
        self.wait_for("volume", volume_id, move || async move {
            let v = self.client.get_volume(volume_id).await?;
            match v.status.as_str() {
                "available" => Ok(Some(())),
                "error" => Err(Error::Provisioning(format!("volume {volume_id} went to error"))),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn create_security_group(&self, spec: &HostSpec, created: &mut Created) -> Result<()> {
        let group = self
            .client
            .create_security_group(&spec.display_name, SECURITY_GROUP_DESCRIPTION)
            .await?;
        created.security_group = Some(group.id.clone());

        let Some(master_name) = &spec.master_sg else {
            return Ok(());
        };
        let master = self.client.find_security_group(master_name).await?;

        for (protocol, ports) in [("tcp", Some((1, 65535))), ("udp", Some((1, 65535))), ("icmp", None)] {
            let rule = SecurityGroupRule {
                security_group_id: group.id.clone(),
                direction: "ingress".into(),
                ethertype: "IPv4".into(),
                protocol: protocol.into(),
                port_range_min: ports.map(|(lo, _)| lo),
                port_range_max: ports.map(|(_, hi)| hi),
                remote_group_id: Some(master.id.clone()),
            };
            self.client.create_security_group_rule(&rule).await?;
        }

        info!(security_group = %group.id, master = %master.id, "openstack: security group created");
        Ok(())
    }

    async fn create_volume(
        &self,
        name: String,
        size: u32,
        image_ref: Option<String>,
        volume_type: Option<String>,
        created: &mut Created,
    ) -> Result<String> {
        let volume = self
            .client
            .create_volume(&CreateVolumeRequest {
                name,
                size,
                image_ref,
                volume_type,
            })
            .await?;
        created.volumes.push(volume.id.clone());
        self.wait_volume_available(&volume.id).await?;
        Ok(volume.id)
    }

    async fn allocate_public_ip(&self, server_id: &str) -> Result<String> {
        let ip = match self.client.list_unassigned_floating_ips().await?.into_iter().next() {
            Some(ip) => ip,
            None => {
                debug!("no free floating IPs left, allocating one");
                let net = self.client.external_network().await?;
                self.client.create_floating_ip(&net.id).await?
            }
        };

        let port = self
            .client
            .list_server_ports(server_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Provisioning(format!("server {server_id} has no ports")))?;

        let ip = self.client.associate_floating_ip(&ip.id, &port.id).await?;
        Ok(ip.floating_ip_address)
    }

    async fn provision_steps(&self, spec: &HostSpec, created: &mut Created) -> Result<ProvisionedHost> {
        let image = self.client.find_image(&spec.image).await?;
        let flavor = self.client.find_flavor(&spec.flavor).await?;

        self.client
            .create_keypair(&spec.display_name, &spec.public_key)
            .await?;
        created.keypair = Some(spec.display_name.clone());

        self.create_security_group(spec, created).await?;

        let root_volume = if spec.root_volume_size > 0 {
            let name = format!("{}-root", spec.display_name);
            Some(
                self.create_volume(name, spec.root_volume_size, Some(image.id.clone()), None, created)
                    .await?,
            )
        } else {
            None
        };

        let data_volume = if spec.data_volume_size > 0 {
            let name = format!("{}-data", spec.display_name);
            Some(
                self.create_volume(
                    name,
                    spec.data_volume_size,
                    None,
                    spec.data_volume_type.clone(),
                    created,
                )
                .await?,
            )
        } else {
            None
        };

        let mut security_groups = vec![SecurityGroupRef {
            name: spec.display_name.clone(),
        }];
        security_groups.extend(spec.extra_sgs.iter().map(|name| SecurityGroupRef { name: name.clone() }));

        let block_device_mapping_v2 = root_volume
            .iter()
            .map(|id| BlockDeviceMapping {
                boot_index: 0,
                uuid: id.clone(),
                source_type: "volume".into(),
                destination_type: "volume".into(),
                delete_on_termination: true,
            })
            .collect::<Vec<_>>();

        let server = self
            .client
            .create_server(&CreateServerRequest {
                name: spec.display_name.clone(),
                image_ref: root_volume.is_none().then(|| image.id.clone()),
                flavor_ref: flavor.id,
                key_name: spec.display_name.clone(),
                security_groups,
                networks: match &spec.network {
                    NetworkChoice::Auto => Networks::Auto,
                    NetworkChoice::Id(id) => Networks::Id(id.clone()),
                },
                block_device_mapping_v2,
                user_data: None,
            })
            .await?;
        created.server = Some(server.id.clone());
        info!(server_id = %server.id, name = %spec.display_name, "openstack: server created");

        let server_id = server.id.as_str();
        let private_ip = self
            .wait_for("server", server_id, move || async move {
                let s = self.client.get_server(server_id).await?;
                if s.is_error() {
                    return Err(Error::Provisioning(format!("server {} went to ERROR", s.id)));
                }
                Ok(s.is_active().then(|| s.fixed_ipv4().map(str::to_string)).flatten())
            })
            .await?;

        let public_ip = if spec.allocate_public_ip {
            Some(self.allocate_public_ip(&server.id).await?)
        } else {
            None
        };

        if let Some(volume_id) = &data_volume {
            debug!(server_id = %server.id, volume_id, "openstack: attaching data volume");
            self.client.attach_volume(&server.id, volume_id).await?;
        }

        // The key is only needed at boot.
        if let Err(e) = self.client.delete_keypair(&spec.display_name).await {
            warn!(error = %e, "openstack: could not remove boot keypair");
        }
        created.keypair = None;

        Ok(ProvisionedHost {
            server_id: ServerId(server.id),
            address_data: AddressData { private_ip, public_ip },
        })
    }

    /// Best-effort removal of partially created resources, newest first.
    async fn revert(&self, created: &Created) {
        if let Some(id) = &created.server {
            if let Err(e) = self.client.delete_server(id).await {
                warn!(server_id = %id, error = %e, "revert: deleting server failed");
            } else {
                let gone = self
                    .wait_for("server deletion", id, move || async move {
                        match self.client.get_server(id).await {
                            Err(e) if e.is_not_found() => Ok(Some(())),
                            Err(e) => Err(e.into()),
                            Ok(_) => Ok(None),
                        }
                    })
                    .await;
                if let Err(e) = gone {
                    warn!(server_id = %id, error = %e, "revert: server still present");
                }
            }
        }
        for id in created.volumes.iter().rev() {
            if let Err(e) = self.client.delete_volume(id).await {
                warn!(volume_id = %id, error = %e, "revert: deleting volume failed");
            }
        }
        if let Some(id) = &created.security_group {
            if let Err(e) = self.client.delete_security_group(id).await {
                warn!(security_group = %id, error = %e, "revert: deleting security group failed");
            }
        }
        if let Some(name) = &created.keypair {
            if let Err(e) = self.client.delete_keypair(name).await {
                warn!(keypair = %name, error = %e, "revert: deleting keypair failed");
            }
        }
    }
}

#[async_trait]
impl CloudProvider for OpenStackProvider {
    async fn provision(&self, spec: &HostSpec) -> Result<ProvisionedHost> {
        let mut created = Created::default();
        match self.provision_steps(spec, &mut created).await {
            Ok(host) => Ok(host),
            Err(e) => {
                warn!(name = %spec.display_name, error = %e, "openstack: provisioning failed, reverting");
                self.revert(&created).await;
                Err(e)
            }
        }
    }

    async fn deprovision(&self, id: &ServerId, delete_attached_volumes: bool) -> Result<()> {
        let server = match self.client.get_server(&id.0).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => {
                warn!(server_id = %id, "openstack: server already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.client.delete_server(&id.0).await?;
        self.wait_for("server deletion", &id.0, move || async move {
            match self.client.get_server(&id.0).await {
                Err(e) if e.is_not_found() => Ok(Some(())),
                Err(e) => Err(e.into()),
                Ok(_) => Ok(None),
            }
        })
        .await?;
        info!(server_id = %id, "openstack: server deleted");

        if delete_attached_volumes {
            for volume in &server.volumes_attached {
                self.wait_for("volume detach", &volume.id, move || async move {
                    match self.client.get_volume(&volume.id).await {
                        Ok(v) if v.status == "available" || v.status == "error" => Ok(Some(())),
                        Ok(_) => Ok(None),
                        Err(e) if e.is_not_found() => Ok(Some(())),
                        Err(e) => Err(e.into()),
                    }
                })
                .await?;
                self.client.delete_volume(&volume.id).await?;
                debug!(volume_id = %volume.id, "openstack: volume deleted");
            }
        }

        if let Some(name) = &server.name {
            for group in self.client.find_security_groups(name).await? {
                if let Err(e) = self.client.delete_security_group(&group.id).await {
                    warn!(security_group = %group.id, error = %e, "openstack: could not delete security group");
                }
            }
            if let Err(e) = self.client.delete_keypair(name).await {
                debug!(keypair = %name, error = %e, "openstack: keypair cleanup failed");
            }
        }

        Ok(())
    }

    fn name(&self) -> ProviderName {
        ProviderName::OpenStack
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn credential_store_accepts_tenant_name_alias() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"OS_PASSWORD": "password", "OS_AUTH_URL": "https://example.org:5000/v3",
                "OS_USERNAME": "username", "OS_TENANT_NAME": "tenant"}}"#
        )
        .unwrap();

        let creds = credentials_from_file(file.path()).unwrap();
        assert_eq!(creds.username, "username");
        assert_eq!(creds.project_name, "tenant");
        assert_eq!(creds.user_domain_name, "Default");
        assert!(creds.region.is_none());
    }

    #[test]
    fn credential_store_missing_keys_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"OS_USERNAME": "username"}}"#).unwrap();

        assert!(matches!(
            credentials_from_file(file.path()),
            Err(Error::Credentials(_))
        ));
    }
}
