//! Typed Rust client for the OpenStack APIs used to run pool hosts.
//!
//! Covers the subset the host-pool driver needs: Keystone v3 password
//! auth, Glance image lookup, Nova flavors/keypairs/servers, Cinder
//! volumes and Neutron security groups, ports and floating IPs.

mod types;

use std::sync::Arc;

use chrono::{Duration, Utc};
use reqwest::Method;
use tokio::sync::Mutex;

pub use types::*;

/// Nova microversion that accepts `"networks": "auto"`.
const COMPUTE_MICROVERSION: &str = "2.37";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("openstack request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("openstack {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("openstack auth failed: {0}")]
    Auth(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api { status, .. } => status.as_u16() == 404,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
enum Service {
    Compute,
    Volume,
    Network,
    Image,
}

impl Service {
    fn catalog_types(self) -> &'static [&'static str] {
        match self {
            Self::Compute => &["compute"],
            Self::Volume => &["volumev3", "block-storage", "volumev2"],
            Self::Network => &["network"],
            Self::Image => &["image"],
        }
    }
}

#[derive(Debug, Clone)]
struct Session {
    token: String,
    expires_at: chrono::DateTime<Utc>,
    compute: String,
    volume: String,
    network: String,
    image: String,
}

impl Session {
    fn base(&self, service: Service) -> &str {
        match service {
            Service::Compute => &self.compute,
            Service::Volume => &self.volume,
            Service::Network => &self.network,
            Service::Image => &self.image,
        }
    }
}

/// Client for one OpenStack project. Tokens are cached and renewed a
/// minute before they expire.
#[derive(Clone)]
pub struct OpenStackClient {
    credentials: Arc<Credentials>,
    http: reqwest::Client,
    session: Arc<Mutex<Option<Session>>>,
}

impl OpenStackClient {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials: Arc::new(credentials),
            http: reqwest::Client::new(),
            session: Arc::new(Mutex::new(None)),
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    /// Like `check` but also treats 404 as success (for delete idempotency).
    async fn check_allow_404(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    async fn session(&self) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if let Some(s) = guard.as_ref() {
            if s.expires_at - Duration::seconds(60) > Utc::now() {
                return Ok(s.clone());
            }
        }
        let fresh = self.authenticate().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn request(&self, method: Method, service: Service, path: &str) -> Result<reqwest::RequestBuilder> {
        let s = self.session().await?;
        let url = format!("{}{path}", s.base(service).trim_end_matches('/'));
        let mut req = self.http.request(method, url).header("X-Auth-Token", &s.token);
        if matches!(service, Service::Compute) {
            req = req.header("X-OpenStack-Nova-API-Version", COMPUTE_MICROVERSION);
        }
        Ok(req)
    }

    // ── Identity ─────────────────────────────────────────────────────

    async fn authenticate(&self) -> Result<Session> {
        let c = &*self.credentials;
        let body = serde_json::json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "name": c.username,
                            "domain": { "name": c.user_domain_name },
                            "password": c.password,
                        }
                    }
                },
                "scope": {
                    "project": {
                        "name": c.project_name,
                        "domain": { "name": c.project_domain_name },
                    }
                }
            }
        });

        let url = format!("{}/auth/tokens", c.auth_url.trim_end_matches('/'));
        let resp = self.http.post(url).json(&body).send().await?;
        let resp = Self::check(resp, "create token").await?;

        let token = resp
            .headers()
            .get("X-Subject-Token")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::Auth("response carried no X-Subject-Token".into()))?;

        let parsed: TokenResponse = resp.json().await?;
        let endpoint = |service: Service| -> Result<String> {
            parsed
                .token
                .catalog
                .iter()
                .filter(|e| service.catalog_types().contains(&e.kind.as_str()))
                .flat_map(|e| e.endpoints.iter())
                .find(|ep| {
                    ep.interface == "public"
                        && match (&c.region, &ep.region) {
                            (Some(want), Some(have)) => want == have,
                            _ => true,
                        }
                })
                .map(|ep| ep.url.clone())
                .ok_or_else(|| Error::Auth(format!("no public {service:?} endpoint in catalog")))
        };

        Ok(Session {
            compute: endpoint(Service::Compute)?,
            volume: endpoint(Service::Volume)?,
            network: format!("{}/v2.0", endpoint(Service::Network)?.trim_end_matches('/')),
            image: format!("{}/v2", endpoint(Service::Image)?.trim_end_matches('/')),
            expires_at: parsed.token.expires_at,
            token,
        })
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn find_image(&self, name: &str) -> Result<Image> {
        let resp = self
            .request(Method::GET, Service::Image, "/images")
            .await?
            .query(&[("name", name)])
            .send()
            .await?;

        let list: ImageList = Self::check(resp, "list images").await?.json().await?;
        list.images.into_iter().next().ok_or_else(|| Error::NotFound {
            kind: "image",
            name: name.to_string(),
        })
    }

    // ── Flavors ──────────────────────────────────────────────────────

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        let resp = self
            .request(Method::GET, Service::Compute, "/flavors/detail")
            .await?
            .send()
            .await?;

        let list: FlavorList = Self::check(resp, "list flavors").await?.json().await?;
        Ok(list.flavors)
    }

    pub async fn find_flavor(&self, name: &str) -> Result<Flavor> {
        self.list_flavors()
            .await?
            .into_iter()
            .find(|f| f.name == name)
            .ok_or_else(|| Error::NotFound {
                kind: "flavor",
                name: name.to_string(),
            })
    }

    // ── Keypairs ─────────────────────────────────────────────────────

    pub async fn create_keypair(&self, name: &str, public_key: &str) -> Result<()> {
        let body = CreateKeypairBody {
            keypair: NewKeypair { name, public_key },
        };
        let resp = self
            .request(Method::POST, Service::Compute, "/os-keypairs")
            .await?
            .json(&body)
            .send()
            .await?;

        Self::check(resp, "create keypair").await?;
        Ok(())
    }

    pub async fn delete_keypair(&self, name: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, Service::Compute, &format!("/os-keypairs/{name}"))
            .await?
            .send()
            .await?;

        Self::check_allow_404(resp, "delete keypair").await?;
        Ok(())
    }

    // ── Servers ──────────────────────────────────────────────────────

    pub async fn create_server(&self, req: &CreateServerRequest) -> Result<Server> {
        let resp = self
            .request(Method::POST, Service::Compute, "/servers")
            .await?
            .json(&CreateServerBody { server: req })
            .send()
            .await?;

        let env: ServerEnvelope = Self::check(resp, "create server").await?.json().await?;
        Ok(env.server)
    }

    pub async fn get_server(&self, server_id: &str) -> Result<Server> {
        let resp = self
            .request(Method::GET, Service::Compute, &format!("/servers/{server_id}"))
            .await?
            .send()
            .await?;

        let env: ServerEnvelope = Self::check(resp, "get server").await?.json().await?;
        Ok(env.server)
    }

    pub async fn delete_server(&self, server_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, Service::Compute, &format!("/servers/{server_id}"))
            .await?
            .send()
            .await?;

        Self::check_allow_404(resp, "delete server").await?;
        Ok(())
    }

    pub async fn attach_volume(&self, server_id: &str, volume_id: &str) -> Result<()> {
        let body = AttachVolumeBody {
            volume_attachment: AttachVolume { volume_id },
        };
        let resp = self
            .request(
                Method::POST,
                Service::Compute,
                &format!("/servers/{server_id}/os-volume_attachments"),
            )
            .await?
            .json(&body)
            .send()
            .await?;

        Self::check(resp, "attach volume").await?;
        Ok(())
    }

    // ── Volumes ──────────────────────────────────────────────────────

    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Volume> {
        let resp = self
            .request(Method::POST, Service::Volume, "/volumes")
            .await?
            .json(&CreateVolumeBody { volume: req })
            .send()
            .await?;

        let env: VolumeEnvelope = Self::check(resp, "create volume").await?.json().await?;
        Ok(env.volume)
    }

    pub async fn get_volume(&self, volume_id: &str) -> Result<Volume> {
        let resp = self
            .request(Method::GET, Service::Volume, &format!("/volumes/{volume_id}"))
            .await?
            .send()
            .await?;

        let env: VolumeEnvelope = Self::check(resp, "get volume").await?.json().await?;
        Ok(env.volume)
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, Service::Volume, &format!("/volumes/{volume_id}"))
            .await?
            .send()
            .await?;

        Self::check_allow_404(resp, "delete volume").await?;
        Ok(())
    }

    // ── Security groups ──────────────────────────────────────────────

    pub async fn find_security_group(&self, name: &str) -> Result<SecurityGroup> {
        self.find_security_groups(name)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound {
                kind: "security group",
                name: name.to_string(),
            })
    }

    pub async fn find_security_groups(&self, name: &str) -> Result<Vec<SecurityGroup>> {
        let resp = self
            .request(Method::GET, Service::Network, "/security-groups")
            .await?
            .query(&[("name", name)])
            .send()
            .await?;

        let list: SecurityGroupList = Self::check(resp, "list security groups").await?.json().await?;
        Ok(list.security_groups)
    }

    pub async fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let body = CreateSecurityGroupBody {
            security_group: NewSecurityGroup { name, description },
        };
        let resp = self
            .request(Method::POST, Service::Network, "/security-groups")
            .await?
            .json(&body)
            .send()
            .await?;

        let env: SecurityGroupEnvelope = Self::check(resp, "create security group").await?.json().await?;
        Ok(env.security_group)
    }

    pub async fn create_security_group_rule(&self, rule: &SecurityGroupRule) -> Result<()> {
        let resp = self
            .request(Method::POST, Service::Network, "/security-group-rules")
            .await?
            .json(&CreateRuleBody { security_group_rule: rule })
            .send()
            .await?;

        Self::check(resp, "create security group rule").await?;
        Ok(())
    }

    pub async fn delete_security_group(&self, group_id: &str) -> Result<()> {
        let resp = self
            .request(Method::DELETE, Service::Network, &format!("/security-groups/{group_id}"))
            .await?
            .send()
            .await?;

        Self::check_allow_404(resp, "delete security group").await?;
        Ok(())
    }

    // ── Floating IPs ─────────────────────────────────────────────────

    pub async fn list_server_ports(&self, server_id: &str) -> Result<Vec<Port>> {
        let resp = self
            .request(Method::GET, Service::Network, "/ports")
            .await?
            .query(&[("device_id", server_id)])
            .send()
            .await?;

        let list: PortList = Self::check(resp, "list ports").await?.json().await?;
        Ok(list.ports)
    }

    pub async fn external_network(&self) -> Result<Network> {
        let resp = self
            .request(Method::GET, Service::Network, "/networks")
            .await?
            .query(&[("router:external", "true")])
            .send()
            .await?;

        let list: NetworkList = Self::check(resp, "list networks").await?.json().await?;
        list.networks.into_iter().next().ok_or_else(|| Error::NotFound {
            kind: "network",
            name: "router:external".into(),
        })
    }

    pub async fn list_unassigned_floating_ips(&self) -> Result<Vec<FloatingIp>> {
        let resp = self
            .request(Method::GET, Service::Network, "/floatingips")
            .await?
            .query(&[("status", "DOWN")])
            .send()
            .await?;

        let list: FloatingIpList = Self::check(resp, "list floating ips").await?.json().await?;
        Ok(list.floatingips.into_iter().filter(|ip| ip.port_id.is_none()).collect())
    }

    pub async fn create_floating_ip(&self, network_id: &str) -> Result<FloatingIp> {
        let body = serde_json::json!({ "floatingip": { "floating_network_id": network_id } });
        let resp = self
            .request(Method::POST, Service::Network, "/floatingips")
            .await?
            .json(&body)
            .send()
            .await?;

        let env: FloatingIpEnvelope = Self::check(resp, "create floating ip").await?.json().await?;
        Ok(env.floatingip)
    }

    pub async fn associate_floating_ip(&self, floating_ip_id: &str, port_id: &str) -> Result<FloatingIp> {
        let body = serde_json::json!({ "floatingip": { "port_id": port_id } });
        let resp = self
            .request(Method::PUT, Service::Network, &format!("/floatingips/{floating_ip_id}"))
            .await?
            .json(&body)
            .send()
            .await?;

        let env: FloatingIpEnvelope = Self::check(resp, "associate floating ip").await?.json().await?;
        Ok(env.floatingip)
    }
}
