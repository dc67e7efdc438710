use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::image::ImportImageOptions;
use bollard::models::HostConfig;
use bollard::{API_DEFAULT_VERSION, Docker};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::policy::DOCKER_CLIENT_TIMEOUT;

/// Container label carrying the slot cost of a session.
pub const SLOTS_LABEL: &str = "slots";

#[derive(Debug, thiserror::Error)]
pub enum DockerError {
    #[error("docker object not found: {0}")]
    NotFound(String),

    #[error("docker daemon unreachable: {0}")]
    Transient(String),

    #[error("docker api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("invalid docker url {0}")]
    InvalidUrl(String),

    #[error("image archive {}: {source}", .path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<bollard::errors::Error> for DockerError {
    fn from(e: bollard::errors::Error) -> Self {
        match e {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => Self::NotFound(message),
            bollard::errors::Error::DockerResponseServerError { status_code, message } => Self::Api {
                status: status_code,
                message,
            },
            bollard::errors::Error::DockerStreamError { error } => Self::Api {
                status: 500,
                message: error,
            },
            other => Self::Transient(other.to_string()),
        }
    }
}

/// Memory and port settings applied to a session container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub mem_limit: i64,
    pub memswap_limit: i64,
    pub publish_all_ports: bool,
}

pub fn create_host_config(mem_limit: i64, memswap_limit: i64, publish_all_ports: bool) -> HostResources {
    HostResources {
        mem_limit,
        memswap_limit,
        publish_all_ports,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub cmd: Option<Vec<String>>,
    pub host_config: HostResources,
}

/// Running container as seen in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Slot cost from the label; absent or unreadable counts as one.
    pub fn slots(&self) -> u32 {
        match self.labels.get(SLOTS_LABEL) {
            None => 1,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(container = %self.id, label = %raw, "unparsable slots label, counting 1");
                1
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: u16,
}

/// Operations the pool needs from one Docker daemon.
#[async_trait]
pub trait DockerApi: Send + Sync {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    async fn start(&self, container_id: &str) -> Result<(), DockerError>;

    /// Host bindings of `internal_port/tcp`.
    async fn port(&self, container_id: &str, internal_port: u16) -> Result<Vec<PortMapping>, DockerError>;

    /// Running containers.
    async fn containers(&self) -> Result<Vec<ContainerSummary>, DockerError>;

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), DockerError>;

    /// Combined stdout and stderr of a container so far.
    async fn logs(&self, name: &str) -> Result<String, DockerError>;

    /// Load an image archive produced by `docker save`.
    async fn load_image(&self, archive: &Path) -> Result<(), DockerError>;
}

/// Opens a [`DockerApi`] for a host's `docker_url`.
pub trait DockerConnector: Send + Sync + 'static {
    fn connect(&self, docker_url: &str) -> Result<Arc<dyn DockerApi>, DockerError>;
}

/// Sum of slot labels over running containers.
pub async fn reserved_slots(docker: &dyn DockerApi) -> Result<u32, DockerError> {
    Ok(docker.containers().await?.iter().map(ContainerSummary::slots).sum())
}

/// Parse a docker size string such as `512m` or `2g` into bytes.
pub fn parse_memory_limit(raw: &str) -> Option<i64> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, multiplier) = match s.char_indices().last()? {
        (i, 'k') => (&s[..i], 1i64 << 10),
        (i, 'm') => (&s[..i], 1 << 20),
        (i, 'g') => (&s[..i], 1 << 30),
        (i, 't') => (&s[..i], 1 << 40),
        _ => (s, 1),
    };
    let value: f64 = digits.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as i64)
}

/// Chunks of an open image archive. A read error ends the stream early;
/// the daemon then rejects the truncated archive.
fn archive_chunks(file: tokio::fs::File, archive: &Path) -> impl Stream<Item = Bytes> + Send + 'static {
    let path = archive.display().to_string();
    ReaderStream::new(file)
        .take_while(move |chunk| {
            if let Err(e) = chunk {
                warn!(archive = %path, error = %e, "image archive read failed");
            }
            std::future::ready(chunk.is_ok())
        })
        .filter_map(|chunk| std::future::ready(chunk.ok()))
}

// ── bollard ─────────────────────────────────────────────────────────

/// TLS connector using client certificates from one directory
/// (`ca.pem`, `cert.pem`, `key.pem`).
pub struct BollardConnector {
    cert_dir: PathBuf,
    timeout: Duration,
}

impl BollardConnector {
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            timeout: DOCKER_CLIENT_TIMEOUT,
        }
    }
}

impl DockerConnector for BollardConnector {
    fn connect(&self, docker_url: &str) -> Result<Arc<dyn DockerApi>, DockerError> {
        let addr = docker_url
            .strip_prefix("https://")
            .or_else(|| docker_url.strip_prefix("tcp://"))
            .ok_or_else(|| DockerError::InvalidUrl(docker_url.to_string()))?;

        let docker = Docker::connect_with_ssl(
            addr,
            &self.cert_dir.join("key.pem"),
            &self.cert_dir.join("cert.pem"),
            &self.cert_dir.join("ca.pem"),
            self.timeout.as_secs(),
            &API_DEFAULT_VERSION,
        )?;
        Ok(Arc::new(BollardDocker { docker }))
    }
}

pub struct BollardDocker {
    docker: Docker,
}

#[async_trait]
impl DockerApi for BollardDocker {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let config = Config {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            env: Some(spec.env.clone()),
            cmd: spec.cmd.clone(),
            host_config: Some(HostConfig {
                memory: Some(spec.host_config.mem_limit),
                memory_swap: Some(spec.host_config.memswap_limit),
                publish_all_ports: Some(spec.host_config.publish_all_ports),
                ..Default::default()
            }),
            ..Default::default()
        };

        let response = self.docker.create_container(Some(options), config).await?;
        debug!(container = %spec.name, id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), DockerError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn port(&self, container_id: &str, internal_port: u16) -> Result<Vec<PortMapping>, DockerError> {
        let info = self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await?;

        let key = format!("{internal_port}/tcp");
        let bindings = info
            .network_settings
            .and_then(|n| n.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .unwrap_or_default();

        Ok(bindings
            .into_iter()
            .filter_map(|b| {
                let host_port = b.host_port?.parse().ok()?;
                Some(PortMapping {
                    host_ip: b.host_ip,
                    host_port,
                })
            })
            .collect())
    }

    async fn containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn remove_container(&self, name: &str, force: bool) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.docker.remove_container(name, Some(options)).await?;
        Ok(())
    }

    async fn logs(&self, name: &str) -> Result<String, DockerError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = std::pin::pin!(self.docker.logs(name, Some(options)));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&String::from_utf8_lossy(&chunk?.into_bytes()));
        }
        Ok(logs)
    }

    async fn load_image(&self, archive: &Path) -> Result<(), DockerError> {
        let file = tokio::fs::File::open(archive).await.map_err(|source| DockerError::Archive {
            path: archive.to_path_buf(),
            source,
        })?;

        let mut progress = self.docker.import_image_stream(
            ImportImageOptions { quiet: true },
            archive_chunks(file, archive),
            None,
        );
        while let Some(step) = progress.next().await {
            let info = step?;
            if let Some(error) = info.error {
                return Err(DockerError::Api {
                    status: 500,
                    message: error,
                });
            }
        }
        debug!(archive = %archive.display(), "image loaded");
        Ok(())
    }
}
