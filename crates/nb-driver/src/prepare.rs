use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::docker::{DockerConnector, DockerError};
use crate::host::Host;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("could not run ansible-playbook: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("ansible-playbook exited with {status:?}: {stderr_tail}")]
    Failed { status: Option<i32>, stderr_tail: String },

    #[error("image catalog {}: {source}", .path.display())]
    Catalog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("docker: {0}")]
    Docker(#[from] DockerError),
}

/// Brings a freshly spawned host to readiness.
#[async_trait]
pub trait HostPreparer: Send + Sync + 'static {
    async fn prepare(&self, host: &Host, config: &BackendConfig) -> Result<(), PrepareError>;
}

/// One preloadable image archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    pub name: String,
    pub archive: PathBuf,
}

/// Image archives in `dir`, sorted by name. `org.image.img` holds image
/// `org/image`.
pub fn image_catalog(dir: &Path) -> Result<Vec<CatalogImage>, std::io::Error> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("img") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        images.push(CatalogImage {
            name: stem.replacen('.', "/", 1),
            archive: path.clone(),
        });
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// Runs an Ansible playbook over SSH, then preloads the image catalog.
pub struct AnsiblePreparer {
    pub playbook: PathBuf,
    pub private_key: PathBuf,
    pub remote_user: String,
    pub image_dir: PathBuf,
    docker: Arc<dyn DockerConnector>,
}

impl AnsiblePreparer {
    pub fn new(
        playbook: impl Into<PathBuf>,
        private_key: impl Into<PathBuf>,
        image_dir: impl Into<PathBuf>,
        docker: Arc<dyn DockerConnector>,
    ) -> Self {
        Self {
            playbook: playbook.into(),
            private_key: private_key.into(),
            remote_user: "cloud-user".into(),
            image_dir: image_dir.into(),
            docker,
        }
    }

    fn command(&self, host: &Host, config: &BackendConfig) -> Command {
        let mut cmd = Command::new("ansible-playbook");
        cmd.arg("--inventory")
            .arg(format!("{},", host.private_ip))
            .arg("--user")
            .arg(&self.remote_user)
            .arg("--become")
            .arg("--private-key")
            .arg(&self.private_key);
        if let Some(device) = config.data_volume_device() {
            let extra = serde_json::json!({ "notebook_host_block_dev_path": device });
            cmd.arg("--extra-vars").arg(extra.to_string());
        }
        cmd.arg(&self.playbook)
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .kill_on_drop(true);
        cmd
    }

    async fn run_playbook(&self, host: &Host, config: &BackendConfig) -> Result<(), PrepareError> {
        info!(host_id = %host.id, ip = %host.private_ip, "running configuration playbook");
        let output = self
            .command(host, config)
            .output()
            .await
            .map_err(PrepareError::Spawn)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = if stderr.trim().is_empty() { stdout } else { stderr };
            return Err(PrepareError::Failed {
                status: output.status.code(),
                stderr_tail: tail(&text, STDERR_TAIL_LINES),
            });
        }
        Ok(())
    }
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[async_trait]
impl HostPreparer for AnsiblePreparer {
    async fn prepare(&self, host: &Host, config: &BackendConfig) -> Result<(), PrepareError> {
        self.run_playbook(host, config).await?;

        let images = image_catalog(&self.image_dir).map_err(|source| PrepareError::Catalog {
            path: self.image_dir.clone(),
            source,
        })?;
        let docker = self.docker.connect(&host.docker_url)?;
        for image in &images {
            debug!(host_id = %host.id, image = %image.name, "uploading image");
            docker.load_image(&image.archive).await?;
        }
        info!(host_id = %host.id, images = images.len(), "host prepared");
        Ok(())
    }
}
