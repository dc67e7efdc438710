use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use nb_driver::{DriverSettings, PoolPolicy};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub control_plane_api_key: String,
    pub housekeep_interval_secs: u64,
    pub public_ipv4: String,
    pub external_https_port: u16,
    pub session_timezone: String,
    pub runtime_dir: PathBuf,
    pub ssh_public_key_file: PathBuf,
    pub ssh_private_key_file: PathBuf,
    pub docker_cert_dir: PathBuf,
    pub prepare_playbook: PathBuf,
    pub image_dir: PathBuf,
    pub proxy_conf_dir: PathBuf,
    pub proxy_reload_command: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let runtime_dir: PathBuf = env::var("RUNTIME_DIR")
            .unwrap_or_else(|_| "/var/lib/nbpool".into())
            .into();
        let path_or = |var: &str, default: PathBuf| env::var(var).map(PathBuf::from).unwrap_or(default);

        Self {
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            listen_addr: env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".into())
                .parse()
                .expect("LISTEN_ADDR must be a valid socket address"),
            control_plane_api_key: env::var("CONTROL_PLANE_API_KEY")
                .expect("CONTROL_PLANE_API_KEY must be set"),
            housekeep_interval_secs: env::var("HOUSEKEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".into())
                .parse()
                .expect("HOUSEKEEP_INTERVAL_SECS must be a valid u64"),
            public_ipv4: env::var("PUBLIC_IPV4").expect("PUBLIC_IPV4 must be set"),
            external_https_port: env::var("EXTERNAL_HTTPS_PORT")
                .unwrap_or_else(|_| "443".into())
                .parse()
                .expect("EXTERNAL_HTTPS_PORT must be a valid port"),
            session_timezone: env::var("SESSION_TIMEZONE").unwrap_or_else(|_| "UTC".into()),
            ssh_public_key_file: path_or("SSH_PUBLIC_KEY_FILE", runtime_dir.join("ssh/id_rsa.pub")),
            ssh_private_key_file: path_or("SSH_PRIVATE_KEY_FILE", runtime_dir.join("ssh/id_rsa")),
            docker_cert_dir: path_or("DOCKER_CERT_DIR", runtime_dir.join("docker-certs")),
            prepare_playbook: path_or("PREPARE_PLAYBOOK", "ansible/notebook_host.yml".into()),
            image_dir: path_or("IMAGE_DIR", runtime_dir.join("images")),
            proxy_conf_dir: path_or("PROXY_CONF_DIR", runtime_dir.join("proxy")),
            proxy_reload_command: env::var("PROXY_RELOAD_COMMAND")
                .map(|c| c.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            runtime_dir,
        }
    }

    pub fn driver_settings(&self, ssh_public_key: String) -> DriverSettings {
        DriverSettings {
            policy: PoolPolicy::default(),
            public_ipv4: self.public_ipv4.clone(),
            external_https_port: self.external_https_port,
            timezone: self.session_timezone.clone(),
            ssh_public_key,
            runtime_dir: self.runtime_dir.clone(),
        }
    }
}
