use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ROUTE_FILE_PREFIX: &str = "route_key-";
const PROXY_CONF: &str = "proxy.conf";

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("proxy config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy reload failed: {0}")]
    Reload(String),
}

/// Per-route behaviour requested by the application profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    pub proxy_rewrite: bool,
    pub proxy_redirect: bool,
    pub set_host_header: bool,
    /// Token injected as `Authorization: token <value>`.
    pub bypass_token_authentication: Option<String>,
}

/// Installs and removes public routes `/notebooks/<key>/ -> target`.
#[async_trait]
pub trait ProxyRouter: Send + Sync + 'static {
    async fn add_route(&self, route_key: &str, target: &str, options: &ProxyOptions) -> Result<(), ProxyError>;

    /// Returns `false` if the route did not exist.
    async fn remove_route(&self, route_key: &str) -> Result<bool, ProxyError>;
}

/// nginx `location` block for one route.
pub fn render_route(route_key: &str, target: &str, external_https_port: u16, options: &ProxyOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "location /notebooks/{route_key}/ {{");
    let _ = writeln!(out, "    proxy_pass {target};");
    let _ = writeln!(out, "    proxy_http_version 1.1;");
    let _ = writeln!(out, "    proxy_set_header Upgrade $http_upgrade;");
    let _ = writeln!(out, "    proxy_set_header Connection \"upgrade\";");
    let _ = writeln!(out, "    proxy_read_timeout 86400;");
    if options.proxy_rewrite {
        let _ = writeln!(out, "    rewrite ^/notebooks/{route_key}/(.*)$ /$1 break;");
    }
    if options.proxy_redirect {
        let _ = writeln!(
            out,
            "    proxy_redirect {target} $scheme://$host:{external_https_port}/notebooks/{route_key};"
        );
    }
    if options.set_host_header {
        let _ = writeln!(out, "    proxy_set_header Host $host;");
    }
    if let Some(token) = &options.bypass_token_authentication {
        let _ = writeln!(out, "    proxy_set_header Authorization \"token {token}\";");
    }
    out.push_str("}\n");
    out
}

/// Route store for an nginx front end: one snippet file per route plus a
/// concatenated `proxy.conf` that nginx includes.
pub struct NginxRouter {
    dir: PathBuf,
    external_https_port: u16,
    reload_command: Option<Vec<String>>,
    guard: Mutex<()>,
}

impl NginxRouter {
    pub fn new(dir: impl Into<PathBuf>, external_https_port: u16) -> Self {
        Self {
            dir: dir.into(),
            external_https_port,
            reload_command: None,
            guard: Mutex::new(()),
        }
    }

    /// Command run after every change, e.g. `nginx -s reload`.
    pub fn with_reload_command(mut self, command: Vec<String>) -> Self {
        self.reload_command = (!command.is_empty()).then_some(command);
        self
    }

    fn route_path(&self, route_key: &str) -> PathBuf {
        self.dir.join(format!("{ROUTE_FILE_PREFIX}{route_key}"))
    }

    fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ProxyError + '_ {
        move |source| ProxyError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Rewrite `proxy.conf` from the route files, in name order.
    async fn regenerate(&self) -> Result<(), ProxyError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(Self::io_error(&self.dir))?;
        let mut routes = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(Self::io_error(&self.dir))? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(ROUTE_FILE_PREFIX) {
                routes.push(entry.path());
            }
        }
        routes.sort();

        let mut conf = String::new();
        for path in &routes {
            conf.push_str(&tokio::fs::read_to_string(path).await.map_err(Self::io_error(path))?);
            conf.push('\n');
        }

        let conf_path = self.dir.join(PROXY_CONF);
        let tmp_path = self.dir.join(format!(".{PROXY_CONF}.tmp"));
        tokio::fs::write(&tmp_path, conf).await.map_err(Self::io_error(&tmp_path))?;
        tokio::fs::rename(&tmp_path, &conf_path).await.map_err(Self::io_error(&conf_path))?;

        self.reload().await
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        let Some(command) = &self.reload_command else {
            return Ok(());
        };
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ProxyError::Reload(e.to_string()))?;
        if !output.status.success() {
            return Err(ProxyError::Reload(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        debug!("proxy reloaded");
        Ok(())
    }
}

#[async_trait]
impl ProxyRouter for NginxRouter {
    async fn add_route(&self, route_key: &str, target: &str, options: &ProxyOptions) -> Result<(), ProxyError> {
        let _serial = self.guard.lock().await;
        tokio::fs::create_dir_all(&self.dir).await.map_err(Self::io_error(&self.dir))?;

        let path = self.route_path(route_key);
        let snippet = render_route(route_key, target, self.external_https_port, options);
        tokio::fs::write(&path, snippet).await.map_err(Self::io_error(&path))?;

        self.regenerate().await?;
        info!(route_key, target, "proxy route added");
        Ok(())
    }

    async fn remove_route(&self, route_key: &str) -> Result<bool, ProxyError> {
        let _serial = self.guard.lock().await;
        let path = self.route_path(route_key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(ProxyError::Io { path, source }),
        }

        self.regenerate().await?;
        info!(route_key, "proxy route removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_only_requested_options() {
        let plain = render_route("abc", "http://10.0.0.5:32768", 443, &ProxyOptions::default());
        assert!(plain.starts_with("location /notebooks/abc/ {\n"));
        assert!(plain.contains("proxy_pass http://10.0.0.5:32768;"));
        assert!(plain.contains("proxy_read_timeout 86400;"));
        assert!(!plain.contains("rewrite"));
        assert!(!plain.contains("Authorization"));

        let full = render_route(
            "abc",
            "http://10.0.0.5:32768",
            8443,
            &ProxyOptions {
                proxy_rewrite: true,
                proxy_redirect: true,
                set_host_header: true,
                bypass_token_authentication: Some("sess-1".into()),
            },
        );
        assert!(full.contains("rewrite ^/notebooks/abc/(.*)$ /$1 break;"));
        assert!(full.contains("proxy_redirect http://10.0.0.5:32768 $scheme://$host:8443/notebooks/abc;"));
        assert!(full.contains("proxy_set_header Host $host;"));
        assert!(full.contains("proxy_set_header Authorization \"token sess-1\";"));
    }

    #[tokio::test]
    async fn routes_are_concatenated_into_proxy_conf() {
        let dir = tempfile::tempdir().unwrap();
        let router = NginxRouter::new(dir.path(), 443);

        router
            .add_route("bbb", "http://10.0.0.2:1", &ProxyOptions::default())
            .await
            .unwrap();
        router
            .add_route("aaa", "http://10.0.0.1:1", &ProxyOptions::default())
            .await
            .unwrap();

        let conf = std::fs::read_to_string(dir.path().join(PROXY_CONF)).unwrap();
        let a = conf.find("/notebooks/aaa/").unwrap();
        let b = conf.find("/notebooks/bbb/").unwrap();
        assert!(a < b);

        assert!(router.remove_route("aaa").await.unwrap());
        assert!(!router.remove_route("aaa").await.unwrap());
        let conf = std::fs::read_to_string(dir.path().join(PROXY_CONF)).unwrap();
        assert!(!conf.contains("/notebooks/aaa/"));
        assert!(conf.contains("/notebooks/bbb/"));
    }
}
