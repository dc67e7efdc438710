use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::docker::{self, ContainerSpec, DockerApi, SLOTS_LABEL};
use crate::driver::{PoolDriver, unix_now};
use crate::host::{self, Host, HostState};
use crate::policy::PoolPolicy;
use crate::proxy::ProxyOptions;

const PROXY_PATH_PLACEHOLDER: &str = "{proxy_path}";
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Proxy behaviour requested by an application profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub proxy_rewrite: bool,
    #[serde(default)]
    pub proxy_redirect: bool,
    #[serde(default)]
    pub set_host_header: bool,
    #[serde(default)]
    pub bypass_token_authentication: bool,
}

/// What to run for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppProfile {
    pub image: String,
    pub internal_port: u16,
    /// Docker size string, e.g. `512m`.
    pub memory_limit: String,
    #[serde(default = "default_consumed_slots")]
    pub consumed_slots: u32,
    /// May contain `{proxy_path}`.
    #[serde(default)]
    pub launch_command: Option<String>,
    /// Space separated `KEY=value` pairs.
    #[serde(default)]
    pub environment_vars: String,
    #[serde(default)]
    pub proxy_options: ProxySettings,
    #[serde(default)]
    pub show_password: bool,
}

fn default_consumed_slots() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
    /// Container name, unique across the pool.
    pub name: String,
    pub profile: AppProfile,
}

/// Where a session ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub host_id: String,
    pub docker_url: String,
    pub proxy_route: String,
    pub mapped_port: u16,
    pub endpoint: String,
    pub container_name: String,
    pub password: Option<String>,
}

impl PoolDriver {
    /// Start a session container on the pool and route it through the proxy.
    pub async fn provision(&self, request: &SessionRequest) -> crate::Result<Placement> {
        self.provision_at(request, unix_now()).await
    }

    pub async fn provision_at(&self, request: &SessionRequest, now: i64) -> crate::Result<Placement> {
        validate(request)?;
        if self.records.load_config().await?.shutdown_mode {
            return Err(crate::Error::ShuttingDown);
        }

        let owner = self.owner("provision");
        let placement = self.with_pool_lock(&owner, self.place_locked(request, now)).await?;

        tokio::time::sleep(self.settings.policy.settle_delay).await;
        Ok(placement)
    }

    /// Log output of a placed session's container.
    pub async fn session_logs(&self, placement: &Placement) -> crate::Result<String> {
        let docker = self.docker.connect(&placement.docker_url)?;
        tracing::debug!(container = %placement.container_name, host_id = %placement.host_id, "fetching session logs");
        Ok(docker.logs(&placement.container_name).await?)
    }

    async fn place_locked(&self, request: &SessionRequest, now: i64) -> crate::Result<Placement> {
        let config = self.records.load_config().await?;
        if config.shutdown_mode {
            return Err(crate::Error::ShuttingDown);
        }

        let mut hosts = self.records.load_hosts().await?;
        let mut unreachable = HashSet::new();
        for host in hosts.iter_mut().filter(|h| h.state == HostState::Active) {
            let counted = match self.docker.connect(&host.docker_url) {
                Ok(api) => docker::reserved_slots(&*api).await,
                Err(e) => Err(e),
            };
            match counted {
                Ok(reserved) => host.set_reserved(reserved),
                Err(e) => {
                    tracing::warn!(host_id = %host.id, error = %e, "skipping unreachable host");
                    unreachable.insert(host.id.clone());
                }
            }
        }
        host::update_lifetimes(
            &mut hosts,
            config.shutdown_mode,
            config.host_flavor_slots_small,
            &self.settings.policy,
            now,
        );

        let slots = request.profile.consumed_slots;
        let target = select_host(&hosts, slots, &self.settings.policy, &unreachable)
            .ok_or(crate::Error::NoCapacity { requested: slots })?;
        tracing::info!(
            session_id = %request.session_id,
            host_id = %target.id,
            slots,
            free = target.free_slots(),
            "placing session"
        );

        let docker = self.docker.connect(&target.docker_url)?;
        self.start_session(&*docker, target, request).await
    }

    async fn start_session(
        &self,
        docker: &dyn DockerApi,
        target: &Host,
        request: &SessionRequest,
    ) -> crate::Result<Placement> {
        let profile = &request.profile;
        let proxy_route = Uuid::new_v4().simple().to_string();

        let spec = container_spec(request, &proxy_route, &self.settings.timezone)?;
        let container_id = docker.create_container(&spec).await?;
        docker.start(&container_id).await?;

        let ports = docker.port(&container_id, profile.internal_port).await?;
        let mapped_port = match ports.as_slice() {
            [only] => only.host_port,
            other => {
                return Err(crate::Error::PortMapping(format!(
                    "expected one binding for {}/tcp on {}, got {}",
                    profile.internal_port,
                    request.name,
                    other.len()
                )));
            }
        };

        let policy = &self.settings.policy;
        if !wait_for_port(&target.private_ip, mapped_port, policy.port_wait, policy.port_probe_interval).await {
            tracing::warn!(
                session_id = %request.session_id,
                host = %target.private_ip,
                port = mapped_port,
                "session port did not open in time, continuing"
            );
        }

        let options = ProxyOptions {
            proxy_rewrite: profile.proxy_options.proxy_rewrite,
            proxy_redirect: profile.proxy_options.proxy_redirect,
            set_host_header: profile.proxy_options.set_host_header,
            bypass_token_authentication: profile
                .proxy_options
                .bypass_token_authentication
                .then(|| request.session_id.clone()),
        };
        let upstream = format!("http://{}:{mapped_port}", target.private_ip);
        self.proxy.add_route(&proxy_route, &upstream, &options).await?;

        let endpoint = format!(
            "https://{}:{}/notebooks/{proxy_route}/",
            self.settings.public_ipv4, self.settings.external_https_port
        );
        tracing::info!(session_id = %request.session_id, %endpoint, "session placed");

        Ok(Placement {
            host_id: target.id.clone(),
            docker_url: target.docker_url.clone(),
            proxy_route,
            mapped_port,
            endpoint,
            container_name: request.name.clone(),
            password: profile.show_password.then(|| request.session_id.clone()),
        })
    }
}

fn validate(request: &SessionRequest) -> crate::Result<()> {
    if request.session_id.trim().is_empty() || request.name.trim().is_empty() {
        return Err(crate::Error::InvalidRequest("session id and name are required".into()));
    }
    // The id ends up inside proxy config and container env.
    if !request
        .session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(crate::Error::InvalidRequest(format!(
            "session id {:?} may only contain letters, digits, '-' and '_'",
            request.session_id
        )));
    }
    if request.profile.consumed_slots == 0 {
        return Err(crate::Error::InvalidRequest("consumed_slots must be at least 1".into()));
    }
    Ok(())
}

/// Pick the host for `slots` new slots: the oldest fresh host with room,
/// else the oldest host with room at all.
pub fn select_host<'a>(
    hosts: &'a [Host],
    slots: u32,
    policy: &PoolPolicy,
    excluded: &HashSet<String>,
) -> Option<&'a Host> {
    let mut candidates: Vec<&Host> = host::active_hosts(hosts)
        .filter(|h| !excluded.contains(&h.id) && h.free_slots() >= slots)
        .collect();
    candidates.sort_by_key(|h| h.spawn_ts);

    candidates
        .iter()
        .find(|h| h.is_fresh(policy))
        .or_else(|| candidates.first())
        .copied()
}

/// Docker create options for one session.
pub fn container_spec(request: &SessionRequest, proxy_route: &str, timezone: &str) -> crate::Result<ContainerSpec> {
    let profile = &request.profile;
    let memory = docker::parse_memory_limit(&profile.memory_limit).ok_or_else(|| {
        crate::Error::InvalidRequest(format!("bad memory limit {:?}", profile.memory_limit))
    })?;

    let mut env: Vec<String> = profile.environment_vars.split_whitespace().map(str::to_string).collect();
    env.push(format!("INSTANCE_ID={}", request.session_id));
    env.push(format!("TZ={timezone}"));

    let cmd = profile.launch_command.as_deref().map(|template| {
        template
            .replace(PROXY_PATH_PLACEHOLDER, &format!("/{proxy_route}"))
            .split_whitespace()
            .map(str::to_string)
            .collect()
    });

    Ok(ContainerSpec {
        name: request.name.clone(),
        image: profile.image.clone(),
        labels: HashMap::from([(SLOTS_LABEL.to_string(), profile.consumed_slots.to_string())]),
        env,
        cmd,
        host_config: docker::create_host_config(memory, memory * 3, true),
    })
}

/// Probe until a TCP connect succeeds or `budget` runs out.
async fn wait_for_port(ip: &str, port: u16, budget: Duration, interval: Duration) -> bool {
    if budget.is_zero() {
        return false;
    }
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let probe = tokio::time::timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((ip, port))).await;
        if matches!(probe, Ok(Ok(_))) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPool, session_request};

    fn host(id: &str, spawn_ts: i64, num_slots: u32, reserved: u32, lifetime_left: i64) -> Host {
        Host {
            id: id.into(),
            provider_id: id.into(),
            docker_url: format!("https://{id}:2376"),
            private_ip: id.into(),
            public_ip: String::new(),
            spawn_ts,
            state: HostState::Active,
            num_slots,
            num_reserved_slots: reserved,
            usage: 0,
            lifetime_tick_ts: 0,
            error_count: 0,
            lifetime_left,
        }
    }

    #[test]
    fn select_prefers_oldest_fresh_host() {
        let policy = PoolPolicy::default();
        let hosts = vec![
            host("young", 300, 4, 0, 14_000),
            host("old", 100, 4, 0, 60),
            host("middle", 200, 4, 4, 14_000),
        ];
        let none = HashSet::new();

        assert_eq!(select_host(&hosts, 1, &policy, &none).unwrap().id, "young");

        let mut excluded = HashSet::new();
        excluded.insert("young".to_string());
        assert_eq!(select_host(&hosts, 1, &policy, &excluded).unwrap().id, "old");
        assert!(select_host(&hosts, 5, &policy, &none).is_none());
    }

    #[test]
    fn select_ignores_inactive_hosts() {
        let policy = PoolPolicy::default();
        let mut hosts = vec![host("a", 100, 4, 0, 14_000)];
        hosts[0].state = HostState::Inactive;
        assert!(select_host(&hosts, 1, &policy, &HashSet::new()).is_none());
    }

    #[test]
    fn container_spec_carries_slots_env_and_command() {
        let mut request = session_request("sess-1", "pb-sess-1");
        request.profile.consumed_slots = 2;
        request.profile.memory_limit = "512m".into();
        request.profile.environment_vars = "FOO=1 BAR=2".into();
        request.profile.launch_command = Some("start.sh --base-url {proxy_path} --no-browser".into());

        let spec = container_spec(&request, "abc123", "Europe/Helsinki").unwrap();
        assert_eq!(spec.labels[SLOTS_LABEL], "2");
        assert_eq!(
            spec.env,
            vec!["FOO=1", "BAR=2", "INSTANCE_ID=sess-1", "TZ=Europe/Helsinki"]
        );
        assert_eq!(
            spec.cmd.unwrap(),
            vec!["start.sh", "--base-url", "/abc123", "--no-browser"]
        );
        assert_eq!(spec.host_config.mem_limit, 512 << 20);
        assert_eq!(spec.host_config.memswap_limit, 3 * (512 << 20));
        assert!(spec.host_config.publish_all_ports);
    }

    #[test]
    fn container_spec_rejects_bad_memory_limit() {
        let mut request = session_request("sess-1", "pb-sess-1");
        request.profile.memory_limit = "lots".into();
        assert!(matches!(
            container_spec(&request, "abc", "UTC"),
            Err(crate::Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn placement_installs_route_and_returns_endpoint() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let host_id = pool.spawn_and_activate(0).await;

        let mut request = session_request("sess-1", "pb-sess-1");
        request.profile.show_password = true;
        request.profile.proxy_options.bypass_token_authentication = true;
        let placement = pool.driver.provision_at(&request, 120).await.unwrap();

        assert_eq!(placement.host_id, host_id);
        assert_eq!(placement.password.as_deref(), Some("sess-1"));
        assert_eq!(
            placement.endpoint,
            format!("https://192.0.2.10:8443/notebooks/{}/", placement.proxy_route)
        );

        let routes = pool.proxy.routes();
        let (target, options) = &routes[&placement.proxy_route];
        assert_eq!(target, &format!("http://10.0.0.1:{}", placement.mapped_port));
        assert_eq!(options.bypass_token_authentication.as_deref(), Some("sess-1"));

        let daemon = pool.docker.daemon(&placement.docker_url);
        assert_eq!(daemon.container_names(), vec!["pb-sess-1".to_string()]);
        assert!(pool.driver.pool_lock().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_id_outside_safe_charset_is_rejected() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let host_id = pool.spawn_and_activate(0).await;

        for id in ["x\";\n}\nlocation / { proxy_pass http://evil:80; #", "a b", "sess;1", "séance"] {
            let mut request = session_request(id, "pb-bad");
            request.profile.proxy_options.bypass_token_authentication = true;
            let err = pool.driver.provision_at(&request, 120).await.unwrap_err();
            assert!(matches!(err, crate::Error::InvalidRequest(_)), "{id:?} accepted");
        }

        let host = pool.host(&host_id).await;
        assert!(pool.docker.daemon(&host.docker_url).container_names().is_empty());
        assert!(pool.proxy.routes().is_empty());

        pool.driver
            .provision_at(&session_request("0f3c_9a-B", "pb-ok"), 120)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn port_wait_timeout_still_places_session() {
        let policy = PoolPolicy {
            port_wait: Duration::from_millis(300),
            port_probe_interval: Duration::from_millis(50),
            ..PoolPolicy::immediate()
        };
        let pool = TestPool::with_policy(policy).await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let host_id = pool.spawn_and_activate(0).await;

        // Point the host at loopback and hand out a port nobody listens on.
        let mut hosts = pool.hosts().await;
        hosts[0].private_ip = "127.0.0.1".into();
        pool.driver.records().save_hosts(&hosts).await.unwrap();
        let closed_port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        pool.docker.daemon(&hosts[0].docker_url).set_next_port(closed_port);

        let started = tokio::time::Instant::now();
        let placement = pool
            .driver
            .provision_at(&session_request("sess-1", "pb-sess-1"), 120)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));

        assert_eq!(placement.host_id, host_id);
        assert_eq!(placement.mapped_port, closed_port);
        let routes = pool.proxy.routes();
        assert_eq!(routes[&placement.proxy_route].0, format!("http://127.0.0.1:{closed_port}"));
    }

    #[tokio::test]
    async fn open_port_ends_the_wait_early() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let started = tokio::time::Instant::now();
        assert!(wait_for_port("127.0.0.1", port, Duration::from_secs(5), Duration::from_millis(50)).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_placement_releases_pool_lock() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        pool.proxy.delay_adds(Duration::from_secs(30));

        let driver = pool.driver.clone();
        let task = tokio::spawn(async move {
            driver
                .provision_at(&session_request("sess-1", "pb-sess-1"), 120)
                .await
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pool.driver.pool_lock().list().await.unwrap().len(), 1, "placement holds the lock");

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        let next = tokio::time::timeout(Duration::from_secs(2), pool.driver.housekeep_at(240)).await;
        assert!(matches!(next, Ok(Ok(Some(_)))), "pool lock leaked: {next:?}");
        assert!(pool.driver.pool_lock().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_logs_come_from_the_placed_container() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        let placement = pool
            .driver
            .provision_at(&session_request("sess-1", "pb-sess-1"), 120)
            .await
            .unwrap();

        let daemon = pool.docker.daemon(&placement.docker_url);
        daemon.set_logs("pb-sess-1", "[I 12:00:01 NotebookApp] Serving notebooks\n");
        assert_eq!(
            pool.driver.session_logs(&placement).await.unwrap(),
            "[I 12:00:01 NotebookApp] Serving notebooks\n"
        );

        daemon.set_unreachable(true);
        assert!(matches!(
            pool.driver.session_logs(&placement).await,
            Err(crate::Error::Docker(crate::docker::DockerError::Transient(_)))
        ));
    }

    #[tokio::test]
    async fn shutdown_mode_refuses_placement() {
        let pool = TestPool::new().await;
        let err = pool
            .driver
            .provision_at(&session_request("s", "n"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ShuttingDown));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn ambiguous_port_mapping_fails_without_route() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        let host = pool.hosts().await.remove(0);
        pool.docker.daemon(&host.docker_url).set_bindings_per_port(2);

        let err = pool
            .driver
            .provision_at(&session_request("s", "n"), 120)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::PortMapping(_)));
        assert!(pool.proxy.routes().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_is_skipped() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        let host = pool.hosts().await.remove(0);
        pool.docker.daemon(&host.docker_url).set_unreachable(true);

        let err = pool
            .driver
            .provision_at(&session_request("s", "n"), 120)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::NoCapacity { requested: 1 }));
    }
}
