use std::time::Duration;

/// Hosts are retired this long after they first carry a session.
pub const HOST_LIFETIME: i64 = 4 * 60 * 60;
/// Hosts with less lifetime than this are not counted as future capacity.
pub const HOST_LIFETIME_LOW: i64 = 5 * 60;
pub const MAX_HOST_ERRORS: u32 = 5;
pub const DOCKER_CLIENT_TIMEOUT: Duration = Duration::from_secs(180);

/// Record store namespace for everything the pool persists.
pub const NAMESPACE: &str = "HostPool";
pub const HOST_KEY_PREFIX: &str = "pool_vm_";
pub const CONFIG_KEY: &str = "backend_config";
/// Distributed lock guarding every pool mutation.
pub const POOL_LOCK_ID: &str = "dd_host:global";

/// Lifetimes, error cap and wait budgets of the pool. Production uses
/// [`PoolPolicy::default`]; tests shrink the waits.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    pub host_lifetime: i64,
    pub host_lifetime_low: i64,
    pub max_host_errors: u32,
    pub lock_retry_interval: Duration,
    pub port_wait: Duration,
    pub port_probe_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            host_lifetime: HOST_LIFETIME,
            host_lifetime_low: HOST_LIFETIME_LOW,
            max_host_errors: MAX_HOST_ERRORS,
            lock_retry_interval: Duration::from_secs(5),
            port_wait: Duration::from_secs(60),
            port_probe_interval: Duration::from_secs(2),
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl PoolPolicy {
    /// Instant waits, for tests and local runs against fakes.
    pub fn immediate() -> Self {
        Self {
            lock_retry_interval: Duration::from_millis(1),
            port_wait: Duration::ZERO,
            port_probe_interval: Duration::from_millis(1),
            settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }
}
