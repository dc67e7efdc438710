use std::time::Duration;

use nb_infra::types::{HostSpec, ServerId};
use serde::Serialize;
use uuid::Uuid;

use crate::config::BackendConfig;
use crate::docker;
use crate::driver::{PoolDriver, unix_now};
use crate::host::{self, Host, HostState};
use crate::lock::LocalFileLock;

/// Prefix of pool host ids; the id doubles as the IaaS display name.
pub const HOST_ID_PREFIX: &str = "nb_pool_";
const HOUSEKEEP_LOCK_FILE: &str = "housekeep.lock";
const LOCAL_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// The single transition a housekeeping tick performed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HousekeepAction {
    Activated { host_id: String },
    ActivationFailed { host_id: String, error_count: u32, inactivated: bool },
    Removed { host_id: String },
    Spawned { host_id: String, num_slots: u32 },
    Inactivated { host_id: String, reason: InactivationReason },
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InactivationReason {
    Expired,
    TooManyErrors,
}

/// A host as reported by [`PoolDriver::pool_status`].
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: Host,
    pub lifetime_left: i64,
}

/// Read-only pool summary.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub shutdown_mode: bool,
    pub active_hosts: usize,
    pub allocated_slots: u32,
    pub free_slots: u32,
    pub projected_free_slots: u32,
    pub free_slot_target: u32,
    pub hosts: Vec<HostView>,
}

impl PoolDriver {
    /// Run one housekeeping tick. Returns `Ok(None)` when another tick is
    /// already running in this process.
    pub async fn housekeep(&self) -> crate::Result<Option<HousekeepAction>> {
        self.housekeep_at(unix_now()).await
    }

    pub async fn housekeep_at(&self, now: i64) -> crate::Result<Option<HousekeepAction>> {
        let path = self.settings.runtime_dir.join(HOUSEKEEP_LOCK_FILE);
        let Some(_local) = LocalFileLock::try_lock(&path, LOCAL_LOCK_TIMEOUT).await? else {
            tracing::debug!("housekeeping already running, skipping tick");
            return Ok(None);
        };

        let owner = self.owner("housekeep");
        let action = self.with_pool_lock(&owner, self.housekeep_locked(now)).await?;
        Ok(Some(action))
    }

    async fn housekeep_locked(&self, now: i64) -> crate::Result<HousekeepAction> {
        let config = self.records.load_config().await?;
        let mut hosts = self.records.load_hosts().await?;

        self.refresh_hosts(&mut hosts, now).await;
        host::update_lifetimes(
            &mut hosts,
            config.shutdown_mode,
            config.host_flavor_slots_small,
            &self.settings.policy,
            now,
        );

        tracing::info!(
            active_hosts = host::active_hosts(&hosts).count(),
            free_slots = host::free_slots(&hosts),
            projected_free_slots = host::projected_free_slots(&hosts, &self.settings.policy),
            total_hosts = hosts.len(),
            "pool status"
        );

        let action = self.next_action(&mut hosts, &config, now).await?;
        self.records.save_hosts(&hosts).await?;

        if action != HousekeepAction::Idle {
            tracing::info!(?action, "housekeeping tick done");
        }
        Ok(action)
    }

    /// Recount reserved slots on every host that may carry containers.
    async fn refresh_hosts(&self, hosts: &mut [Host], now: i64) {
        for host in hosts
            .iter_mut()
            .filter(|h| matches!(h.state, HostState::Active | HostState::Inactive))
        {
            let counted = match self.docker.connect(&host.docker_url) {
                Ok(api) => docker::reserved_slots(&*api).await,
                Err(e) => Err(e),
            };
            match counted {
                Ok(reserved) => host.observe_reserved(reserved, now),
                Err(e) => {
                    host.error_count += 1;
                    tracing::warn!(
                        host_id = %host.id,
                        error_count = host.error_count,
                        error = %e,
                        "failed to list containers"
                    );
                }
            }
        }
    }

    async fn next_action(
        &self,
        hosts: &mut Vec<Host>,
        config: &BackendConfig,
        now: i64,
    ) -> crate::Result<HousekeepAction> {
        let policy = &self.settings.policy;

        if let Some(host) = hosts.iter_mut().find(|h| h.state == HostState::Spawned) {
            return Ok(self.activate_host(host, config).await);
        }

        if let Some(host) = hosts
            .iter_mut()
            .find(|h| h.state == HostState::Inactive && h.num_reserved_slots == 0)
        {
            self.remove_host(host).await?;
            return Ok(HousekeepAction::Removed {
                host_id: host.id.clone(),
            });
        }

        let projected = host::projected_free_slots(hosts, policy);
        if !config.shutdown_mode
            && projected < config.free_slot_target
            && hosts.len() < config.max_hosts as usize
        {
            let ramp_up = host::allocated_slots(hosts) > 0;
            let new_host = self.spawn_host(config, ramp_up, now).await?;
            let action = HousekeepAction::Spawned {
                host_id: new_host.id.clone(),
                num_slots: new_host.num_slots,
            };
            hosts.push(new_host);
            return Ok(action);
        }

        for host in hosts.iter_mut().filter(|h| h.state == HostState::Active) {
            let reason = if host.error_count > policy.max_host_errors {
                InactivationReason::TooManyErrors
            } else if host.lifetime_left == 0 && host.num_reserved_slots == 0 {
                InactivationReason::Expired
            } else {
                continue;
            };
            host.state = HostState::Inactive;
            tracing::info!(host_id = %host.id, ?reason, "inactivating host");
            return Ok(HousekeepAction::Inactivated {
                host_id: host.id.clone(),
                reason,
            });
        }

        Ok(HousekeepAction::Idle)
    }

    async fn activate_host(&self, host: &mut Host, config: &BackendConfig) -> HousekeepAction {
        tracing::info!(host_id = %host.id, private_ip = %host.private_ip, "preparing host");
        match self.preparer.prepare(host, config).await {
            Ok(()) => {
                host.state = HostState::Active;
                tracing::info!(host_id = %host.id, "host activated");
                HousekeepAction::Activated {
                    host_id: host.id.clone(),
                }
            }
            Err(e) => {
                host.error_count += 1;
                let inactivated = host.error_count > self.settings.policy.max_host_errors;
                if inactivated {
                    host.state = HostState::Inactive;
                }
                tracing::warn!(
                    host_id = %host.id,
                    error_count = host.error_count,
                    inactivated,
                    error = %e,
                    "host preparation failed"
                );
                HousekeepAction::ActivationFailed {
                    host_id: host.id.clone(),
                    error_count: host.error_count,
                    inactivated,
                }
            }
        }
    }

    async fn remove_host(&self, host: &mut Host) -> crate::Result<()> {
        tracing::info!(host_id = %host.id, provider_id = %host.provider_id, "removing host");
        self.cloud
            .deprovision(&ServerId(host.provider_id.clone()), true)
            .await?;
        host.state = HostState::Removed;
        Ok(())
    }

    async fn spawn_host(&self, config: &BackendConfig, ramp_up: bool, now: i64) -> crate::Result<Host> {
        let flavor = config.flavor(ramp_up);
        let id = format!("{HOST_ID_PREFIX}{}", Uuid::new_v4().simple());
        tracing::info!(host_id = %id, flavor = flavor.name, slots = flavor.slots, ramp_up, "spawning host");

        let spec = HostSpec {
            display_name: id.clone(),
            image: config.host_image.clone(),
            flavor: flavor.name.to_string(),
            public_key: self.settings.ssh_public_key.clone(),
            master_sg: config.master_sg(),
            extra_sgs: config.extra_sgs(),
            allocate_public_ip: false,
            root_volume_size: config.host_root_volume_size,
            data_volume_size: flavor.slots * config.host_data_volume_factor,
            data_volume_type: config.data_volume_type(),
            network: config.network(),
        };
        let provisioned = self.cloud.provision(&spec).await?;
        let private_ip = provisioned.address_data.private_ip;

        Ok(Host {
            docker_url: format!("https://{private_ip}:2376"),
            public_ip: provisioned.address_data.public_ip.unwrap_or_default(),
            private_ip,
            id,
            provider_id: provisioned.server_id.0,
            spawn_ts: now,
            state: HostState::Spawned,
            num_slots: flavor.slots,
            num_reserved_slots: 0,
            usage: 0,
            lifetime_tick_ts: 0,
            error_count: 0,
            lifetime_left: 0,
        })
    }

    /// Pool figures from the stored records, without touching Docker.
    pub async fn pool_status(&self) -> crate::Result<PoolStatus> {
        self.pool_status_at(unix_now()).await
    }

    pub async fn pool_status_at(&self, now: i64) -> crate::Result<PoolStatus> {
        let config = self.records.load_config().await?;
        let mut hosts = self.records.load_hosts().await?;
        host::update_lifetimes(
            &mut hosts,
            config.shutdown_mode,
            config.host_flavor_slots_small,
            &self.settings.policy,
            now,
        );

        let policy = &self.settings.policy;
        Ok(PoolStatus {
            shutdown_mode: config.shutdown_mode,
            active_hosts: host::active_hosts(&hosts).count(),
            allocated_slots: host::allocated_slots(&hosts),
            free_slots: host::free_slots(&hosts),
            projected_free_slots: host::projected_free_slots(&hosts, policy),
            free_slot_target: config.free_slot_target,
            hosts: hosts
                .into_iter()
                .map(|host| HostView {
                    lifetime_left: host.lifetime_left,
                    host,
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPool;

    #[tokio::test]
    async fn empty_pool_spawns_small_host_first() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;

        let action = pool.driver.housekeep_at(1_000).await.unwrap().unwrap();
        let HousekeepAction::Spawned { host_id, num_slots } = action else {
            panic!("expected spawn, got {action:?}");
        };
        assert_eq!(num_slots, 4);
        assert!(host_id.starts_with(HOST_ID_PREFIX));

        let specs = pool.cloud.provisioned();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].display_name, host_id);
        assert_eq!(specs[0].flavor, "small");
        assert!(!specs[0].allocate_public_ip);
        assert_eq!(specs[0].data_volume_size, 4 * 4);
        assert_eq!(specs[0].extra_sgs, vec!["sg-a".to_string(), "sg-b".to_string()]);

        let hosts = pool.driver.records().load_hosts().await.unwrap();
        assert_eq!(hosts[0].state, HostState::Spawned);
        assert_eq!(hosts[0].spawn_ts, 1_000);
        assert!(hosts[0].docker_url.ends_with(":2376"));
    }

    #[tokio::test]
    async fn shutdown_mode_never_spawns() {
        let pool = TestPool::new().await;
        let action = pool.driver.housekeep_at(1_000).await.unwrap().unwrap();
        assert_eq!(action, HousekeepAction::Idle);
        assert!(pool.cloud.provisioned().is_empty());
    }

    #[tokio::test]
    async fn unreachable_host_accrues_errors_and_is_retired() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let host_id = pool.spawn_and_activate(0).await;
        pool.set_config(|c| c.free_slot_target = 0).await;
        let host = pool.host(&host_id).await;
        pool.docker.daemon(&host.docker_url).set_unreachable(true);

        let max = pool.driver.settings().policy.max_host_errors;
        for tick in 0..max {
            let action = pool.driver.housekeep_at(120 + i64::from(tick) * 60).await.unwrap().unwrap();
            assert_eq!(action, HousekeepAction::Idle);
        }
        let action = pool.driver.housekeep_at(10_000).await.unwrap().unwrap();
        assert_eq!(
            action,
            HousekeepAction::Inactivated {
                host_id: host_id.clone(),
                reason: InactivationReason::TooManyErrors,
            }
        );
        assert_eq!(pool.host(&host_id).await.error_count, max + 1);
    }

    #[tokio::test]
    async fn cloud_failure_aborts_tick_without_persisting() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.cloud.fail_next_provision();

        let err = pool.driver.housekeep_at(1_000).await.unwrap_err();
        assert!(matches!(err, crate::Error::Cloud(_)));
        assert!(pool.driver.records().load_hosts().await.unwrap().is_empty());
        assert!(pool.driver.pool_lock().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_tick_is_skipped() {
        let pool = TestPool::new().await;
        let path = pool.driver.settings().runtime_dir.join(HOUSEKEEP_LOCK_FILE);
        let _held = LocalFileLock::try_lock(&path, Duration::ZERO).await.unwrap().unwrap();

        let outcome = pool.driver.housekeep_at(1_000).await.unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn pool_status_reports_derived_lifetimes() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;

        let status = pool.driver.pool_status_at(120).await.unwrap();
        assert_eq!(status.active_hosts, 1);
        assert_eq!(status.free_slots, 4);
        assert_eq!(status.hosts[0].lifetime_left, 900);

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["hosts"][0]["state"], "active");
        assert_eq!(value["hosts"][0]["lifetime_left"], 900);
    }

    #[test]
    fn action_serializes_with_tag() {
        let action = HousekeepAction::Spawned {
            host_id: "nb_pool_1".into(),
            num_slots: 16,
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["action"], "spawned");
        assert_eq!(value["num_slots"], 16);
    }
}
