use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::policy::{HOST_KEY_PREFIX, PoolPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Spawned,
    Active,
    Inactive,
    Removed,
}

impl HostState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawned => "spawned",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pool VM as persisted in the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub provider_id: String,
    pub docker_url: String,
    pub private_ip: String,
    #[serde(default)]
    pub public_ip: String,
    pub spawn_ts: i64,
    pub state: HostState,
    pub num_slots: u32,
    #[serde(default)]
    pub num_reserved_slots: u32,
    #[serde(default)]
    pub usage: u64,
    #[serde(default)]
    pub lifetime_tick_ts: i64,
    #[serde(default)]
    pub error_count: u32,
    /// Derived on every read, never trusted from storage.
    #[serde(skip)]
    pub lifetime_left: i64,
}

impl Host {
    pub fn record_key(&self) -> String {
        record_key(&self.id)
    }

    pub fn free_slots(&self) -> u32 {
        self.num_slots.saturating_sub(self.num_reserved_slots)
    }

    pub fn is_fresh(&self, policy: &PoolPolicy) -> bool {
        self.lifetime_left > policy.host_lifetime_low
    }

    /// Record a fresh slot count observed on the daemon. Usage accrues and
    /// the lifetime clock starts on first use.
    pub fn observe_reserved(&mut self, reserved: u32, now: i64) {
        self.set_reserved(reserved);
        self.usage += u64::from(self.num_reserved_slots);
        if self.usage > 0 && self.lifetime_tick_ts == 0 {
            self.lifetime_tick_ts = now;
        }
    }

    /// Store an observed slot count, clamped to the host's capacity.
    pub fn set_reserved(&mut self, reserved: u32) {
        if reserved > self.num_slots {
            tracing::warn!(
                host_id = %self.id,
                reserved,
                num_slots = self.num_slots,
                "host reports more reserved slots than it has, clamping"
            );
        }
        self.num_reserved_slots = reserved.min(self.num_slots);
    }

    /// JSON schema for stored host records.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["id", "provider_id", "docker_url", "private_ip", "spawn_ts", "state", "num_slots"],
            "properties": {
                "id": { "type": "string", "minLength": 1 },
                "provider_id": { "type": "string" },
                "docker_url": { "type": "string" },
                "private_ip": { "type": "string" },
                "public_ip": { "type": "string" },
                "spawn_ts": { "type": "integer" },
                "state": { "enum": ["spawned", "active", "inactive", "removed"] },
                "num_slots": { "type": "integer", "minimum": 1 },
                "num_reserved_slots": { "type": "integer", "minimum": 0 },
                "usage": { "type": "integer", "minimum": 0 },
                "lifetime_tick_ts": { "type": "integer", "minimum": 0 },
                "error_count": { "type": "integer", "minimum": 0 }
            }
        })
    }
}

pub fn record_key(host_id: &str) -> String {
    format!("{HOST_KEY_PREFIX}{host_id}")
}

/// Recompute `lifetime_left` for every host.
///
/// A lone host of a non-small flavor starts its clock immediately so a
/// ramp-up host is not kept around idle forever.
pub fn update_lifetimes(hosts: &mut [Host], shutdown_mode: bool, small_slots: u32, policy: &PoolPolicy, now: i64) {
    let lone = hosts.len() == 1;
    for host in hosts.iter_mut() {
        host.lifetime_left = if shutdown_mode {
            0
        } else if host.lifetime_tick_ts > 0 {
            (policy.host_lifetime - (now - host.lifetime_tick_ts)).max(0)
        } else if lone && host.num_slots != small_slots {
            host.lifetime_tick_ts = now;
            policy.host_lifetime
        } else {
            policy.host_lifetime
        };
    }
}

pub fn active_hosts(hosts: &[Host]) -> impl Iterator<Item = &Host> {
    hosts.iter().filter(|h| h.state == HostState::Active)
}

/// Slots in use anywhere in the pool.
pub fn allocated_slots(hosts: &[Host]) -> u32 {
    hosts.iter().map(|h| h.num_reserved_slots).sum()
}

pub fn free_slots(hosts: &[Host]) -> u32 {
    active_hosts(hosts).map(Host::free_slots).sum()
}

/// Free slots on active hosts that will still be around for a while.
pub fn projected_free_slots(hosts: &[Host], policy: &PoolPolicy) -> u32 {
    active_hosts(hosts)
        .filter(|h| h.is_fresh(policy))
        .map(Host::free_slots)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str, state: HostState, num_slots: u32, reserved: u32) -> Host {
        Host {
            id: id.into(),
            provider_id: format!("srv-{id}"),
            docker_url: "https://10.0.0.1:2376".into(),
            private_ip: "10.0.0.1".into(),
            public_ip: String::new(),
            spawn_ts: 0,
            state,
            num_slots,
            num_reserved_slots: reserved,
            usage: 0,
            lifetime_tick_ts: 0,
            error_count: 0,
            lifetime_left: 0,
        }
    }

    fn policy() -> PoolPolicy {
        PoolPolicy {
            host_lifetime: 900,
            ..PoolPolicy::immediate()
        }
    }

    #[test]
    fn lifetime_counts_down_from_first_use() {
        let mut hosts = vec![host("a", HostState::Active, 4, 0), host("b", HostState::Active, 4, 0)];
        hosts[0].lifetime_tick_ts = 1_000;

        update_lifetimes(&mut hosts, false, 4, &policy(), 1_600);
        assert_eq!(hosts[0].lifetime_left, 300);
        assert_eq!(hosts[1].lifetime_left, 900);
        assert_eq!(hosts[1].lifetime_tick_ts, 0);

        update_lifetimes(&mut hosts, false, 4, &policy(), 5_000);
        assert_eq!(hosts[0].lifetime_left, 0);
    }

    #[test]
    fn lone_large_host_starts_ticking() {
        let mut hosts = vec![host("big", HostState::Active, 16, 0)];
        update_lifetimes(&mut hosts, false, 4, &policy(), 2_000);
        assert_eq!(hosts[0].lifetime_tick_ts, 2_000);
        assert_eq!(hosts[0].lifetime_left, 900);

        let mut small = vec![host("small", HostState::Active, 4, 0)];
        update_lifetimes(&mut small, false, 4, &policy(), 2_000);
        assert_eq!(small[0].lifetime_tick_ts, 0);
    }

    #[test]
    fn shutdown_zeroes_every_lifetime() {
        let mut hosts = vec![host("a", HostState::Active, 4, 1), host("b", HostState::Spawned, 4, 0)];
        update_lifetimes(&mut hosts, true, 4, &policy(), 2_000);
        assert!(hosts.iter().all(|h| h.lifetime_left == 0));
    }

    #[test]
    fn projected_free_slots_skip_expiring_and_inactive_hosts() {
        let mut hosts = vec![
            host("fresh", HostState::Active, 4, 1),
            host("old", HostState::Active, 16, 0),
            host("gone", HostState::Inactive, 16, 0),
        ];
        hosts[0].lifetime_left = 900;
        hosts[1].lifetime_left = 300;

        assert_eq!(free_slots(&hosts), 3 + 16);
        assert_eq!(projected_free_slots(&hosts, &policy()), 3);
        assert_eq!(allocated_slots(&hosts), 1);
    }

    #[test]
    fn observe_reserved_clamps_and_starts_clock_once() {
        let mut h = host("a", HostState::Active, 4, 0);
        h.observe_reserved(0, 100);
        assert_eq!(h.lifetime_tick_ts, 0);

        h.observe_reserved(6, 200);
        assert_eq!(h.num_reserved_slots, 4);
        assert_eq!(h.lifetime_tick_ts, 200);

        h.observe_reserved(1, 300);
        assert_eq!(h.usage, 5);
        assert_eq!(h.lifetime_tick_ts, 200);
    }

    #[test]
    fn lifetime_left_is_not_persisted() {
        let mut h = host("a", HostState::Active, 4, 0);
        h.lifetime_left = 123;
        let value = serde_json::to_value(&h).unwrap();
        assert!(value.get("lifetime_left").is_none());
        assert_eq!(value["state"], "active");
        assert_eq!(h.record_key(), "pool_vm_a");
    }
}
