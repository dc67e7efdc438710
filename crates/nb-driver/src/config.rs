use nb_infra::types::NetworkChoice;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Pool tuning document, stored under [`crate::policy::CONFIG_KEY`] and
/// editable at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct BackendConfig {
    pub free_slot_target: u32,
    pub max_hosts: u32,
    pub shutdown_mode: bool,
    pub host_image: String,
    pub host_flavor_name_small: String,
    pub host_flavor_slots_small: u32,
    pub host_flavor_name_large: String,
    pub host_flavor_slots_large: u32,
    pub host_master_sg: String,
    #[serde(default)]
    pub host_extra_sgs: String,
    pub host_root_volume_size: u32,
    pub host_data_volume_factor: u32,
    #[serde(default)]
    pub host_data_volume_type: String,
    #[serde(default)]
    pub host_data_volume_device: String,
    #[serde(default = "default_network")]
    pub host_network: String,
}

fn default_network() -> String {
    "auto".into()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            free_slot_target: 4,
            max_hosts: 4,
            shutdown_mode: true,
            host_image: "CentOS-7".into(),
            host_flavor_name_small: "standard.medium".into(),
            host_flavor_slots_small: 6,
            host_flavor_name_large: "standard.xlarge".into(),
            host_flavor_slots_large: 24,
            host_master_sg: "pb_server".into(),
            host_extra_sgs: String::new(),
            host_root_volume_size: 0,
            host_data_volume_factor: 4,
            host_data_volume_type: String::new(),
            host_data_volume_device: "/dev/vdb".into(),
            host_network: default_network(),
        }
    }
}

/// Flavor picked for a new host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flavor<'a> {
    pub name: &'a str,
    pub slots: u32,
}

impl BackendConfig {
    /// JSON schema every stored config document must satisfy.
    pub fn schema() -> Value {
        json!({
            "type": "object",
            "required": [
                "FREE_SLOT_TARGET", "MAX_HOSTS", "SHUTDOWN_MODE", "HOST_IMAGE",
                "HOST_FLAVOR_NAME_SMALL", "HOST_FLAVOR_SLOTS_SMALL",
                "HOST_FLAVOR_NAME_LARGE", "HOST_FLAVOR_SLOTS_LARGE",
                "HOST_MASTER_SG", "HOST_ROOT_VOLUME_SIZE", "HOST_DATA_VOLUME_FACTOR"
            ],
            "properties": {
                "FREE_SLOT_TARGET": { "type": "integer", "minimum": 0 },
                "MAX_HOSTS": { "type": "integer", "minimum": 1 },
                "SHUTDOWN_MODE": { "type": "boolean" },
                "HOST_IMAGE": { "type": "string", "minLength": 1 },
                "HOST_FLAVOR_NAME_SMALL": { "type": "string", "minLength": 1 },
                "HOST_FLAVOR_SLOTS_SMALL": { "type": "integer", "minimum": 1 },
                "HOST_FLAVOR_NAME_LARGE": { "type": "string", "minLength": 1 },
                "HOST_FLAVOR_SLOTS_LARGE": { "type": "integer", "minimum": 1 },
                "HOST_MASTER_SG": { "type": "string" },
                "HOST_EXTRA_SGS": { "type": "string" },
                "HOST_ROOT_VOLUME_SIZE": { "type": "integer", "minimum": 0 },
                "HOST_DATA_VOLUME_FACTOR": { "type": "integer", "minimum": 0 },
                "HOST_DATA_VOLUME_TYPE": { "type": "string" },
                "HOST_DATA_VOLUME_DEVICE": { "type": "string" },
                "HOST_NETWORK": { "type": "string" }
            }
        })
    }

    /// Rules the schema cannot express.
    pub fn check(&self) -> Result<(), String> {
        if self.max_hosts < 1 {
            return Err("MAX_HOSTS must be at least 1".into());
        }
        if self.host_flavor_slots_small < 1 {
            return Err("HOST_FLAVOR_SLOTS_SMALL must be at least 1".into());
        }
        if self.host_flavor_slots_large < self.host_flavor_slots_small {
            return Err("HOST_FLAVOR_SLOTS_LARGE must not be below HOST_FLAVOR_SLOTS_SMALL".into());
        }
        Ok(())
    }

    /// Large flavor while ramping up, small otherwise.
    pub fn flavor(&self, ramp_up: bool) -> Flavor<'_> {
        if ramp_up {
            Flavor {
                name: &self.host_flavor_name_large,
                slots: self.host_flavor_slots_large,
            }
        } else {
            Flavor {
                name: &self.host_flavor_name_small,
                slots: self.host_flavor_slots_small,
            }
        }
    }

    pub fn extra_sgs(&self) -> Vec<String> {
        self.host_extra_sgs.split_whitespace().map(str::to_string).collect()
    }

    pub fn master_sg(&self) -> Option<String> {
        let sg = self.host_master_sg.trim();
        (!sg.is_empty()).then(|| sg.to_string())
    }

    pub fn data_volume_type(&self) -> Option<String> {
        let t = self.host_data_volume_type.trim();
        (!t.is_empty()).then(|| t.to_string())
    }

    pub fn data_volume_device(&self) -> Option<&str> {
        let d = self.host_data_volume_device.trim();
        (!d.is_empty()).then_some(d)
    }

    pub fn network(&self) -> NetworkChoice {
        self.host_network.parse().unwrap_or(NetworkChoice::Auto)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_screaming_snake_case_keys() {
        let doc = json!({
            "FREE_SLOT_TARGET": 4,
            "MAX_HOSTS": 2,
            "SHUTDOWN_MODE": false,
            "HOST_IMAGE": "CentOS-7",
            "HOST_FLAVOR_NAME_SMALL": "small",
            "HOST_FLAVOR_SLOTS_SMALL": 4,
            "HOST_FLAVOR_NAME_LARGE": "large",
            "HOST_FLAVOR_SLOTS_LARGE": 16,
            "HOST_MASTER_SG": "pb_server",
            "HOST_EXTRA_SGS": " ssh  monitoring ",
            "HOST_ROOT_VOLUME_SIZE": 0,
            "HOST_DATA_VOLUME_FACTOR": 4
        });
        let config: BackendConfig = serde_json::from_value(doc).unwrap();

        assert_eq!(config.max_hosts, 2);
        assert_eq!(config.extra_sgs(), vec!["ssh", "monitoring"]);
        assert_eq!(config.network(), NetworkChoice::Auto);
        assert_eq!(config.data_volume_device(), None);
        assert_eq!(config.flavor(true), Flavor { name: "large", slots: 16 });
        assert_eq!(config.flavor(false), Flavor { name: "small", slots: 4 });
    }

    #[test]
    fn check_rejects_large_flavor_smaller_than_small() {
        let config = BackendConfig {
            host_flavor_slots_small: 8,
            host_flavor_slots_large: 4,
            ..BackendConfig::default()
        };
        assert!(config.check().is_err());
        assert!(BackendConfig::default().check().is_ok());
    }
}
