use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use jsonschema::JSONSchema;
use nb_db::models::NamespacedKeyValue;
use serde_json::Value;
use sqlx::PgPool;

use crate::config::BackendConfig;
use crate::host::{Host, HostState};
use crate::policy::{CONFIG_KEY, HOST_KEY_PREFIX, NAMESPACE};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("record {namespace}/{key} rejected: {reason}")]
    Invalid {
        namespace: String,
        key: String,
        reason: String,
    },

    #[error("record {namespace}/{key} is malformed: {source}")]
    Malformed {
        namespace: String,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {namespace}/{key} not found")]
    Missing { namespace: String, key: String },
}

/// One stored document.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: String,
    pub value: Value,
}

/// Namespaced JSON key-value storage for pool state.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// All records in `namespace` whose key starts with `key_prefix`, by key.
    async fn list(&self, namespace: &str, key_prefix: &str) -> Result<Vec<Record>, StoreError>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Insert or replace. With a schema, the value is validated first and
    /// rejected documents are never written.
    async fn upsert(&self, namespace: &str, key: &str, value: &Value, schema: Option<&Value>) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
}

/// Validate `value` against a JSON schema, collecting every violation.
pub fn validate_document(namespace: &str, key: &str, value: &Value, schema: &Value) -> Result<(), StoreError> {
    let invalid = |reason: String| StoreError::Invalid {
        namespace: namespace.to_string(),
        key: key.to_string(),
        reason,
    };

    let compiled = JSONSchema::compile(schema).map_err(|e| invalid(format!("schema does not compile: {e}")))?;
    if let Err(errors) = compiled.validate(value) {
        let msgs: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
        return Err(invalid(msgs.join("; ")));
    }
    Ok(())
}

// ── PostgreSQL ──────────────────────────────────────────────────────

pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list(&self, namespace: &str, key_prefix: &str) -> Result<Vec<Record>, StoreError> {
        let rows = NamespacedKeyValue::list_by_prefix(&self.pool, namespace, key_prefix).await?;
        Ok(rows
            .into_iter()
            .map(|row| Record {
                key: row.key,
                value: row.value,
            })
            .collect())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(NamespacedKeyValue::get(&self.pool, namespace, key)
            .await?
            .map(|row| row.value))
    }

    async fn upsert(&self, namespace: &str, key: &str, value: &Value, schema: Option<&Value>) -> Result<(), StoreError> {
        if let Some(schema) = schema {
            validate_document(namespace, key, value, schema)?;
        }
        NamespacedKeyValue::upsert(&self.pool, namespace, key, value, schema).await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        NamespacedKeyValue::delete(&self.pool, namespace, key).await?;
        Ok(())
    }
}

// ── In-memory ───────────────────────────────────────────────────────

/// Process-local store for tests and single-node development runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<BTreeMap<(String, String), Value>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), Value>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list(&self, namespace: &str, key_prefix: &str) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .records()
            .iter()
            .filter(|((ns, key), _)| ns == namespace && key.starts_with(key_prefix))
            .map(|((_, key), value)| Record {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .records()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    async fn upsert(&self, namespace: &str, key: &str, value: &Value, schema: Option<&Value>) -> Result<(), StoreError> {
        if let Some(schema) = schema {
            validate_document(namespace, key, value, schema)?;
        }
        self.records()
            .insert((namespace.to_string(), key.to_string()), value.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.records().remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }
}

// ── Typed pool records ──────────────────────────────────────────────

/// Host and backend-config documents on top of a [`RecordStore`].
#[derive(Clone)]
pub struct PoolRecords {
    store: Arc<dyn RecordStore>,
}

impl PoolRecords {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Hosts ordered by record key.
    pub async fn load_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.store
            .list(NAMESPACE, HOST_KEY_PREFIX)
            .await?
            .into_iter()
            .map(|record| {
                serde_json::from_value(record.value).map_err(|source| StoreError::Malformed {
                    namespace: NAMESPACE.into(),
                    key: record.key,
                    source,
                })
            })
            .collect()
    }

    /// Write back a host batch: removed hosts are deleted, the rest upserted.
    pub async fn save_hosts(&self, hosts: &[Host]) -> Result<(), StoreError> {
        let schema = Host::schema();
        for host in hosts {
            let key = host.record_key();
            if host.state == HostState::Removed {
                self.store.delete(NAMESPACE, &key).await?;
                continue;
            }
            let value = serde_json::to_value(host).map_err(|source| StoreError::Malformed {
                namespace: NAMESPACE.into(),
                key: key.clone(),
                source,
            })?;
            self.store.upsert(NAMESPACE, &key, &value, Some(&schema)).await?;
        }
        Ok(())
    }

    pub async fn load_config(&self) -> Result<BackendConfig, StoreError> {
        let value = self
            .store
            .get(NAMESPACE, CONFIG_KEY)
            .await?
            .ok_or_else(|| StoreError::Missing {
                namespace: NAMESPACE.into(),
                key: CONFIG_KEY.into(),
            })?;
        parse_config(value)
    }

    pub async fn save_config(&self, config: &BackendConfig) -> Result<(), StoreError> {
        let value = serde_json::to_value(config).map_err(|source| StoreError::Malformed {
            namespace: NAMESPACE.into(),
            key: CONFIG_KEY.into(),
            source,
        })?;
        self.save_config_document(&value).await
    }

    /// Validate and store a raw config document.
    pub async fn save_config_document(&self, value: &Value) -> Result<(), StoreError> {
        let config = parse_config(value.clone())?;
        let canonical = serde_json::to_value(&config).map_err(|source| StoreError::Malformed {
            namespace: NAMESPACE.into(),
            key: CONFIG_KEY.into(),
            source,
        })?;
        self.store
            .upsert(NAMESPACE, CONFIG_KEY, &canonical, Some(&BackendConfig::schema()))
            .await
    }

    /// Seed the default config if none is stored yet. Returns the config
    /// in effect.
    pub async fn ensure_config(&self) -> Result<BackendConfig, StoreError> {
        match self.load_config().await {
            Err(StoreError::Missing { .. }) => {
                let config = BackendConfig::default();
                self.save_config(&config).await?;
                tracing::info!("seeded default backend config");
                Ok(config)
            }
            other => other,
        }
    }
}

fn parse_config(value: Value) -> Result<BackendConfig, StoreError> {
    let invalid = |reason: String| StoreError::Invalid {
        namespace: NAMESPACE.into(),
        key: CONFIG_KEY.into(),
        reason,
    };

    validate_document(NAMESPACE, CONFIG_KEY, &value, &BackendConfig::schema())?;
    let config: BackendConfig = serde_json::from_value(value).map_err(|source| StoreError::Malformed {
        namespace: NAMESPACE.into(),
        key: CONFIG_KEY.into(),
        source,
    })?;
    config.check().map_err(invalid)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn memory_store_lists_by_prefix_in_key_order() {
        let store = MemoryRecordStore::new();
        store.upsert("ns", "pool_vm_b", &json!(2), None).await.unwrap();
        store.upsert("ns", "pool_vm_a", &json!(1), None).await.unwrap();
        store.upsert("ns", "backend_config", &json!({}), None).await.unwrap();
        store.upsert("other", "pool_vm_c", &json!(3), None).await.unwrap();

        let keys: Vec<String> = store
            .list("ns", "pool_vm_")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(keys, vec!["pool_vm_a", "pool_vm_b"]);

        store.delete("ns", "pool_vm_a").await.unwrap();
        store.delete("ns", "pool_vm_a").await.unwrap();
        assert_eq!(store.list("ns", "pool_vm_").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upsert_rejects_documents_failing_the_schema() {
        let store = MemoryRecordStore::new();
        let schema = json!({ "type": "object", "required": ["id"] });

        let err = store
            .upsert("ns", "k", &json!({ "name": "x" }), Some(&schema))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid { .. }));
        assert!(store.get("ns", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn config_missing_required_field_is_a_store_error() {
        let records = PoolRecords::new(Arc::new(MemoryRecordStore::new()));
        assert!(matches!(
            records.load_config().await,
            Err(StoreError::Missing { .. })
        ));

        let mut doc = serde_json::to_value(BackendConfig::default()).unwrap();
        doc.as_object_mut().unwrap().remove("MAX_HOSTS");
        records
            .store()
            .upsert(NAMESPACE, CONFIG_KEY, &doc, None)
            .await
            .unwrap();

        match records.load_config().await {
            Err(StoreError::Invalid { reason, .. }) => assert!(reason.contains("MAX_HOSTS")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_config_seeds_default_once() {
        let records = PoolRecords::new(Arc::new(MemoryRecordStore::new()));
        let seeded = records.ensure_config().await.unwrap();
        assert!(seeded.shutdown_mode);

        let edited = BackendConfig {
            shutdown_mode: false,
            ..seeded
        };
        records.save_config(&edited).await.unwrap();
        assert_eq!(records.ensure_config().await.unwrap(), edited);
    }
}
