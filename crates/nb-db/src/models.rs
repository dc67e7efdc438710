use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

// ── NamespacedKeyValue ──────────────────────────────────────────────

/// One JSON document addressed by `(namespace, key)`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NamespacedKeyValue {
    pub namespace: String,
    pub key: String,
    pub value: serde_json::Value,
    pub schema: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NamespacedKeyValue {
    pub async fn get(pool: &PgPool, namespace: &str, key: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM namespaced_keyvalues WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .fetch_optional(pool)
            .await
    }

    /// Entries whose key starts with `key_prefix`, ordered by key.
    pub async fn list_by_prefix(pool: &PgPool, namespace: &str, key_prefix: &str) -> sqlx::Result<Vec<Self>> {
        let pattern = format!("{}%", escape_like(key_prefix));
        sqlx::query_as(
            "SELECT * FROM namespaced_keyvalues WHERE namespace = $1 AND key LIKE $2 ESCAPE '\\' ORDER BY key",
        )
        .bind(namespace)
        .bind(pattern)
        .fetch_all(pool)
        .await
    }

    pub async fn upsert(
        pool: &PgPool,
        namespace: &str,
        key: &str,
        value: &serde_json::Value,
        schema: Option<&serde_json::Value>,
    ) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO namespaced_keyvalues (namespace, key, value, schema)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (namespace, key)
               DO UPDATE SET value = EXCLUDED.value, schema = EXCLUDED.schema, updated_at = now()
               RETURNING *"#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .bind(schema)
        .fetch_one(pool)
        .await
    }

    /// Returns `true` if a row was deleted.
    pub async fn delete(pool: &PgPool, namespace: &str, key: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM namespaced_keyvalues WHERE namespace = $1 AND key = $2")
            .bind(namespace)
            .bind(key)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ── Lock ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Lock {
    pub id: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lock {
    /// Insert the lock row if absent. Returns `true` when this call took it.
    pub async fn try_acquire(pool: &PgPool, id: &str, owner: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("INSERT INTO locks (id, owner) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(id)
            .bind(owner)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete the lock, optionally only if held by `owner`. Returns `true`
    /// if a row was deleted.
    pub async fn release(pool: &PgPool, id: &str, owner: Option<&str>) -> sqlx::Result<bool> {
        let result = match owner {
            Some(owner) => {
                sqlx::query("DELETE FROM locks WHERE id = $1 AND owner = $2")
                    .bind(id)
                    .bind(owner)
                    .execute(pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM locks WHERE id = $1")
                    .bind(id)
                    .execute(pool)
                    .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    pub async fn list(pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM locks ORDER BY acquired_at")
            .fetch_all(pool)
            .await
    }
}

// ── SessionPlacement ────────────────────────────────────────────────

/// Where a session's container runs and how it is reached.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SessionPlacement {
    pub session_id: String,
    pub container_name: String,
    pub host_id: String,
    pub docker_url: String,
    pub proxy_route: String,
    pub mapped_port: i32,
    pub endpoint: String,
    pub password: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewSessionPlacement<'a> {
    pub session_id: &'a str,
    pub container_name: &'a str,
    pub host_id: &'a str,
    pub docker_url: &'a str,
    pub proxy_route: &'a str,
    pub mapped_port: i32,
    pub endpoint: &'a str,
    pub password: Option<&'a str>,
}

impl SessionPlacement {
    pub async fn insert(pool: &PgPool, p: &NewSessionPlacement<'_>) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO session_placements (session_id, container_name, host_id, docker_url, proxy_route, mapped_port, endpoint, password)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
               RETURNING *"#,
        )
        .bind(p.session_id)
        .bind(p.container_name)
        .bind(p.host_id)
        .bind(p.docker_url)
        .bind(p.proxy_route)
        .bind(p.mapped_port)
        .bind(p.endpoint)
        .bind(p.password)
        .fetch_one(pool)
        .await
    }

    pub async fn get(pool: &PgPool, session_id: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM session_placements WHERE session_id = $1")
            .bind(session_id)
            .fetch_optional(pool)
            .await
    }

    pub async fn delete(pool: &PgPool, session_id: &str) -> sqlx::Result<()> {
        sqlx::query("DELETE FROM session_placements WHERE session_id = $1")
            .bind(session_id)
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::escape_like;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("pool_vm_"), "pool\\_vm\\_");
        assert_eq!(escape_like("100%"), "100\\%");
    }
}
