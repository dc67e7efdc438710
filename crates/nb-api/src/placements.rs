use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nb_db::models::{NewSessionPlacement, SessionPlacement};
use nb_driver::Placement;
use serde::Serialize;
use sqlx::PgPool;

/// A placement as remembered by the control API.
#[derive(Debug, Clone, Serialize)]
pub struct StoredPlacement {
    pub session_id: String,
    #[serde(flatten)]
    pub placement: Placement,
    pub created_at: DateTime<Utc>,
}

/// Where session placements are kept between provision and teardown.
#[async_trait]
pub trait PlacementStore: Send + Sync + 'static {
    async fn insert(&self, session_id: &str, placement: &Placement) -> sqlx::Result<StoredPlacement>;

    async fn get(&self, session_id: &str) -> sqlx::Result<Option<StoredPlacement>>;

    async fn delete(&self, session_id: &str) -> sqlx::Result<()>;
}

pub struct PgPlacements {
    pool: PgPool,
}

impl PgPlacements {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: SessionPlacement) -> sqlx::Result<StoredPlacement> {
    let mapped_port = u16::try_from(row.mapped_port).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(StoredPlacement {
        session_id: row.session_id,
        placement: Placement {
            host_id: row.host_id,
            docker_url: row.docker_url,
            proxy_route: row.proxy_route,
            mapped_port,
            endpoint: row.endpoint,
            container_name: row.container_name,
            password: row.password,
        },
        created_at: row.created_at,
    })
}

#[async_trait]
impl PlacementStore for PgPlacements {
    async fn insert(&self, session_id: &str, placement: &Placement) -> sqlx::Result<StoredPlacement> {
        let row = SessionPlacement::insert(
            &self.pool,
            &NewSessionPlacement {
                session_id,
                container_name: &placement.container_name,
                host_id: &placement.host_id,
                docker_url: &placement.docker_url,
                proxy_route: &placement.proxy_route,
                mapped_port: i32::from(placement.mapped_port),
                endpoint: &placement.endpoint,
                password: placement.password.as_deref(),
            },
        )
        .await?;
        from_row(row)
    }

    async fn get(&self, session_id: &str) -> sqlx::Result<Option<StoredPlacement>> {
        SessionPlacement::get(&self.pool, session_id)
            .await?
            .map(from_row)
            .transpose()
    }

    async fn delete(&self, session_id: &str) -> sqlx::Result<()> {
        SessionPlacement::delete(&self.pool, session_id).await
    }
}

#[cfg(test)]
pub mod memory {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryPlacements {
        rows: Mutex<HashMap<String, StoredPlacement>>,
    }

    #[async_trait]
    impl PlacementStore for MemoryPlacements {
        async fn insert(&self, session_id: &str, placement: &Placement) -> sqlx::Result<StoredPlacement> {
            let stored = StoredPlacement {
                session_id: session_id.to_string(),
                placement: placement.clone(),
                created_at: Utc::now(),
            };
            self.rows
                .lock()
                .unwrap()
                .insert(session_id.to_string(), stored.clone());
            Ok(stored)
        }

        async fn get(&self, session_id: &str) -> sqlx::Result<Option<StoredPlacement>> {
            Ok(self.rows.lock().unwrap().get(session_id).cloned())
        }

        async fn delete(&self, session_id: &str) -> sqlx::Result<()> {
            self.rows.lock().unwrap().remove(session_id);
            Ok(())
        }
    }
}
