use serde::{Deserialize, Serialize};

use crate::docker::DockerError;
use crate::driver::PoolDriver;
use crate::placer::Placement;

/// A session to tear down. Placement fields are whatever was recorded and
/// may be missing for sessions that never finished starting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapRequest {
    pub session_id: String,
    pub container_name: String,
    #[serde(default)]
    pub docker_url: Option<String>,
    #[serde(default)]
    pub proxy_route: Option<String>,
}

impl ReapRequest {
    pub fn for_placement(session_id: impl Into<String>, placement: &Placement) -> Self {
        Self {
            session_id: session_id.into(),
            container_name: placement.container_name.clone(),
            docker_url: Some(placement.docker_url.clone()),
            proxy_route: Some(placement.proxy_route.clone()),
        }
    }
}

impl PoolDriver {
    /// Remove a session's route and container. Safe to repeat.
    pub async fn deprovision(&self, request: &ReapRequest) -> crate::Result<()> {
        let owner = self.owner("deprovision");
        self.with_pool_lock(&owner, self.reap_locked(request)).await
    }

    async fn reap_locked(&self, request: &ReapRequest) -> crate::Result<()> {
        let session_id = request.session_id.as_str();

        if let Some(route) = request.proxy_route.as_deref().filter(|r| !r.is_empty()) {
            if !self.proxy.remove_route(route).await? {
                tracing::debug!(session_id, route, "proxy route already gone");
            }
        }

        let Some(docker_url) = request.docker_url.as_deref().filter(|u| !u.is_empty()) else {
            tracing::info!(session_id, "no docker host recorded, nothing to remove");
            return Ok(());
        };

        let removed = match self.docker.connect(docker_url) {
            Ok(docker) => docker.remove_container(&request.container_name, true).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => {
                tracing::info!(session_id, container = %request.container_name, "container removed");
                Ok(())
            }
            Err(DockerError::NotFound(_)) => {
                tracing::info!(session_id, container = %request.container_name, "container already removed");
                Ok(())
            }
            Err(DockerError::Transient(e)) => {
                tracing::info!(
                    session_id,
                    docker_url,
                    error = %e,
                    "docker host unreachable, assuming it was torn down"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPool, session_request};

    async fn placed(pool: &TestPool) -> Placement {
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        pool.driver
            .provision_at(&session_request("sess-1", "pb-sess-1"), 120)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reap_removes_route_and_container() {
        let pool = TestPool::new().await;
        let placement = placed(&pool).await;

        let request = ReapRequest::for_placement("sess-1", &placement);
        pool.driver.deprovision(&request).await.unwrap();

        assert!(pool.proxy.routes().is_empty());
        assert!(pool.docker.daemon(&placement.docker_url).container_names().is_empty());

        // A second reap finds nothing and still succeeds.
        pool.driver.deprovision(&request).await.unwrap();
    }

    #[tokio::test]
    async fn reap_without_placement_is_a_no_op() {
        let pool = TestPool::new().await;
        let request = ReapRequest {
            session_id: "sess-9".into(),
            container_name: "pb-sess-9".into(),
            ..Default::default()
        };
        pool.driver.deprovision(&request).await.unwrap();
        assert!(pool.driver.pool_lock().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reap_on_vanished_host_succeeds() {
        let pool = TestPool::new().await;
        let placement = placed(&pool).await;
        pool.docker.daemon(&placement.docker_url).set_unreachable(true);

        pool.driver
            .deprovision(&ReapRequest::for_placement("sess-1", &placement))
            .await
            .unwrap();
        assert!(pool.proxy.routes().is_empty());
    }

    #[tokio::test]
    async fn other_docker_errors_propagate() {
        let pool = TestPool::new().await;
        let placement = placed(&pool).await;
        pool.docker.daemon(&placement.docker_url).fail_removals_with(500);

        let err = pool
            .driver
            .deprovision(&ReapRequest::for_placement("sess-1", &placement))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Docker(DockerError::Api { status: 500, .. })));
        assert!(pool.driver.pool_lock().list().await.unwrap().is_empty());
    }
}
