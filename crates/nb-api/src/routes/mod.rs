pub mod locks;
pub mod pool;
pub mod sessions;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Sessions
        .route("/sessions", post(sessions::create_session))
        .route(
            "/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/sessions/{id}/logs", get(sessions::session_logs))
        // Pool
        .route("/pool/housekeep", post(pool::housekeep))
        .route("/pool/hosts", get(pool::list_hosts))
        .route("/pool/config", get(pool::get_config).put(pool::put_config))
        // Locks
        .route("/locks", get(locks::list_locks))
        .route("/locks/{id}", delete(locks::release_lock))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use nb_driver::lock::PoolLock;
    use nb_driver::testing::{TestPool, session_request};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::config::AppConfig;
    use crate::placements::memory::MemoryPlacements;

    const KEY: &str = "test-key";

    fn app(pool: &TestPool) -> Router {
        let config = AppConfig {
            database_url: "postgres://unused".into(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            control_plane_api_key: KEY.into(),
            housekeep_interval_secs: 30,
            public_ipv4: "192.0.2.10".into(),
            external_https_port: 8443,
            session_timezone: "UTC".into(),
            runtime_dir: "/tmp".into(),
            ssh_public_key_file: "/tmp/id.pub".into(),
            ssh_private_key_file: "/tmp/id".into(),
            docker_cert_dir: "/tmp".into(),
            prepare_playbook: "site.yml".into(),
            image_dir: "/tmp".into(),
            proxy_conf_dir: "/tmp".into(),
            proxy_reload_command: Vec::new(),
        };
        api_router(AppState {
            driver: pool.driver.clone(),
            placements: Arc::new(MemoryPlacements::default()),
            config,
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {KEY}"));
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_key() {
        let pool = TestPool::new().await;
        let app = app(&pool);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/pool/hosts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/pool/hosts")
                    .header("authorization", "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn session_lifecycle_over_http() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let app = app(&pool);

        let (status, body) = call(&app, Method::POST, "/pool/housekeep", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "spawned");
        let (_, body) = call(&app, Method::POST, "/pool/housekeep", None).await;
        assert_eq!(body["action"], "activated");

        let request = serde_json::to_value(session_request("sess-1", "pb-sess-1")).unwrap();
        let (status, placed) = call(&app, Method::POST, "/sessions", Some(request.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(placed["session_id"], "sess-1");
        assert_eq!(placed["container_name"], "pb-sess-1");
        let route = placed["proxy_route"].as_str().unwrap().to_string();
        assert!(pool.proxy.routes().contains_key(&route));

        let (status, _) = call(&app, Method::POST, "/sessions", Some(request)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, fetched) = call(&app, Method::GET, "/sessions/sess-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["endpoint"], placed["endpoint"]);

        let docker_url = placed["docker_url"].as_str().unwrap();
        pool.docker.daemon(docker_url).set_logs("pb-sess-1", "Jupyter Server is running\n");
        let (status, logs) = call(&app, Method::GET, "/sessions/sess-1/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(logs["logs"], "Jupyter Server is running\n");

        let (status, _) = call(&app, Method::DELETE, "/sessions/sess-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(pool.proxy.routes().is_empty());

        let (status, _) = call(&app, Method::GET, "/sessions/sess-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_of_unknown_session_are_not_found() {
        let pool = TestPool::new().await;
        let app = app(&pool);
        let (status, _) = call(&app, Method::GET, "/sessions/nope/logs", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsafe_session_id_is_a_bad_request() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        let app = app(&pool);

        let request = serde_json::to_value(session_request("a\";}", "pb-bad")).unwrap();
        let (status, body) = call(&app, Method::POST, "/sessions", Some(request)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("session id"));
    }

    #[tokio::test]
    async fn abandoned_request_still_records_placement() {
        let pool = TestPool::new().await;
        pool.set_config(|c| c.shutdown_mode = false).await;
        pool.spawn_and_activate(0).await;
        pool.proxy.delay_adds(std::time::Duration::from_millis(500));
        let app = app(&pool);

        let request = serde_json::to_value(session_request("sess-1", "pb-sess-1")).unwrap();
        let client = {
            let app = app.clone();
            tokio::spawn(async move { call(&app, Method::POST, "/sessions", Some(request)).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        client.abort();
        assert!(client.await.unwrap_err().is_cancelled());

        tokio::time::sleep(std::time::Duration::from_millis(1000)).await;
        let (status, stored) = call(&app, Method::GET, "/sessions/sess-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(pool.proxy.routes().contains_key(stored["proxy_route"].as_str().unwrap()));
        assert!(pool.lock.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn no_capacity_is_retriable() {
        let pool = TestPool::new().await;
        let app = app(&pool);

        let request = serde_json::to_value(session_request("sess-1", "pb-sess-1")).unwrap();
        let (status, body) = call(&app, Method::POST, "/sessions", Some(request)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retriable"], true);
    }

    #[tokio::test]
    async fn config_is_validated_on_replace() {
        let pool = TestPool::new().await;
        let app = app(&pool);

        let (status, mut config) = call(&app, Method::GET, "/pool/config", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(config["SHUTDOWN_MODE"], true);

        config["SHUTDOWN_MODE"] = json!(false);
        config["MAX_HOSTS"] = json!(2);
        let (status, stored) = call(&app, Method::PUT, "/pool/config", Some(config.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["MAX_HOSTS"], 2);

        config["MAX_HOSTS"] = json!(0);
        let (status, body) = call(&app, Method::PUT, "/pool/config", Some(config)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("MAX_HOSTS"));
    }

    #[tokio::test]
    async fn stuck_lock_can_be_force_released() {
        let pool = TestPool::new().await;
        let app = app(&pool);
        pool.lock.try_acquire("dd_host:global", "crashed/housekeep").await.unwrap();

        let (status, locks) = call(&app, Method::GET, "/locks", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(locks[0]["owner"], "crashed/housekeep");

        let (status, _) = call(&app, Method::DELETE, "/locks/dd_host:global?owner=someone-else", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::DELETE, "/locks/dd_host:global", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, Method::DELETE, "/locks/dd_host:global", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
