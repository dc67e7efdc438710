mod auth;
mod config;
mod error;
mod housekeeper;
mod placements;
mod routes;
mod state;

use std::sync::Arc;

use nb_driver::docker::{BollardConnector, DockerConnector};
use nb_driver::lock::PgPoolLock;
use nb_driver::prepare::AnsiblePreparer;
use nb_driver::proxy::NginxRouter;
use nb_driver::store::PgRecordStore;
use nb_driver::{Collaborators, PoolDriver};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::housekeeper::spawn_housekeeper;
use crate::placements::PgPlacements;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Database
    let db = nb_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");

    nb_db::run_migrations(&db)
        .await
        .expect("failed to run migrations");

    let cloud = nb_infra::build_provider().expect("failed to build cloud provider");
    let ssh_public_key = std::fs::read_to_string(&config.ssh_public_key_file)
        .expect("failed to read SSH public key")
        .trim()
        .to_string();

    let docker: Arc<dyn DockerConnector> = Arc::new(BollardConnector::new(&config.docker_cert_dir));
    let preparer = AnsiblePreparer::new(
        &config.prepare_playbook,
        &config.ssh_private_key_file,
        &config.image_dir,
        docker.clone(),
    );
    let proxy = NginxRouter::new(&config.proxy_conf_dir, config.external_https_port)
        .with_reload_command(config.proxy_reload_command.clone());

    let driver = Arc::new(PoolDriver::new(
        Collaborators {
            cloud,
            docker,
            preparer: Arc::new(preparer),
            proxy: Arc::new(proxy),
            store: Arc::new(PgRecordStore::new(db.clone())),
            lock: Arc::new(PgPoolLock::new(db.clone())),
        },
        config.driver_settings(ssh_public_key),
    ));

    let backend = driver
        .records()
        .ensure_config()
        .await
        .expect("failed to load backend config");
    tracing::info!(
        shutdown_mode = backend.shutdown_mode,
        max_hosts = backend.max_hosts,
        free_slot_target = backend.free_slot_target,
        "backend config loaded"
    );

    spawn_housekeeper(driver.clone(), config.housekeep_interval_secs);

    let state = AppState {
        driver,
        placements: Arc::new(PgPlacements::new(db)),
        config: config.clone(),
    };

    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting pool control API");

    axum::serve(listener, app).await.expect("server error");
}
