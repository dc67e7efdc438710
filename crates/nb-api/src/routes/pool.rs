use axum::Json;
use axum::extract::State;
use nb_driver::scheduler::PoolStatus;
use nb_driver::BackendConfig;
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::AppState;

/// Run one housekeeping tick now. The tick is detached from the request so
/// a spawned server is always recorded.
pub async fn housekeep(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let driver = state.driver.clone();
    let body = match tokio::spawn(async move { driver.housekeep().await }).await?? {
        Some(action) => json!(action),
        None => json!({ "action": "skipped" }),
    };
    Ok(Json(body))
}

pub async fn list_hosts(State(state): State<AppState>) -> Result<Json<PoolStatus>, ApiError> {
    Ok(Json(state.driver.pool_status().await?))
}

pub async fn get_config(State(state): State<AppState>) -> Result<Json<BackendConfig>, ApiError> {
    let config = state
        .driver
        .records()
        .load_config()
        .await
        .map_err(nb_driver::Error::from)?;
    Ok(Json(config))
}

/// Replace the backend config. The document is validated before it is stored.
pub async fn put_config(
    State(state): State<AppState>,
    Json(doc): Json<Value>,
) -> Result<Json<BackendConfig>, ApiError> {
    let records = state.driver.records();
    records
        .save_config_document(&doc)
        .await
        .map_err(nb_driver::Error::from)?;
    let config = records.load_config().await.map_err(nb_driver::Error::from)?;
    tracing::info!(shutdown_mode = config.shutdown_mode, max_hosts = config.max_hosts, "backend config replaced");
    Ok(Json(config))
}
