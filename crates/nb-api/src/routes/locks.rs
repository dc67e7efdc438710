use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use nb_driver::lock::LockInfo;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub owner: Option<String>,
}

pub async fn list_locks(State(state): State<AppState>) -> Result<Json<Vec<LockInfo>>, ApiError> {
    let locks = state
        .driver
        .pool_lock()
        .list()
        .await
        .map_err(nb_driver::Error::from)?;
    Ok(Json(locks))
}

/// Release a lock. Without `owner` the release is forced.
pub async fn release_lock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .driver
        .pool_lock()
        .release(&id, query.owner.as_deref())
        .await
        .map_err(nb_driver::Error::from)?;
    tracing::warn!(lock_id = %id, owner = ?query.owner, "lock released through the API");
    Ok(StatusCode::NO_CONTENT)
}
