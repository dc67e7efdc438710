use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use nb_driver::{ReapRequest, SessionRequest};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::placements::StoredPlacement;
use crate::state::AppState;

/// Placement runs in its own task: a client hanging up must not cancel it
/// between starting the container and recording it.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<SessionRequest>,
) -> Result<(StatusCode, Json<StoredPlacement>), ApiError> {
    if state.placements.get(&req.session_id).await?.is_some() {
        return Err(ApiError::Conflict(format!("session {} is already placed", req.session_id)));
    }

    let stored = tokio::spawn(place_and_record(state, req)).await??;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn place_and_record(state: AppState, req: SessionRequest) -> Result<StoredPlacement, ApiError> {
    let placement = state.driver.provision(&req).await?;
    match state.placements.insert(&req.session_id, &placement).await {
        Ok(stored) => Ok(stored),
        Err(e) => {
            // Without a stored placement nobody could reap this session.
            tracing::error!(session_id = %req.session_id, error = %e, "failed to store placement");
            let reap = ReapRequest::for_placement(req.session_id.as_str(), &placement);
            if let Err(reap_err) = state.driver.deprovision(&reap).await {
                tracing::error!(session_id = %req.session_id, error = %reap_err, "failed to reap unstored session");
            }
            Err(e.into())
        }
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<StoredPlacement>, ApiError> {
    let stored = state.placements.get(&session_id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(stored))
}

pub async fn session_logs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stored = state.placements.get(&session_id).await?.ok_or(ApiError::NotFound)?;
    let logs = state.driver.session_logs(&stored.placement).await?;
    Ok(Json(json!({ "session_id": session_id, "logs": logs })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let stored = state.placements.get(&session_id).await?.ok_or(ApiError::NotFound)?;

    tokio::spawn(async move {
        state
            .driver
            .deprovision(&ReapRequest::for_placement(session_id.as_str(), &stored.placement))
            .await?;
        state.placements.delete(&session_id).await?;
        Ok::<_, ApiError>(())
    })
    .await??;
    Ok(StatusCode::NO_CONTENT)
}
