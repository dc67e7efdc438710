use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nb_driver::docker::DockerError;
use nb_driver::lock::LockError;
use nb_driver::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Driver(#[from] nb_driver::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        use nb_driver::Error as E;

        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Database(sqlx::Error::RowNotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Driver(e) if e.is_retriable() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Driver(E::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Driver(E::Store(StoreError::Invalid { .. } | StoreError::Malformed { .. })) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Driver(E::Lock(LockError::NotHeld { .. })) => StatusCode::NOT_FOUND,
            ApiError::Driver(E::Cloud(_) | E::Docker(DockerError::Api { .. }) | E::PortMapping(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ApiError::Driver(_) | ApiError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = match &self {
            ApiError::Driver(e) if e.is_retriable() => {
                serde_json::json!({ "error": self.to_string(), "retriable": true })
            }
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, axum::Json(body)).into_response()
    }
}
