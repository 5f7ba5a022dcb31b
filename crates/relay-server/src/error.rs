use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_core::ReplayError;
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    /// A backing store refused the operation.
    Upstream(String),
    /// The server is shutting down.
    Unavailable(String),
}

pub type Result<T> = core::result::Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
        };

        let body = Json(json!({
            "error": {
                "message": error_message
            }
        }));

        (status, body).into_response()
    }
}

impl From<ReplayError> for ApiError {
    fn from(err: ReplayError) -> Self {
        match err {
            ReplayError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ReplayError::NotReplayable(_) | ReplayError::InProgress(_) => {
                ApiError::Conflict(err.to_string())
            }
            ReplayError::Store { .. } => ApiError::Upstream(err.to_string()),
        }
    }
}
