use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fabric_sandbox::{ErrorBody, SandboxError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("warm pool entry {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let (status, code) = match self {
            PoolError::Sandbox(inner) => return inner.into_response(),
            PoolError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            PoolError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        let body = ErrorBody {
            code: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
