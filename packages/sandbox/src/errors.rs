use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use crate::models::{ProviderKind, SandboxStatus};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("{provider} provisioning failed: {message}")]
    Provisioning {
        provider: ProviderKind,
        message: String,
    },
    #[error("command timed out after {timeout:?}")]
    ExecTimeout {
        timeout: Duration,
        stdout: String,
        stderr: String,
    },
    #[error("sandbox is {status}, expected {expected}")]
    InvalidState {
        status: SandboxStatus,
        expected: &'static str,
    },
    #[error("sandbox {0} not found")]
    NotFound(String),
    #[error("required binary '{0}' not found in PATH")]
    MissingBinary(String),
    #[error("command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn provisioning(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Provisioning {
            provider,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SandboxError::Provisioning { .. } => true,
            SandboxError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.status().is_some_and(|status| status.is_server_error())
            }
            _ => false,
        }
    }

    /// Message safe to show to the person waiting on an environment.
    pub fn user_message(&self) -> String {
        match self {
            SandboxError::Provisioning { .. } | SandboxError::Http(_) => {
                "environment unavailable, retry".to_string()
            }
            SandboxError::ExecTimeout { timeout, .. } => {
                format!("command timed out after {}s", timeout.as_secs())
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for SandboxError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            SandboxError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            SandboxError::Provisioning { .. } => (StatusCode::BAD_GATEWAY, "provisioning_failed"),
            SandboxError::ExecTimeout { .. } => (StatusCode::GATEWAY_TIMEOUT, "exec_timeout"),
            SandboxError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            SandboxError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            SandboxError::MissingBinary(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "missing_dependency")
            }
            SandboxError::CommandFailed { .. } => (StatusCode::BAD_GATEWAY, "command_failed"),
            SandboxError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            SandboxError::Http(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            SandboxError::Internal(_) | SandboxError::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        let message = match &self {
            SandboxError::Provisioning { .. } | SandboxError::Http(_) => self.user_message(),
            _ => self.to_string(),
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, code, "sandbox request failed");
        }

        let body = ErrorBody {
            code: code.to_string(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
