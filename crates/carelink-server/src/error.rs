//! Error types for the HTTP surface.
//!
//! [`ApiError`] wraps every failure a handler can produce and converts into
//! an Axum response via its [`IntoResponse`] implementation. The body is
//! always `{"error", "status"}`, plus `current_status` for state conflicts.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use carelink_core::DispatchError;
use carelink_types::ErrorNotice;

use crate::auth::AuthError;

/// Errors returned by REST handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A core operation failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The caller could not be authenticated.
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AuthError),
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Dispatch(DispatchError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Dispatch(DispatchError::StateConflict { .. }) => StatusCode::CONFLICT,
            Self::Dispatch(DispatchError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Dispatch(DispatchError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Self::Dispatch(DispatchError::Dependency(_)) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// Short machine-readable code, shared with socket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Dispatch(e) => dispatch_code(e),
            Self::Unauthorized(_) => "unauthorized",
        }
    }
}

/// Machine-readable code for a core error.
pub fn dispatch_code(err: &DispatchError) -> &'static str {
    match err {
        DispatchError::Validation(_) => "validation",
        DispatchError::StateConflict { .. } => "state_conflict",
        DispatchError::NotFound(_) => "not_found",
        DispatchError::Forbidden(_) => "forbidden",
        DispatchError::Dependency(_) => "dependency",
    }
}

/// Socket error frame for a core error.
pub fn error_notice(err: &DispatchError) -> ErrorNotice {
    ErrorNotice {
        code: dispatch_code(err).to_owned(),
        message: err.to_string(),
        current_status: err.current_status().map(str::to_owned),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed on a dependency");
        }

        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
            "status": status.as_u16(),
        });
        if let Self::Dispatch(e) = &self {
            if let Some(actual) = e.current_status() {
                body["current_status"] = serde_json::Value::from(actual);
            }
        }

        (status, axum::Json(body)).into_response()
    }
}
