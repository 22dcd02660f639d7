use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::RegistryError;
use thiserror::Error;

/// Error type returned by every handler.
#[derive(Debug, Error)]
pub enum AppError {
    /// The request itself was malformed (bad run id, invalid organization).
    #[error("{0}")]
    BadRequest(String),

    /// A registry operation was refused; mapped to 404, 409 or 500.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl AppError {
    /// Shorthand for a 400 with `msg` as the error body.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Registry(e) => match e {
                RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
                RegistryError::AlreadyFinished(_)
                | RegistryError::StillRunning(_)
                | RegistryError::NothingToRetry(_) => StatusCode::CONFLICT,
                RegistryError::Abandoned(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
