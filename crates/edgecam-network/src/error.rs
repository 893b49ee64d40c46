use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use edgecam_types::EdgecamError;
use serde_json::json;

/// Handler error rendered as `{"error": .., "code": ..}`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Edgecam(#[from] EdgecamError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn status(&self) -> (StatusCode, &'static str) {
        let AppError::Edgecam(err) = self;
        match err {
            EdgecamError::Capture(_) => (StatusCode::SERVICE_UNAVAILABLE, "CAPTURE_FAILED"),
            EdgecamError::Upload(_) | EdgecamError::Network(_) => {
                (StatusCode::BAD_GATEWAY, "UPLOAD_FAILED")
            }
            EdgecamError::ConfigMissing(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_MISSING")
            }
            EdgecamError::TwinParse(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        } else {
            tracing::warn!(error = %self, code, "Request rejected");
        }

        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}
