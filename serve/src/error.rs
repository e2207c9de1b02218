//! Maps [`WardenError`] onto HTTP status codes (spec §7).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use warden::WardenError;

/// Newtype so `?` works in handlers while keeping the status mapping in one place.
pub struct ApiError(pub WardenError);

impl From<WardenError> for ApiError {
    fn from(e: WardenError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WardenError::NotFound(_) => StatusCode::NOT_FOUND,
            WardenError::BadRequest(_) | WardenError::FormatMismatch(_) => StatusCode::BAD_REQUEST,
            WardenError::ThreadBusy => StatusCode::CONFLICT,
            WardenError::ToolForbidden(_) => StatusCode::FORBIDDEN,
            WardenError::LlmError { .. } | WardenError::BackendError(_) => StatusCode::BAD_GATEWAY,
            WardenError::IterationCap => StatusCode::INTERNAL_SERVER_ERROR,
            WardenError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        };
        (status, Json(self.0.to_response_body())).into_response()
    }
}
