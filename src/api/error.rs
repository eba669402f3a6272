use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::store::StoreError;

/// JSON error body: a short status text plus the detailed error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    code: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(code: StatusCode, status: &'static str, error: impl ToString) -> Self {
        Self {
            code,
            body: ErrorBody {
                status,
                error: error.to_string(),
            },
        }
    }

    pub fn invalid_request(error: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid request.", error)
    }

    pub fn invalid_job_request(error: impl ToString) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "Invalid job request.", error)
    }

    pub fn not_found(error: impl ToString) -> Self {
        Self::new(StatusCode::NOT_FOUND, "Not Found.", error)
    }

    pub fn internal(error: impl ToString) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Error.", error)
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Full => Self::new(StatusCode::SERVICE_UNAVAILABLE, "Unavailable.", e),
            StoreError::JobNotFound(_) => Self::not_found(e),
            other => {
                tracing::error!(error = %other, "Job store request failed");
                Self::internal(other)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.code, Json(self.body)).into_response()
    }
}
