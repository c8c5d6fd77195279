//! HTTP-level error taxonomy
//!
//! Every variant maps to a plain-text response. Stream-level failures are
//! reported inline as JSON frames instead (see [`crate::stream`]).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use inference::GenerationError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not Found")]
    NotFound,

    #[error("{0}")]
    ModelNotReady(String),

    #[error("{0}")]
    GenerationFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ModelNotReady(_)
            | ApiError::GenerationFailure(_)
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<GenerationError> for ApiError {
    fn from(err: GenerationError) -> Self {
        match err {
            GenerationError::ModelNotReady(_) => ApiError::ModelNotReady(err.to_string()),
            GenerationError::Failure(_) => ApiError::GenerationFailure(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::BadRequest(format!("Invalid JSON: {}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [("content-type", "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
