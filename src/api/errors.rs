use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::services::errors::ServiceError;
use crate::services::ingestion::SkippedEntry;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: u16,
    detail: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    essays: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    skipped: Vec<SkippedEntry>,
}

impl ErrorResponse {
    fn new(status: StatusCode, detail: String) -> Self {
        Self { status: status.as_u16(), detail, essays: Vec::new(), skipped: Vec::new() }
    }
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Unauthorized(&'static str),
    BadRequest(String),
    /// Validation failure that also reports which upload entries were skipped.
    Rejected { detail: String, skipped: Vec<SkippedEntry> },
    NotFound(String),
    Conflict(String),
    ReviewIncomplete { detail: String, essays: Vec<Uuid> },
    TooManyRequests(&'static str),
    ServiceUnavailable(String),
    Internal(String),
}

impl ApiError {
    /// Log the underlying error with context and return an `Internal` variant.
    pub(crate) fn internal(err: impl std::fmt::Display, context: &str) -> Self {
        tracing::error!(error = %err, "{context}");
        Self::Internal(context.to_string())
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let detail = err.to_string();
        match err {
            ServiceError::Validation { message, skipped } if !skipped.is_empty() => {
                ApiError::Rejected { detail: message, skipped }
            }
            ServiceError::Validation { .. } | ServiceError::UnsupportedFileType(_) => {
                ApiError::BadRequest(detail)
            }
            ServiceError::NotFound(what) => ApiError::NotFound(capitalized(what) + " not found"),
            ServiceError::ReferencedResource(_)
            | ServiceError::IncompleteReview(_)
            | ServiceError::InvalidTransition { .. }
            | ServiceError::Conflict(_) => ApiError::Conflict(detail),
            ServiceError::ReviewIncomplete { unreviewed } => {
                ApiError::ReviewIncomplete { detail, essays: unreviewed }
            }
            ServiceError::Unavailable(what) => ApiError::ServiceUnavailable(what.to_string()),
            ServiceError::Store(err) => ApiError::internal(format!("{err:#}"), "Storage failure"),
        }
    }
}

fn capitalized(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(message) => {
                let status = StatusCode::UNAUTHORIZED;
                let mut response =
                    (status, Json(ErrorResponse::new(status, message.to_string()))).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            ApiError::BadRequest(message) => {
                let status = StatusCode::BAD_REQUEST;
                (status, Json(ErrorResponse::new(status, message))).into_response()
            }
            ApiError::Rejected { detail, skipped } => {
                let status = StatusCode::BAD_REQUEST;
                let body = ErrorResponse { skipped, ..ErrorResponse::new(status, detail) };
                (status, Json(body)).into_response()
            }
            ApiError::NotFound(message) => {
                let status = StatusCode::NOT_FOUND;
                (status, Json(ErrorResponse::new(status, message))).into_response()
            }
            ApiError::Conflict(message) => {
                let status = StatusCode::CONFLICT;
                (status, Json(ErrorResponse::new(status, message))).into_response()
            }
            ApiError::ReviewIncomplete { detail, essays } => {
                let status = StatusCode::CONFLICT;
                let body = ErrorResponse { essays, ..ErrorResponse::new(status, detail) };
                (status, Json(body)).into_response()
            }
            ApiError::TooManyRequests(message) => {
                let status = StatusCode::TOO_MANY_REQUESTS;
                (status, Json(ErrorResponse::new(status, message.to_string()))).into_response()
            }
            ApiError::ServiceUnavailable(message) => {
                tracing::error!(error = %message, "Service unavailable");
                let status = StatusCode::SERVICE_UNAVAILABLE;
                (status, Json(ErrorResponse::new(status, message))).into_response()
            }
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "Internal server error");
                let status = StatusCode::INTERNAL_SERVER_ERROR;
                (status, Json(ErrorResponse::new(status, message))).into_response()
            }
        }
    }
}
