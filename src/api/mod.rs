//! HTTP surface over the job manager.

mod render;
mod routes;

pub use render::{analysis_markdown, summary_text};

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::error::Error;
use crate::jobs::JobManager;

/// Uploads above this are rejected before the handler runs.
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub jobs: JobManager,
}

impl AppState {
    pub fn new(jobs: JobManager) -> Self {
        Self { jobs }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/jobs", post(routes::submit_job).get(routes::list_jobs))
        .route("/jobs/:job_id", axum::routing::delete(routes::cancel_job))
        .route("/jobs/:job_id/retry", post(routes::retry_job))
        .route("/status/:job_id", get(routes::job_status))
        .route("/status/:job_id/stream", get(routes::status_stream))
        .route("/summary/:job_id", get(routes::job_summary))
        .route("/analysis/:job_id", get(routes::job_analysis))
        .route("/admin/stalled", get(routes::stalled_jobs))
        .route("/advisors/:advisor_id/coverage", get(routes::advisor_coverage))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_code: String,
    message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: String,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code: error_code.into(),
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", message)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Validation(_) | Error::UnsupportedMode(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition { .. } | Error::NotReady(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, code = err.code(), "Request failed");
        }
        Self::new(status, err.code(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}
