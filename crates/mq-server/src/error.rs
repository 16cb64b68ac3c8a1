//! Error-to-HTTP response conversion.
//!
//! Route handlers return `Result<T, AppError>`; any [`mq_core::Error`]
//! converts with `?`. "Still buffering" becomes a 202 with `Retry-After` so
//! players retry instead of giving up.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::middleware::request_id::RequestId;

/// Seconds a client should wait before retrying a 202.
const RETRY_AFTER_SECS: &str = "1";

/// Wrapper so we can implement `IntoResponse` for an external type.
pub struct AppError {
    inner: mq_core::Error,
    request_id: Option<String>,
}

impl AppError {
    pub fn new(inner: mq_core::Error) -> Self {
        Self {
            inner,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, id: String) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn inner(&self) -> &mq_core::Error {
        &self.inner
    }

    /// `map_err` adapter that tags errors with the request's id.
    pub fn tagged(id: &RequestId) -> impl FnOnce(mq_core::Error) -> Self + '_ {
        move |e| Self::new(e).with_request_id(id.0.clone())
    }
}

impl From<mq_core::Error> for AppError {
    fn from(e: mq_core::Error) -> Self {
        Self::new(e)
    }
}

fn error_code(err: &mq_core::Error) -> &'static str {
    use mq_core::Error;
    match err {
        Error::NotFound { .. } => "not_found",
        Error::Validation(_) => "validation_error",
        Error::Conflict(_) => "conflict",
        Error::Io { .. } => "io_error",
        Error::Tool { .. } => "tool_error",
        Error::SourceUnavailable { .. } => "source_unavailable",
        Error::EncoderLaunchFailed { .. } => "encoder_launch_failed",
        Error::EncoderCrashed { .. } => "encoder_crashed",
        Error::NeverWillExist { .. } => "segment_unreachable",
        Error::NotYetAvailable { .. } => "not_ready",
        Error::Internal(_) => "internal_error",
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.inner.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.inner, "server error in API handler");
        }

        let mut body = json!({
            "error": self.inner.to_string(),
            "code": error_code(&self.inner),
            "request_id": self.request_id,
        });
        if let mq_core::Error::EncoderLaunchFailed { failure } | mq_core::Error::EncoderCrashed { failure } =
            &self.inner
        {
            body["failure"] = serde_json::to_value(failure).unwrap_or_default();
        }

        if self.inner.is_retriable() {
            return (
                status,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
                axum::Json(body),
            )
                .into_response();
        }
        (status, axum::Json(body)).into_response()
    }
}
